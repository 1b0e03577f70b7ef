// =============================================================================
// models.rs - THE SHAPES THAT FLOW THROUGH THE PIPELINE
// =============================================================================
//
// Seven tribunals, one search endpoint, and rows that arrive as whatever JSON
// the judiciary felt like returning that day. This module pins all of that down
// into types: the fixed tribunal catalogue, the page request we send, the raw
// rows we get back, and the normalized SentenceRecord we eventually upsert.
//
// Column names on SentenceRecord are Spanish because the table they land in is
// Spanish. Field names in Rust are English because the compiler is not.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The seven court categories the upstream search exposes. Each one is an
/// independent crawl target with its own search id, its own context slug and
/// its own `busqueda` header value. The upstream refuses the search if the
/// header doesn't match the id, so these three always travel together.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tribunal {
    #[serde(rename = "Corte_Suprema")]
    CorteSuprema,
    #[serde(rename = "Corte_de_Apelaciones")]
    CorteApelaciones,
    #[serde(rename = "Laborales")]
    Laborales,
    #[serde(rename = "Penales")]
    Penales,
    #[serde(rename = "Familia")]
    Familia,
    #[serde(rename = "Civiles")]
    Civiles,
    #[serde(rename = "Cobranza")]
    Cobranza,
}

impl Tribunal {
    pub const ALL: [Tribunal; 7] = [
        Tribunal::CorteSuprema,
        Tribunal::CorteApelaciones,
        Tribunal::Laborales,
        Tribunal::Penales,
        Tribunal::Familia,
        Tribunal::Civiles,
        Tribunal::Cobranza,
    ];

    /// The `id_buscador` the search endpoint expects.
    pub fn search_id(&self) -> u32 {
        match self {
            Tribunal::CorteSuprema => 528,
            Tribunal::CorteApelaciones => 168,
            Tribunal::Laborales => 271,
            Tribunal::Penales => 268,
            Tribunal::Familia => 270,
            Tribunal::Civiles => 328,
            Tribunal::Cobranza => 269,
        }
    }

    /// Slug used in the context URL (`/busqueda?{slug}`), in progress file
    /// names and in the `tribunal` column of the store.
    pub fn slug(&self) -> &'static str {
        match self {
            Tribunal::CorteSuprema => "Corte_Suprema",
            Tribunal::CorteApelaciones => "Corte_de_Apelaciones",
            Tribunal::Laborales => "Laborales",
            Tribunal::Penales => "Penales",
            Tribunal::Familia => "Familia",
            Tribunal::Civiles => "Civiles",
            Tribunal::Cobranza => "Cobranza",
        }
    }

    /// Human-readable name for progress output.
    pub fn name(&self) -> &'static str {
        match self {
            Tribunal::CorteSuprema => "Corte Suprema",
            Tribunal::CorteApelaciones => "Cortes de Apelaciones",
            Tribunal::Laborales => "Tribunales Laborales",
            Tribunal::Penales => "Tribunales Penales",
            Tribunal::Familia => "Tribunales de Familia",
            Tribunal::Civiles => "Tribunales Civiles",
            Tribunal::Cobranza => "Tribunales de Cobranza",
        }
    }

    /// Value of the `busqueda` request header. Without it the search
    /// endpoint answers with an empty shrug.
    pub fn search_header_token(&self) -> &'static str {
        match self {
            Tribunal::CorteSuprema => "Buscador_Jurisprudencial_de_la_Corte_Suprema",
            Tribunal::CorteApelaciones => "Buscador_Jurisprudencial_de_Cortes_de_Apelaciones",
            Tribunal::Laborales => "Buscador_Jurisprudencial_de_Tribunales_Laborales",
            Tribunal::Penales => "Buscador_Jurisprudencial_de_Tribunales_Penales",
            Tribunal::Familia => "Buscador_Jurisprudencial_de_Tribunales_de_Familia",
            Tribunal::Civiles => "Buscador_Jurisprudencial_de_Tribunales_Civiles",
            Tribunal::Cobranza => "Buscador_Jurisprudencial_de_Tribunales_de_Cobranza",
        }
    }

    fn alias(&self) -> &'static str {
        match self {
            Tribunal::CorteSuprema => "suprema",
            Tribunal::CorteApelaciones => "apelaciones",
            Tribunal::Laborales => "laborales",
            Tribunal::Penales => "penales",
            Tribunal::Familia => "familia",
            Tribunal::Civiles => "civiles",
            Tribunal::Cobranza => "cobranza",
        }
    }
}

impl fmt::Display for Tribunal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Tribunal {
    type Err = String;

    /// Accepts the slug, the numeric search id or the short alias, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Tribunal::ALL
            .iter()
            .copied()
            .find(|t| {
                t.slug().eq_ignore_ascii_case(wanted)
                    || t.alias().eq_ignore_ascii_case(wanted)
                    || t.search_id().to_string() == wanted
            })
            .ok_or_else(|| format!("unknown tribunal '{}'", wanted))
    }
}

/// One paginated search request. A value object; two requests with the same
/// fields are the same request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub tribunal: Tribunal,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub offset: u64,
    pub limit: u32,
    pub order: String,
}

impl PageRequest {
    /// Request for a 1-based page number.
    pub fn for_page(
        tribunal: Tribunal,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
        page: u32,
        limit: u32,
        order: &str,
    ) -> Self {
        Self {
            tribunal,
            date_from,
            date_to,
            offset: u64::from(page.saturating_sub(1)) * u64::from(limit),
            limit,
            order: order.to_string(),
        }
    }

    /// The `filtros` JSON object. Every key the upstream form knows about is
    /// present; the ones we don't use are empty, which is how the site's own
    /// JavaScript sends them.
    pub fn filters_json(&self) -> String {
        let fmt_date = |d: Option<NaiveDate>| {
            d.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default()
        };
        serde_json::json!({
            "rol": "",
            "era": "",
            "fec_desde": fmt_date(self.date_from),
            "fec_hasta": fmt_date(self.date_to),
            "tipo_norma": "",
            "num_norma": "",
            "num_art": "",
            "num_inciso": "",
            "todas": "",
            "algunas": "",
            "excluir": "",
            "literal": "",
            "proximidad": "",
            "distancia": "",
            "analisis_s": "",
            "submaterias": "",
            "facetas_seleccionadas": [],
            "filtros_omnibox": [],
            "ids_comunas_seleccionadas_mapa": []
        })
        .to_string()
    }
}

/// A row exactly as the search API returned it. Consumed immediately by the
/// mapper and never stored.
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// Envelope of the search response: `{response: {numFound, docs}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    pub response: Option<SearchBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchBody {
    #[serde(rename = "numFound")]
    pub num_found: Option<u64>,
    #[serde(default)]
    pub docs: Vec<RawRow>,
}

/// A successfully fetched page: the total the upstream claims to have, and the
/// rows on this page.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub num_found: u64,
    pub rows: Vec<RawRow>,
}

/// Tribunal + docket number + era. Unique within a tribunal; used as the
/// conflict target of the upsert and as the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub tribunal: Tribunal,
    pub rol: String,
    pub era: String,
}

impl NaturalKey {
    /// Split a docket like `2774-2007` into rol `2774` and era `2007`.
    /// Dockets without a trailing four-digit year keep an empty era.
    /// Letter prefixes are upper-cased, so `c-12-2020` and `C-12-2020` agree.
    pub fn from_docket(tribunal: Tribunal, docket: &str) -> Self {
        let docket = docket.trim().to_uppercase();
        if let Some((rol, era)) = docket.rsplit_once('-') {
            let era = era.trim();
            if era.len() == 4 && era.bytes().all(|b| b.is_ascii_digit()) && !rol.trim().is_empty() {
                return Self {
                    tribunal,
                    rol: rol.trim().to_string(),
                    era: era.to_string(),
                };
            }
        }
        Self {
            tribunal,
            rol: docket,
            era: String::new(),
        }
    }

    /// The docket as the court writes it.
    pub fn docket(&self) -> String {
        if self.era.is_empty() {
            self.rol.clone()
        } else {
            format!("{}-{}", self.rol, self.era)
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tribunal.slug(), self.docket())
    }
}

/// The normalized record persisted downstream. Built once by the mapper,
/// never mutated, dropped after the store acknowledges it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentenceRecord {
    #[serde(flatten)]
    pub key: NaturalKey,

    #[serde(rename = "rol_completo")]
    pub docket: String,

    #[serde(rename = "caratulado")]
    pub caption: String,

    #[serde(rename = "corte")]
    pub court: String,

    #[serde(rename = "sala")]
    pub chamber: String,

    /// Null when the upstream omitted it and the text didn't give it up either.
    #[serde(rename = "fecha_sentencia")]
    pub decision_date: Option<NaiveDate>,

    #[serde(rename = "texto_completo")]
    pub full_text: Option<String>,

    #[serde(rename = "url_acceso")]
    pub access_url: String,

    #[serde(rename = "materias", default)]
    pub subjects: Vec<String>,

    #[serde(rename = "descriptores", default)]
    pub descriptors: Vec<String>,

    #[serde(rename = "ministros", default)]
    pub justices: Vec<String>,

    #[serde(rename = "redactor", default)]
    pub drafter: Option<String>,

    #[serde(rename = "fecha_descarga")]
    pub fetched_at: DateTime<Utc>,
}

impl fmt::Display for SentenceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({})",
            self.key,
            self.caption,
            self.decision_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "sin fecha".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tribunal_parses_slug_alias_and_id() {
        assert_eq!("Corte_Suprema".parse::<Tribunal>(), Ok(Tribunal::CorteSuprema));
        assert_eq!("apelaciones".parse::<Tribunal>(), Ok(Tribunal::CorteApelaciones));
        assert_eq!("LABORALES".parse::<Tribunal>(), Ok(Tribunal::Laborales));
        assert_eq!("269".parse::<Tribunal>(), Ok(Tribunal::Cobranza));
        assert!("tribunal_constitucional".parse::<Tribunal>().is_err());
    }

    #[test]
    fn test_page_request_offset_is_zero_based() {
        let first = PageRequest::for_page(Tribunal::Familia, None, None, 1, 10, "recientes");
        let third = PageRequest::for_page(Tribunal::Familia, None, None, 3, 10, "recientes");
        assert_eq!(first.offset, 0);
        assert_eq!(third.offset, 20);
    }

    #[test]
    fn test_filters_carry_date_range() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1);
        let to = NaiveDate::from_ymd_opt(2024, 1, 31);
        let req = PageRequest::for_page(Tribunal::Penales, from, to, 1, 10, "recientes");
        let filters: serde_json::Value = serde_json::from_str(&req.filters_json()).unwrap();
        assert_eq!(filters["fec_desde"], "2024-01-01");
        assert_eq!(filters["fec_hasta"], "2024-01-31");
        assert_eq!(filters["rol"], "");
    }

    #[test]
    fn test_natural_key_splits_era() {
        let key = NaturalKey::from_docket(Tribunal::CorteSuprema, " 2774-2007 ");
        assert_eq!(key.rol, "2774");
        assert_eq!(key.era, "2007");
        assert_eq!(key.docket(), "2774-2007");

        let bare = NaturalKey::from_docket(Tribunal::Civiles, "C-1234");
        assert_eq!(bare.rol, "C-1234");
        assert_eq!(bare.era, "");
    }

    #[test]
    fn test_natural_key_ignores_prefix_case() {
        let structured = NaturalKey::from_docket(Tribunal::Civiles, "c-12-2020");
        let scanned = NaturalKey::from_docket(Tribunal::Civiles, "C-12-2020");
        assert_eq!(structured, scanned);
        assert_eq!(structured.docket(), "C-12-2020");
    }

    #[test]
    fn test_record_serializes_store_columns() {
        let record = SentenceRecord {
            key: NaturalKey::from_docket(Tribunal::Laborales, "15-2023"),
            docket: "15-2023".to_string(),
            caption: "PEREZ CON FISCO".to_string(),
            court: "Juzgado de Letras del Trabajo".to_string(),
            chamber: String::new(),
            decision_date: NaiveDate::from_ymd_opt(2023, 5, 2),
            full_text: None,
            access_url: String::new(),
            subjects: vec![],
            descriptors: vec![],
            justices: vec![],
            drafter: None,
            fetched_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["tribunal"], "Laborales");
        assert_eq!(json["rol"], "15");
        assert_eq!(json["era"], "2023");
        assert_eq!(json["caratulado"], "PEREZ CON FISCO");
        assert_eq!(json["fecha_sentencia"], "2023-05-02");
        assert!(json["texto_completo"].is_null());
    }
}
