// =============================================================================
// mapper.rs - RAW ROWS IN, SENTENCE RECORDS OUT
// =============================================================================
//
// Every field of a SentenceRecord is resolved by walking an ordered list of
// strategies and keeping the first non-empty answer:
//
//   1. Structured fields of the row, in a fixed order of preference. The seven
//      search forms name the same thing differently (`rol_era_sup_s` on the
//      Supreme Court, `rol_era_ape_s` on the appeal courts, split integer
//      fields on first-instance courts).
//   2. Free-text extraction over the sentence text (see text_scanner.rs).
//
// A row that yields no usable docket number is dropped and counted. It never
// reaches the deduplicator, let alone the store.
//
// Rows of a page are independent, so a page is mapped in parallel on the
// rayon pool.
// =============================================================================

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use serde_json::Value;
use tracing::debug;

use crate::error::MappingError;
use crate::metrics::MetricsCollector;
use crate::models::{NaturalKey, RawRow, SentenceRecord, Tribunal};
use crate::text_scanner;

/// One way of finding a value in a row.
#[derive(Clone, Copy)]
pub enum Strategy {
    /// First non-empty field among these names.
    Fields(&'static [&'static str]),
    /// A number field and its year field, joined as `number-era`.
    NumberWithEra { number: &'static str, era: &'static str },
    /// A regex/automaton pass over the sentence text.
    FreeText(fn(&str) -> Option<String>),
}

impl Strategy {
    pub fn extract(&self, row: &RawRow, text: Option<&str>) -> Option<String> {
        match self {
            Strategy::Fields(names) => names.iter().find_map(|name| row.get(*name).and_then(scalar)),
            Strategy::NumberWithEra { number, era } => {
                let number = row.get(*number).and_then(scalar)?;
                match row.get(*era).and_then(scalar) {
                    Some(era) => Some(format!("{}-{}", number, era)),
                    None => Some(number),
                }
            }
            Strategy::FreeText(extract) => text.and_then(|t| extract(t)),
        }
    }
}

pub const ROL: &[Strategy] = &[
    Strategy::Fields(&["rol_era_sup_s", "rol_era_ape_s", "rol_s", "rol", "rol_numero"]),
    Strategy::NumberWithEra { number: "rol_corte_i", era: "era_corte_i" },
    Strategy::NumberWithEra { number: "rol_juz_i", era: "era_juz_i" },
    Strategy::FreeText(text_scanner::find_docket),
];

pub const CAPTION: &[Strategy] = &[Strategy::Fields(&["caratulado_s", "caratulado"])];

pub const COURT: &[Strategy] = &[
    Strategy::Fields(&["gls_corte_s", "corte", "gls_juz_s", "juzgado"]),
    Strategy::FreeText(text_scanner::find_court),
];

pub const CHAMBER: &[Strategy] = &[
    Strategy::Fields(&["gls_sala_sup_s", "sala", "gls_sala_s"]),
    Strategy::FreeText(text_scanner::find_chamber),
];

pub const DATE: &[Strategy] = &[
    Strategy::Fields(&["fec_sentencia_sup_dt", "fecha_sentencia", "fec_sentencia_dt"]),
    Strategy::FreeText(date_in_text),
];

pub const TEXT: &[Strategy] = &[Strategy::Fields(&["texto_sentencia", "texto_completo", "txt_sentencia"])];

pub const URL: &[Strategy] = &[Strategy::Fields(&["url_acceso", "url_corta"])];

const SUBJECT_FIELDS: &[&str] = &["materias", "materia_s"];
const DESCRIPTOR_FIELDS: &[&str] = &["descriptores", "descriptores_s"];
const JUSTICE_FIELDS: &[&str] = &["ministros", "ministros_s"];
const DRAFTER_FIELDS: &[&str] = &["redactor", "redactor_s"];

fn date_in_text(text: &str) -> Option<String> {
    text_scanner::find_date(text).map(|d| d.format("%Y-%m-%d").to_string())
}

/// First strategy that produces a value.
pub fn resolve(strategies: &[Strategy], row: &RawRow, text: Option<&str>) -> Option<String> {
    strategies.iter().find_map(|s| s.extract(row, text))
}

/// First strategy whose value is a real calendar date. A structured date
/// that doesn't parse lets the text have its say; if nothing parses the
/// date stays empty.
pub fn resolve_date(row: &RawRow, text: Option<&str>) -> Option<NaiveDate> {
    DATE.iter()
        .filter_map(|s| s.extract(row, text))
        .find_map(|raw| text_scanner::normalize_date(&raw))
}

/// A non-empty scalar rendered as text. Single-element arrays (Solr likes
/// those) count as their first non-empty element.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.as_u64().map(|v| v.to_string()).unwrap_or_else(|| n.to_string())),
        Value::Array(items) => items.iter().find_map(scalar),
        _ => None,
    }
}

/// All items of a list field, whether it arrives as a JSON array or as a
/// comma-separated string.
fn list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(scalar)
            .flat_map(|s| text_scanner::split_list(&s))
            .collect(),
        Value::String(s) => text_scanner::split_list(s),
        _ => Vec::new(),
    }
}

fn list_field(row: &RawRow, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .filter_map(|name| row.get(*name))
        .map(list)
        .find(|items| !items.is_empty())
        .unwrap_or_default()
}

/// Normalizes raw rows of one tribunal.
pub struct RecordMapper {
    tribunal: Tribunal,
    metrics: Arc<MetricsCollector>,
}

impl RecordMapper {
    pub fn new(tribunal: Tribunal, metrics: Arc<MetricsCollector>) -> Self {
        Self { tribunal, metrics }
    }

    pub fn tribunal(&self) -> Tribunal {
        self.tribunal
    }

    /// Map a row, reporting why it couldn't be mapped.
    pub fn try_map(&self, row: &RawRow) -> Result<SentenceRecord, MappingError> {
        let full_text = resolve(TEXT, row, None);
        let text = full_text.as_deref();

        let docket = resolve(ROL, row, text).ok_or(MappingError::MissingRol { fields: row.len() })?;
        let docket = docket.split_whitespace().collect::<Vec<_>>().join(" ");
        if !docket.bytes().any(|b| b.is_ascii_digit()) {
            return Err(MappingError::InvalidRol(docket));
        }
        let key = NaturalKey::from_docket(self.tribunal, &docket);
        if key.rol.is_empty() {
            return Err(MappingError::InvalidRol(docket));
        }

        let subjects = match list_field(row, SUBJECT_FIELDS) {
            found if !found.is_empty() => found,
            _ => text.map(text_scanner::find_subjects).unwrap_or_default(),
        };
        let descriptors = match list_field(row, DESCRIPTOR_FIELDS) {
            found if !found.is_empty() => found,
            _ => text.map(text_scanner::find_descriptors).unwrap_or_default(),
        };
        let justices = match list_field(row, JUSTICE_FIELDS) {
            found if !found.is_empty() => found,
            _ => text.map(text_scanner::find_justices).unwrap_or_default(),
        };
        let drafter = resolve(&[Strategy::Fields(DRAFTER_FIELDS)], row, None)
            .or_else(|| text.and_then(text_scanner::find_drafter));

        Ok(SentenceRecord {
            docket: key.docket(),
            key,
            caption: resolve(CAPTION, row, text).unwrap_or_default(),
            court: resolve(COURT, row, text).unwrap_or_default(),
            chamber: resolve(CHAMBER, row, text).unwrap_or_default(),
            decision_date: resolve_date(row, text),
            access_url: resolve(URL, row, None).unwrap_or_default(),
            subjects,
            descriptors,
            justices,
            drafter,
            full_text,
            fetched_at: Utc::now(),
        })
    }

    /// Map a row or drop it. Drops are logged and counted, never fatal.
    pub fn map(&self, row: &RawRow) -> Option<SentenceRecord> {
        match self.try_map(row) {
            Ok(record) => Some(record),
            Err(e) => {
                self.metrics.increment_rows_dropped();
                debug!(tribunal = %self.tribunal, error = %e, "Dropping row");
                None
            }
        }
    }

    /// Map every row of a page in parallel. Output order follows input order.
    pub fn map_page(&self, rows: &[RawRow]) -> Vec<SentenceRecord> {
        rows.par_iter().filter_map(|row| self.map(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> RawRow {
        match value {
            Value::Object(map) => map,
            _ => panic!("test rows are objects"),
        }
    }

    fn mapper(tribunal: Tribunal) -> (RecordMapper, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        (RecordMapper::new(tribunal, metrics.clone()), metrics)
    }

    #[test]
    fn test_supreme_court_structured_row() {
        let (mapper, _) = mapper(Tribunal::CorteSuprema);
        let record = mapper
            .try_map(&row(json!({
                "rol_era_sup_s": "2774-2007",
                "caratulado_s": "FISCO CON PEREZ",
                "gls_sala_sup_s": "Tercera Sala",
                "fec_sentencia_sup_dt": "2008-04-21T00:00:00Z",
                "texto_sentencia": "Santiago, veintiuno de abril...",
                "url_acceso": "https://juris.pjud.cl/busqueda/u?abc",
                "materias": ["Civil", "Tributario"],
            })))
            .unwrap();

        assert_eq!(record.key.rol, "2774");
        assert_eq!(record.key.era, "2007");
        assert_eq!(record.docket, "2774-2007");
        assert_eq!(record.caption, "FISCO CON PEREZ");
        assert_eq!(record.chamber, "Tercera Sala");
        assert_eq!(record.decision_date, NaiveDate::from_ymd_opt(2008, 4, 21));
        assert_eq!(record.access_url, "https://juris.pjud.cl/busqueda/u?abc");
        assert_eq!(record.subjects, vec!["Civil", "Tributario"]);
    }

    #[test]
    fn test_split_number_fields() {
        let (mapper, _) = mapper(Tribunal::Laborales);
        let record = mapper
            .try_map(&row(json!({"rol_juz_i": 1532, "era_juz_i": 2021, "gls_juz_s": "1° Juzgado de Letras del Trabajo de Santiago"})))
            .unwrap();
        assert_eq!(record.key.rol, "1532");
        assert_eq!(record.key.era, "2021");
        assert_eq!(record.court, "1° Juzgado de Letras del Trabajo de Santiago");
    }

    #[test]
    fn test_free_text_fallbacks() {
        let (mapper, _) = mapper(Tribunal::CorteApelaciones);
        let text = "Corte de Apelaciones de Concepción, Segunda Sala.\nRol N° 845-2019\nConcepción, 12 de marzo de 2020.\nMinistros: Juan Pérez, María Soto y Luis Rojas.\nRedactor: María Soto\nMaterias: Laboral, Despido";
        let record = mapper
            .try_map(&row(json!({"texto_sentencia": text, "caratulado_s": "SOTO CON EMPRESA"})))
            .unwrap();

        assert_eq!(record.docket, "845-2019");
        assert_eq!(record.court, "Corte de Apelaciones de Concepción");
        assert_eq!(record.chamber, "Segunda Sala");
        assert_eq!(record.decision_date, NaiveDate::from_ymd_opt(2020, 3, 12));
        assert_eq!(record.justices, vec!["Juan Pérez", "María Soto", "Luis Rojas"]);
        assert_eq!(record.drafter.as_deref(), Some("María Soto"));
        assert_eq!(record.subjects, vec!["Laboral", "Despido"]);
    }

    #[test]
    fn test_structured_and_text_dockets_share_a_key() {
        let (mapper, _) = mapper(Tribunal::Civiles);
        let structured = mapper.try_map(&row(json!({"rol_s": "c-12-2020"}))).unwrap();
        let scanned = mapper
            .try_map(&row(json!({"texto_sentencia": "Rol C-12-2020, Santiago"})))
            .unwrap();
        assert_eq!(structured.key, scanned.key);
        assert_eq!(structured.docket, "C-12-2020");
    }

    #[test]
    fn test_structured_field_beats_text() {
        let (mapper, _) = mapper(Tribunal::CorteApelaciones);
        let record = mapper
            .try_map(&row(json!({
                "rol_era_ape_s": "100-2022",
                "texto_sentencia": "Rol N° 999-2001",
                "fecha_sentencia": "05/06/2022",
            })))
            .unwrap();
        assert_eq!(record.docket, "100-2022");
        assert_eq!(record.decision_date, NaiveDate::from_ymd_opt(2022, 6, 5));
    }

    #[test]
    fn test_rows_without_docket_are_dropped_and_counted() {
        let (mapper, metrics) = mapper(Tribunal::Familia);
        let no_rol = row(json!({"caratulado_s": "X CON Y", "texto_sentencia": "Vistos y teniendo presente..."}));
        let bad_rol = row(json!({"rol_s": "S/N"}));

        assert_eq!(mapper.try_map(&no_rol), Err(MappingError::MissingRol { fields: 2 }));
        assert_eq!(mapper.try_map(&bad_rol), Err(MappingError::InvalidRol("S/N".to_string())));
        assert!(mapper.map(&no_rol).is_none());
        assert!(mapper.map(&bad_rol).is_none());
        assert_eq!(metrics.snapshot().rows_dropped, 2);
    }

    #[test]
    fn test_unparseable_date_stays_empty() {
        let (mapper, _) = mapper(Tribunal::Civiles);
        let record = mapper
            .try_map(&row(json!({"rol_s": "C-12-2020", "fecha_sentencia": "2020-13-45"})))
            .unwrap();
        assert_eq!(record.decision_date, None);
        assert_eq!(record.key.rol, "C-12");
        assert_eq!(record.key.era, "2020");
    }

    #[test]
    fn test_url_is_never_synthesized() {
        let (mapper, _) = mapper(Tribunal::Penales);
        let record = mapper.try_map(&row(json!({"rol_s": "55-2023"}))).unwrap();
        assert_eq!(record.access_url, "");
        assert_eq!(record.full_text, None);
    }

    #[test]
    fn test_comma_separated_lists() {
        let (mapper, _) = mapper(Tribunal::Cobranza);
        let record = mapper
            .try_map(&row(json!({"rol_s": "7-2024", "descriptores": "Cotizaciones, Prescripción", "ministros": "A, B"})))
            .unwrap();
        assert_eq!(record.descriptors, vec!["Cotizaciones", "Prescripción"]);
        assert_eq!(record.justices, vec!["A", "B"]);
    }

    #[test]
    fn test_map_page_keeps_valid_rows_only() {
        let (mapper, metrics) = mapper(Tribunal::CorteSuprema);
        let rows = vec![
            row(json!({"rol_era_sup_s": "1-2020"})),
            row(json!({"caratulado_s": "sin rol"})),
            row(json!({"rol_era_sup_s": "2-2020"})),
        ];
        let records = mapper.map_page(&rows);
        let dockets: Vec<_> = records.iter().map(|r| r.docket.as_str()).collect();
        assert_eq!(dockets, vec!["1-2020", "2-2020"]);
        assert_eq!(metrics.snapshot().rows_dropped, 1);
    }
}
