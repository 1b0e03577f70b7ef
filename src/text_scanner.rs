// =============================================================================
// text_scanner.rs - DIGGING METADATA OUT OF JUDICIAL PROSE
// =============================================================================
//
// The structured fields of a search row are optional in practice. When one is
// missing, the information is usually still there, buried somewhere in the
// sentence text. This module holds the free-text extractors the mapper falls
// back to:
//
// 1. Regexes for the docket number, dates, chamber names and the
//    "Ministros:" / "Redactor:" lines. Compiled once, shared by all threads.
// 2. An Aho-Corasick automaton over the known court names. Every name is
//    matched in a single pass; the leftmost (then longest) match wins.
// 3. memchr pre-checks so that texts without the anchor word never reach the
//    regex engine at all. A few thousand rows per tribunal and day adds up.
//
// Every extractor is a pure function of the text. None of them guess: if the
// text doesn't say it, the answer is None.
// =============================================================================

use std::sync::LazyLock;

use aho_corasick::{AhoCorasick, MatchKind};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use memchr::memmem;
use regex::Regex;

/// Numeric formats accepted for dates, tried in order.
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%Y/%m/%d"];

const SPANISH_MONTHS: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

/// Court names as they appear in sentence headers. Order matters only for
/// the canonical spelling we report; matching is leftmost-longest.
static COURT_NAMES: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "Corte Suprema",
        "Corte de Apelaciones de Arica",
        "Corte de Apelaciones de Iquique",
        "Corte de Apelaciones de Antofagasta",
        "Corte de Apelaciones de Copiapó",
        "Corte de Apelaciones de La Serena",
        "Corte de Apelaciones de Valparaíso",
        "Corte de Apelaciones de Santiago",
        "Corte de Apelaciones de San Miguel",
        "Corte de Apelaciones de Rancagua",
        "Corte de Apelaciones de Talca",
        "Corte de Apelaciones de Chillán",
        "Corte de Apelaciones de Concepción",
        "Corte de Apelaciones de Temuco",
        "Corte de Apelaciones de Valdivia",
        "Corte de Apelaciones de Puerto Montt",
        "Corte de Apelaciones de Coyhaique",
        "Corte de Apelaciones de Punta Arenas",
        "Juzgado de Letras del Trabajo",
        "Juzgado de Cobranza Laboral y Previsional",
        "Juzgado de Familia",
        "Juzgado de Garantía",
        "Tribunal de Juicio Oral en lo Penal",
        "Juzgado de Letras",
        "Juzgado Civil",
    ]
});

static COURT_AUTOMATON: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostLongest)
        .build(&*COURT_NAMES)
        .expect("court name patterns are plain literals")
});

static DOCKET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:rol|ingreso)(?:\s+(?:n[°ºo]|nro|núm(?:ero)?)\.?)?\s*:?\s*((?:[a-z]{1,3}-)?\d[\d.]*-\d{4})\b",
    )
    .expect("docket regex is valid")
});

static LONG_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})[°º]?\s+de\s+([a-záéíóú]+)\s+(?:de|del)\s+(?:año\s+)?(\d{4})\b")
        .expect("long date regex is valid")
});

static NUMERIC_DATE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b",
        r"\b(\d{1,2})-(\d{1,2})-(\d{4})\b",
        r"\b(\d{4})-(\d{2})-(\d{2})\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("numeric date regex is valid"))
    .collect()
});

static CHAMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(?:primera|segunda|tercera|cuarta|quinta|sexta|s[ée]ptima|octava|novena|d[ée]cima)\s+sala|sala\s+(?:constitucional|penal|civil|laboral|de\s+verano|especializada|contencioso[\s-]administrativa))\b",
    )
    .expect("chamber regex is valid")
});

static JUSTICES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bministr[oa]s?(?:\s*\((?:s|as|es)\))?\s*:\s*([^\n]+)").expect("justices regex is valid")
});

static DRAFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bredactor(?:a|\s*\(a\))?\s*:\s*([^\n]+)").expect("drafter regex is valid")
});

static SUBJECTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bmaterias?\s*:\s*([^\n]+)").expect("subjects regex is valid"));

static DESCRIPTORS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdescriptor(?:es)?\s*:\s*([^\n]+)").expect("descriptors regex is valid"));

static HONORIFICS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:sres|srta|sra|sr|don|doña|señor(?:a)?)\.?\s+").expect("honorifics regex is valid")
});

/// ASCII case-insensitive substring pre-check. Needles must be lowercase.
fn mentions(text: &str, needles: &[&[u8]]) -> bool {
    let lowered = text.to_ascii_lowercase();
    let bytes = lowered.as_bytes();
    needles.iter().any(|n| memmem::find(bytes, n).is_some())
}

/// Month number for a Spanish month name ("setiembre" included).
pub fn spanish_month(name: &str) -> Option<u32> {
    let name = name.trim().to_lowercase();
    if name == "setiembre" {
        return Some(9);
    }
    SPANISH_MONTHS
        .iter()
        .position(|m| *m == name)
        .map(|i| i as u32 + 1)
}

/// Normalize a date string from any of the shapes the upstream uses.
/// Invalid calendar dates come back as None.
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.contains('T') {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.date_naive());
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(dt.date());
        }
        return raw.split('T').next().and_then(normalize_date);
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }

    parse_long_date(raw)
}

/// "5 de marzo de 2021", "1° de enero del 2020".
fn parse_long_date(text: &str) -> Option<NaiveDate> {
    LONG_DATE_RE.captures_iter(text).find_map(|caps| {
        let day: u32 = caps[1].parse().ok()?;
        let month = spanish_month(&caps[2])?;
        let year: i32 = caps[3].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

/// Docket number mentioned in the text, e.g. "Rol N° 1234-2020".
/// Thousands separators are removed.
pub fn find_docket(text: &str) -> Option<String> {
    if !mentions(text, &[b"rol", b"ingreso"]) {
        return None;
    }
    DOCKET_RE
        .captures(text)
        .map(|caps| caps[1].replace('.', "").to_uppercase())
}

/// First date found in the text: the long Spanish form wins over the
/// numeric ones because that's how sentences date themselves.
pub fn find_date(text: &str) -> Option<NaiveDate> {
    if let Some(date) = parse_long_date(text) {
        return Some(date);
    }

    NUMERIC_DATE_RES.iter().enumerate().find_map(|(i, re)| {
        re.captures_iter(text).find_map(|caps| {
            let (a, b, c): (u32, u32, i32) = (caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?);
            if i == 2 {
                // yyyy-mm-dd: groups are year, month, day
                NaiveDate::from_ymd_opt(a as i32, b, c as u32)
            } else {
                NaiveDate::from_ymd_opt(c, b, a)
            }
        })
    })
}

/// Chamber name ("Segunda Sala", "Sala Constitucional") as written.
pub fn find_chamber(text: &str) -> Option<String> {
    if !mentions(text, &[b"sala"]) {
        return None;
    }
    CHAMBER_RE.find(text).map(|m| collapse_whitespace(m.as_str()))
}

/// First known court name in the text, canonical spelling.
pub fn find_court(text: &str) -> Option<String> {
    COURT_AUTOMATON
        .find(text)
        .map(|m| COURT_NAMES[m.pattern().as_usize()].to_string())
}

/// Names listed after "Ministros:".
pub fn find_justices(text: &str) -> Vec<String> {
    if !mentions(text, &[b"ministr"]) {
        return Vec::new();
    }
    JUSTICES_RE
        .captures(text)
        .map(|caps| split_names(&caps[1]))
        .unwrap_or_default()
}

/// Name after "Redactor:" / "Redactora:" / "Redactor(a):".
pub fn find_drafter(text: &str) -> Option<String> {
    if !mentions(text, &[b"redact"]) {
        return None;
    }
    DRAFTER_RE
        .captures(text)
        .and_then(|caps| split_names(&caps[1]).into_iter().next())
}

/// Items of a "Materias:" line.
pub fn find_subjects(text: &str) -> Vec<String> {
    SUBJECTS_RE
        .captures(text)
        .map(|caps| split_list(&caps[1]))
        .unwrap_or_default()
}

/// Items of a "Descriptores:" line.
pub fn find_descriptors(text: &str) -> Vec<String> {
    DESCRIPTORS_RE
        .captures(text)
        .map(|caps| split_list(&caps[1]))
        .unwrap_or_default()
}

/// Split a value that is either a list already flattened to text or a comma
/// separated string. Blank items are dropped.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(|s| collapse_whitespace(s.trim()))
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_names(line: &str) -> Vec<String> {
    let cleaned = HONORIFICS_RE.replace_all(line, "");
    let list = &cleaned[..sentence_end(&cleaned)];
    list.split([',', ';'])
        .flat_map(|part| part.split(" y "))
        .map(|name| collapse_whitespace(name.trim()))
        .filter(|name| !name.is_empty())
        .collect()
}

/// Byte offset of the first period that closes the sentence. A period right
/// after a single letter is an initial ("Muñoz G.") and does not count.
fn sentence_end(s: &str) -> usize {
    s.match_indices('.')
        .map(|(i, _)| i)
        .find(|&i| {
            let word = s[..i]
                .rsplit(|c: char| c.is_whitespace() || c == ',' || c == ';')
                .next()
                .unwrap_or_default();
            word.chars().count() > 1
        })
        .unwrap_or(s.len())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    #[test]
    fn test_normalize_numeric_formats() {
        assert_eq!(normalize_date("2021-03-05"), ymd(2021, 3, 5));
        assert_eq!(normalize_date("05-03-2021"), ymd(2021, 3, 5));
        assert_eq!(normalize_date("05/03/2021"), ymd(2021, 3, 5));
        assert_eq!(normalize_date("2021/03/05"), ymd(2021, 3, 5));
    }

    #[test]
    fn test_normalize_iso_datetime() {
        assert_eq!(normalize_date("2021-03-05T00:00:00Z"), ymd(2021, 3, 5));
        assert_eq!(normalize_date("2021-03-05T12:30:00"), ymd(2021, 3, 5));
    }

    #[test]
    fn test_normalize_spanish_long_form() {
        assert_eq!(normalize_date("5 de marzo de 2021"), ymd(2021, 3, 5));
        assert_eq!(normalize_date("1° de Septiembre del 2019"), ymd(2019, 9, 1));
    }

    #[test]
    fn test_invalid_calendar_date_is_none() {
        assert_eq!(normalize_date("2021-02-30"), None);
        assert_eq!(normalize_date("31 de abril de 2020"), None);
        assert_eq!(normalize_date("pendiente"), None);
        assert_eq!(normalize_date(""), None);
    }

    #[test]
    fn test_docket_patterns() {
        assert_eq!(find_docket("Santiago. Rol N° 1234-2020. Vistos:"), Some("1234-2020".to_string()));
        assert_eq!(find_docket("en causa Rol 77-2019 seguida"), Some("77-2019".to_string()));
        assert_eq!(find_docket("Ingreso N° 12.345-2018"), Some("12345-2018".to_string()));
        assert_eq!(find_docket("ROL: C-4567-2022"), Some("C-4567-2022".to_string()));
        assert_eq!(find_docket("Vistos y considerando que..."), None);
        assert_eq!(find_docket("causa rOL 12-2020 en tramite"), Some("12-2020".to_string()));
        assert_eq!(find_docket("INGRESO 88-2021"), Some("88-2021".to_string()));
    }

    #[test]
    fn test_find_date_prefers_long_form() {
        let text = "Ingresado el 02/01/2020. Santiago, quince... 14 de enero de 2020.";
        assert_eq!(find_date(text), ymd(2020, 1, 14));
        assert_eq!(find_date("Fecha: 03-11-2019"), ymd(2019, 11, 3));
        assert_eq!(find_date("dictada 2018-07-09 por"), ymd(2018, 7, 9));
        assert_eq!(find_date("sin fecha"), None);
    }

    #[test]
    fn test_chamber_and_court() {
        let text = "Pronunciado por la Segunda Sala de la CORTE SUPREMA integrada por";
        assert_eq!(find_chamber(text), Some("Segunda Sala".to_string()));
        assert_eq!(find_court(text), Some("Corte Suprema".to_string()));

        let appeal = "Corte de Apelaciones de Santiago, Sala Constitucional";
        assert_eq!(find_court(appeal), Some("Corte de Apelaciones de Santiago".to_string()));
        assert_eq!(find_chamber(appeal), Some("Sala Constitucional".to_string()));

        assert_eq!(find_court("Juzgado de Letras del Trabajo de Temuco"), Some("Juzgado de Letras del Trabajo".to_string()));
        assert_eq!(find_court("nada que ver"), None);
    }

    #[test]
    fn test_justices_and_drafter() {
        let text = "Ministros: Sr. Sergio Muñoz G., Sra. Ángela Vivanco M. y Sr. Jean Pierre Matus A.\nRedactor(a): Ministro Sr. Matus\n";
        let justices = find_justices("Ministros: Sergio Muñoz, Ángela Vivanco y Jean Pierre Matus.\n");
        assert_eq!(justices, vec!["Sergio Muñoz", "Ángela Vivanco", "Jean Pierre Matus"]);
        assert_eq!(
            find_justices(text),
            vec!["Sergio Muñoz G.", "Ángela Vivanco M.", "Jean Pierre Matus A."]
        );
        assert_eq!(find_drafter(text), Some("Ministro Matus".to_string()));
        assert_eq!(find_drafter("Redactora: Ángela Vivanco\n"), Some("Ángela Vivanco".to_string()));
        assert_eq!(find_drafter("sin redacción"), None);
    }

    #[test]
    fn test_initials_do_not_cut_the_list() {
        assert_eq!(
            find_justices("Ministros (as): Sres. Juan Pérez R. y Ana Soto L.\n"),
            vec!["Juan Pérez R.", "Ana Soto L."]
        );
        assert_eq!(
            find_justices("Ministros: Juan Pérez, Ana Soto. Santiago, dos de marzo.\n"),
            vec!["Juan Pérez", "Ana Soto"]
        );
        assert_eq!(find_chamber("la sEGUNDA SALA de la Corte"), Some("sEGUNDA SALA".to_string()));
    }

    #[test]
    fn test_labeled_lists() {
        let text = "Materias: Civil, Arrendamiento\nDescriptores: Desahucio; Restitución\n";
        assert_eq!(find_subjects(text), vec!["Civil", "Arrendamiento"]);
        assert_eq!(find_descriptors(text), vec!["Desahucio", "Restitución"]);
        assert!(find_subjects("Vistos").is_empty());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("Civil, Contratos ;  Arrendamiento ,"), vec!["Civil", "Contratos", "Arrendamiento"]);
        assert!(split_list("  ").is_empty());
    }
}
