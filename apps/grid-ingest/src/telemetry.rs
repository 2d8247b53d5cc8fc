use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

/// Upstream fields that describe a record rather than measure something.
const METADATA_FIELDS: &[&str] = &[
    "perimetre",
    "nature",
    "date",
    "heure",
    "date_heure",
    "total_count",
    "results",
];

/// A normalized upstream observation, before identity and versioning.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub ts: DateTime<Utc>,
    pub source: String,
    pub metric: String,
    pub value: Option<f64>,
    pub perimetre: String,
    pub nature: Option<String>,
}

/// A durable measurement row. Immutable once written; corrections are new versions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub ts: DateTime<Utc>,
    pub source: String,
    pub metric: String,
    pub value: Option<f64>,
    pub ukey: String,
    pub version: u64,
    pub ingested_at: DateTime<Utc>,
}

/// Last known value and version for one identity key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatestState {
    pub value: Option<f64>,
    pub version: u64,
}

#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub readings: Vec<RawReading>,
    pub dropped: usize,
}

impl NormalizeOutcome {
    pub fn extend(&mut self, other: NormalizeOutcome) {
        self.readings.extend(other.readings);
        self.dropped += other.dropped;
    }
}

/// Splits one upstream record into a reading per metric field.
///
/// JSON nulls are kept as absent values; fields that are neither numeric nor
/// null are counted as dropped. A record without a usable timestamp is dropped
/// as a whole.
pub fn normalize_record(record: &Map<String, JsonValue>, default_source: &str) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();

    let Some(ts) = record_timestamp(record) else {
        tracing::debug!(fields = record.len(), "dropping record without timestamp");
        outcome.dropped += 1;
        return outcome;
    };

    let perimetre = record
        .get("perimetre")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default_source)
        .to_string();
    let nature = record
        .get("nature")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    for (key, raw) in record {
        if METADATA_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let value = match parse_value(raw) {
            Ok(value) => value,
            Err(()) => {
                tracing::debug!(metric = %key, "dropping unparseable metric value");
                outcome.dropped += 1;
                continue;
            }
        };
        outcome.readings.push(RawReading {
            ts,
            source: perimetre.clone(),
            metric: key.clone(),
            value,
            perimetre: perimetre.clone(),
            nature: nature.clone(),
        });
    }

    outcome
}

fn parse_value(raw: &JsonValue) -> Result<Option<f64>, ()> {
    match raw {
        JsonValue::Null => Ok(None),
        JsonValue::Number(num) => num.as_f64().map(Some).ok_or(()),
        JsonValue::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed.parse::<f64>().map(Some).map_err(|_| ())
        }
        _ => Err(()),
    }
}

fn record_timestamp(record: &Map<String, JsonValue>) -> Option<DateTime<Utc>> {
    if let Some(raw) = record.get("date_heure").and_then(JsonValue::as_str) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw.trim()) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    let date = record.get("date").and_then(JsonValue::as_str)?;
    let heure = record.get("heure").and_then(JsonValue::as_str)?;
    parse_date_and_time(date, heure)
}

/// Combines a `YYYY-MM-DD` date and an `HH:MM[:SS]` time as UTC.
pub fn parse_date_and_time(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    let time = time.trim();
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
        .ok()?;
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

/// Maps published column labels to metric keys.
pub fn remap_metric_name(original: &str) -> String {
    let key = original.trim();
    let mapped = match key {
        "Périmètre" => Some("perimetre"),
        "Nature" => Some("nature"),
        "Date" => Some("date"),
        "Heures" => Some("heure"),
        "Consommation" => Some("consommation"),
        "Prévision J-1" => Some("prevision_j1"),
        "Prévision J" => Some("prevision_j"),
        "Fioul" => Some("fioul"),
        "Charbon" => Some("charbon"),
        "Gaz" => Some("gaz"),
        "Nucléaire" => Some("nucleaire"),
        "Eolien" => Some("eolien"),
        "Eolien terrestre" => Some("eolien_terrestre"),
        "Eolien offshore" => Some("eolien_offshore"),
        "Solaire" => Some("solaire"),
        "Hydraulique" => Some("hydraulique"),
        "Pompage" => Some("pompage"),
        "Bioénergies" => Some("bioenergies"),
        "Bioénergies - Déchets" => Some("bioenergies_dechets"),
        "Bioénergies - Biomasse" => Some("bioenergies_biomasse"),
        "Bioénergies - Biogaz" => Some("bioenergies_biogaz"),
        "Ech. physiques" => Some("ech_physiques"),
        "Taux de Co2" => Some("taux_co2"),
        "Ech. comm. Angleterre" => Some("ech_comm_angleterre"),
        "Ech. comm. Espagne" => Some("ech_comm_espagne"),
        "Ech. comm. Italie" => Some("ech_comm_italie"),
        "Ech. comm. Suisse" => Some("ech_comm_suisse"),
        "Ech. comm. Allemagne-Belgique" => Some("ech_comm_allemagne_belgique"),
        "Fioul - TAC" => Some("fioul_tac"),
        "Fioul - Cogén." => Some("fioul_cogen"),
        "Fioul - Autres" => Some("fioul_autres"),
        "Gaz - TAC" => Some("gaz_tac"),
        "Gaz - Cogén." => Some("gaz_cogen"),
        "Gaz - CCG" => Some("gaz_ccg"),
        "Gaz - Autres" => Some("gaz_autres"),
        "Hydraulique - Fil de l'eau + éclusée" => Some("hydraulique_fil_eau_eclusee"),
        "Hydraulique - Lacs" => Some("hydraulique_lacs"),
        "Hydraulique - STEP turbinage" => Some("hydraulique_step_turbinage"),
        "Stockage batterie" => Some("stockage_batterie"),
        "Déstockage batterie" => Some("destockage_batterie"),
        _ => None,
    };
    if let Some(mapped) = mapped {
        return mapped.to_string();
    }

    let mut out = String::with_capacity(key.len());
    for ch in key.chars() {
        let ch = fold_accent(ch);
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches('_');
    if out.is_empty() {
        original.to_string()
    } else {
        out.to_string()
    }
}

fn fold_accent(ch: char) -> char {
    match ch {
        'à' | 'â' | 'ä' | 'á' => 'a',
        'À' | 'Â' | 'Ä' | 'Á' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'î' | 'ï' | 'í' => 'i',
        'Î' | 'Ï' | 'Í' => 'I',
        'ô' | 'ö' | 'ó' => 'o',
        'Ô' | 'Ö' | 'Ó' => 'O',
        'ù' | 'û' | 'ü' | 'ú' => 'u',
        'Ù' | 'Û' | 'Ü' | 'Ú' => 'U',
        'ç' => 'c',
        'Ç' => 'C',
        other => other,
    }
}
