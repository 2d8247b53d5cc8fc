//! One-off bootstrap from the published tab-separated history export.

use crate::telemetry::{normalize_record, parse_date_and_time, remap_metric_name, NormalizeOutcome};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::{Map, Value as JsonValue};
use std::io::Read;
use std::path::Path;

/// The export is Latin-1 encoded; every byte maps to the code point of the same value.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Parses the history export, keeping only rows dated strictly before `cutoff`.
pub fn load_history_file(path: &Path, default_source: &str, cutoff: NaiveDate) -> Result<NormalizeOutcome> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open history file {}", path.display()))?;
    parse_history(file, default_source, cutoff)
        .with_context(|| format!("failed to parse history file {}", path.display()))
}

pub fn parse_history<R: Read>(reader: R, default_source: &str, cutoff: NaiveDate) -> Result<NormalizeOutcome> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|raw| remap_metric_name(&decode_latin1(raw)))
        .collect();

    let mut outcome = NormalizeOutcome::default();
    let mut skipped_rows = 0usize;
    for record in reader.byte_records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(error = %err, "dropping unreadable history row");
                outcome.dropped += 1;
                continue;
            }
        };

        let mut fields = Map::new();
        for (name, raw) in headers.iter().zip(record.iter()) {
            if name.is_empty() {
                continue;
            }
            let text = decode_latin1(raw);
            let text = text.trim();
            let value = if text.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(text.to_string())
            };
            fields.insert(name.clone(), value);
        }

        // Footer and disclaimer lines carry no nature.
        let has_nature = fields
            .get("nature")
            .and_then(JsonValue::as_str)
            .is_some();
        if !has_nature {
            skipped_rows += 1;
            continue;
        }

        let ts = match (
            fields.get("date").and_then(JsonValue::as_str),
            fields.get("heure").and_then(JsonValue::as_str),
        ) {
            (Some(date), Some(heure)) => parse_date_and_time(date, heure),
            _ => None,
        };
        let Some(ts) = ts else {
            outcome.dropped += 1;
            continue;
        };
        if ts.date_naive() >= cutoff {
            skipped_rows += 1;
            continue;
        }
        fields.insert("date_heure".to_string(), JsonValue::String(ts.to_rfc3339()));

        outcome.extend(normalize_record(&fields, default_source));
    }

    tracing::info!(
        readings = outcome.readings.len(),
        dropped = outcome.dropped,
        skipped_rows,
        "parsed history export"
    );
    Ok(outcome)
}
