use chrono::{DateTime, Utc};
use serde_json::json;

/// Canonical identity key for a reading's logical coordinates.
///
/// Compact JSON with keys in sorted order and the timestamp split into a UTC
/// calendar date and time of day. Identical coordinates always produce
/// byte-identical keys; the value never takes part.
pub fn identity_key(
    ts: DateTime<Utc>,
    perimetre: &str,
    nature: Option<&str>,
    metric: &str,
) -> String {
    json!({
        "date": ts.format("%Y%m%d").to_string(),
        "metric": metric,
        "nature": nature,
        "perimetre": perimetre,
        "time": ts.format("%H:%M:%S").to_string(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    #[test]
    fn key_is_sorted_compact_json() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap();
        assert_eq!(
            identity_key(ts, "France", Some("Données temps réel"), "consommation"),
            r#"{"date":"20240101","metric":"consommation","nature":"Données temps réel","perimetre":"France","time":"00:15:00"}"#
        );
        assert_eq!(
            identity_key(ts, "France", None, "gaz"),
            r#"{"date":"20240101","metric":"gaz","nature":null,"perimetre":"France","time":"00:15:00"}"#
        );
    }

    #[test]
    fn same_instant_in_other_offset_yields_same_key() {
        let paris = FixedOffset::east_opt(3600).unwrap();
        let local = paris.with_ymd_and_hms(2024, 1, 1, 1, 15, 0).unwrap();
        let utc = Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap();
        assert_eq!(
            identity_key(local.with_timezone(&Utc), "France", None, "m"),
            identity_key(utc, "France", None, "m")
        );
    }
}
