//! Latest-state reconciliation over un-merged history.

use crate::store::{apply_order_and_limit, LatestQuery};
use crate::telemetry::{LatestState, Reading};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Orders two rows of the same identity by logical recency: version first,
/// then ingestion time for the (invariant-violating) equal-version case.
pub fn recency(a: &Reading, b: &Reading) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.ingested_at.cmp(&b.ingested_at))
}

/// Picks exactly one row per `ukey`: the maximum by [`recency`].
///
/// Works on the full history, duplicates included; the result does not depend
/// on whether older versions were physically removed yet. Output is sorted by
/// `ukey`.
pub fn latest_by_identity<I>(rows: I) -> Vec<Reading>
where
    I: IntoIterator<Item = Reading>,
{
    let mut latest: BTreeMap<String, Reading> = BTreeMap::new();
    for row in rows {
        match latest.get(&row.ukey) {
            Some(current) if recency(&row, current) != Ordering::Greater => {}
            _ => {
                latest.insert(row.ukey.clone(), row);
            }
        }
    }
    latest.into_values().collect()
}

pub fn latest_state_map<'a, I>(rows: I) -> BTreeMap<String, LatestState>
where
    I: IntoIterator<Item = &'a Reading>,
{
    latest_by_identity(rows.into_iter().cloned())
        .into_iter()
        .map(|row| {
            (
                row.ukey,
                LatestState {
                    value: row.value,
                    version: row.version,
                },
            )
        })
        .collect()
}

/// Reconciles, then filters and orders by reading timestamp.
pub fn query_latest<I>(rows: I, query: &LatestQuery) -> Vec<Reading>
where
    I: IntoIterator<Item = Reading>,
{
    let mut latest: Vec<Reading> = latest_by_identity(rows)
        .into_iter()
        .filter(|row| query.ukey.as_ref().map(|k| &row.ukey == k).unwrap_or(true))
        .filter(|row| query.source.as_ref().map(|s| &row.source == s).unwrap_or(true))
        .filter(|row| query.metric.as_ref().map(|m| &row.metric == m).unwrap_or(true))
        .collect();
    apply_order_and_limit(&mut latest, query.order, query.limit, |row| row.ts);
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SortOrder;
    use chrono::{Duration, TimeZone, Utc};

    fn row(ukey: &str, version: u64, value: Option<f64>, ingested_offset_s: i64) -> Reading {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Reading {
            ts,
            source: "A".into(),
            metric: "m".into(),
            value,
            ukey: ukey.into(),
            version,
            ingested_at: ts + Duration::seconds(ingested_offset_s),
        }
    }

    #[test]
    fn unmerged_versions_resolve_to_highest() {
        // Arrival order deliberately scrambled: a late-arriving older version
        // with a newer ingestion time must not win.
        let rows = vec![
            row("k1", 3, Some(30.0), 10),
            row("k1", 1, Some(10.0), 50),
            row("k1", 2, Some(20.0), 5),
            row("k2", 1, None, 0),
        ];
        let latest = latest_by_identity(rows);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].ukey, "k1");
        assert_eq!(latest[0].version, 3);
        assert_eq!(latest[0].value, Some(30.0));
        assert_eq!(latest[1].ukey, "k2");
        assert_eq!(latest[1].value, None);
    }

    #[test]
    fn equal_versions_break_ties_on_ingestion_time() {
        let rows = vec![row("k", 2, Some(1.0), 20), row("k", 2, Some(2.0), 40)];
        let latest = latest_by_identity(rows.clone());
        assert_eq!(latest[0].value, Some(2.0));
        let reversed: Vec<Reading> = rows.into_iter().rev().collect();
        assert_eq!(latest_by_identity(reversed)[0].value, Some(2.0));
    }

    #[test]
    fn query_filters_and_limits() {
        let mut other = row("k2", 1, Some(5.0), 0);
        other.metric = "n".into();
        other.ts = other.ts + Duration::minutes(15);
        let rows = vec![row("k1", 1, Some(1.0), 0), row("k1", 2, Some(2.0), 1), other];

        let all = query_latest(rows.clone(), &LatestQuery::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].ukey, "k2");

        let only_m = query_latest(
            rows,
            &LatestQuery {
                metric: Some("m".into()),
                order: SortOrder::Asc,
                limit: Some(10),
                ..LatestQuery::default()
            },
        );
        assert_eq!(only_m.len(), 1);
        assert_eq!(only_m[0].version, 2);
    }
}
