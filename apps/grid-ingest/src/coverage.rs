//! Day × source × metric coverage over the raw history.

use crate::telemetry::Reading;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Rows stored for one `(day, source, metric)`, with the span of their ingestion times.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCount {
    pub day: NaiveDate,
    pub source: String,
    pub metric: String,
    pub rows: u64,
    pub first_ingested_at: Option<DateTime<Utc>>,
    pub last_ingested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageRow {
    pub day: NaiveDate,
    pub source: String,
    pub metric: String,
    pub rows: u64,
    pub first_ingested_at: Option<DateTime<Utc>>,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub has_data: bool,
    pub is_missing_day: bool,
}

/// Aggregates raw rows per UTC calendar day of their reading timestamp.
pub fn daily_counts<'a, I>(rows: I) -> Vec<DailyCount>
where
    I: IntoIterator<Item = &'a Reading>,
{
    let mut counts: BTreeMap<(NaiveDate, String, String), DailyCount> = BTreeMap::new();
    for row in rows {
        let day = row.ts.date_naive();
        let entry = counts
            .entry((day, row.source.clone(), row.metric.clone()))
            .or_insert_with(|| DailyCount {
                day,
                source: row.source.clone(),
                metric: row.metric.clone(),
                rows: 0,
                first_ingested_at: None,
                last_ingested_at: None,
            });
        entry.rows += 1;
        entry.first_ingested_at = Some(
            entry
                .first_ingested_at
                .map_or(row.ingested_at, |first| first.min(row.ingested_at)),
        );
        entry.last_ingested_at = Some(
            entry
                .last_ingested_at
                .map_or(row.ingested_at, |last| last.max(row.ingested_at)),
        );
    }
    counts.into_values().collect()
}

/// Expands observed counts into the full grid of days × observed `(source, metric)` pairs.
///
/// The window runs from the earliest observed day (or `today` when nothing was
/// observed) through `max(latest observed day, today)`, so lagging data shows up
/// as missing days up to now. Output is sorted by `(day, source, metric)`.
pub fn build_coverage(counts: &[DailyCount], today: NaiveDate) -> Vec<CoverageRow> {
    let min_day = counts.iter().map(|c| c.day).min().unwrap_or(today);
    let max_day = counts.iter().map(|c| c.day).max().unwrap_or(today).max(today);

    let pairs: BTreeSet<(&str, &str)> = counts
        .iter()
        .map(|c| (c.source.as_str(), c.metric.as_str()))
        .collect();
    let mut by_key: BTreeMap<(NaiveDate, &str, &str), DailyCount> = BTreeMap::new();
    for count in counts {
        let slot = by_key
            .entry((count.day, count.source.as_str(), count.metric.as_str()))
            .or_insert_with(|| DailyCount {
                rows: 0,
                first_ingested_at: None,
                last_ingested_at: None,
                ..count.clone()
            });
        slot.rows += count.rows;
        slot.first_ingested_at = earliest(slot.first_ingested_at, count.first_ingested_at);
        slot.last_ingested_at = latest(slot.last_ingested_at, count.last_ingested_at);
    }

    let mut out = Vec::new();
    for day in min_day.iter_days().take_while(|day| *day <= max_day) {
        for (source, metric) in &pairs {
            let found = by_key.get(&(day, *source, *metric));
            let rows = found.map(|c| c.rows).unwrap_or(0);
            out.push(CoverageRow {
                day,
                source: source.to_string(),
                metric: metric.to_string(),
                rows,
                first_ingested_at: found.and_then(|c| c.first_ingested_at),
                last_ingested_at: found.and_then(|c| c.last_ingested_at),
                has_data: rows > 0,
                is_missing_day: rows == 0,
            });
        }
    }
    out
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
