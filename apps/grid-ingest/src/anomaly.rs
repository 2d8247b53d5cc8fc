//! Day-of-week / time-of-day z-score scoring for one monitored metric.

use crate::error::StoreError;
use crate::pipeline::CycleReport;
use crate::reconcile::latest_by_identity;
use crate::retry::RetryPolicy;
use crate::store::{HistoryFilter, MeasurementStore, SortOrder};
use crate::telemetry::Reading;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const FETCH_CHUNK_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub metric: String,
    /// Restricts scoring to one source; all sources when unset.
    pub source: Option<String>,
    pub lookback_days: i64,
    pub eval_hours: i64,
    pub z_threshold: f64,
    pub min_samples: usize,
    pub bucket_minutes: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            metric: "consommation".to_string(),
            source: None,
            lookback_days: 84,
            eval_hours: 24,
            z_threshold: 3.0,
            min_samples: 20,
            bucket_minutes: 15,
        }
    }
}

/// Weekly seasonal bucket; `dow` 0 is Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub dow: u8,
    pub hour: u8,
    pub minute: u8,
}

impl BucketKey {
    pub fn of(ts: DateTime<Utc>, bucket_minutes: u32) -> Self {
        let width = bucket_minutes.clamp(1, 60);
        Self {
            dow: ts.weekday().num_days_from_monday() as u8,
            hour: ts.hour() as u8,
            minute: (ts.minute() / width * width) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineStats {
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub samples: usize,
    pub sufficient: bool,
}

/// Flagged reading, with everything needed to audit the decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyRecord {
    pub ts: DateTime<Utc>,
    pub source: String,
    pub metric: String,
    pub ukey: String,
    pub version: u64,
    pub value: f64,
    /// Written as `"inf"` / `"-inf"` when the bucket has no spread.
    #[serde(serialize_with = "serialize_score")]
    pub zscore: f64,
    pub mean: f64,
    pub std: f64,
    pub threshold: f64,
    pub dow: u8,
    pub hour: u8,
    pub minute: u8,
}

fn serialize_score<S: Serializer>(score: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if score.is_finite() {
        serializer.serialize_f64(*score)
    } else if score.is_nan() {
        serializer.serialize_str("nan")
    } else if score.is_sign_positive() {
        serializer.serialize_str("inf")
    } else {
        serializer.serialize_str("-inf")
    }
}

#[derive(Debug, Default)]
pub struct ScoreOutcome {
    pub scored: usize,
    /// Rows without a value or without a sufficient baseline bucket.
    pub unscored: usize,
    pub anomalies: Vec<AnomalyRecord>,
}

pub fn build_baseline(
    rows: &[Reading],
    bucket_minutes: u32,
    min_samples: usize,
) -> HashMap<BucketKey, BaselineStats> {
    let mut grouped: HashMap<BucketKey, Vec<f64>> = HashMap::new();
    for row in rows {
        if let Some(value) = row.value {
            grouped
                .entry(BucketKey::of(row.ts, bucket_minutes))
                .or_default()
                .push(value);
        }
    }

    grouped
        .into_iter()
        .map(|(key, values)| {
            let samples = values.len();
            let mean = values.iter().sum::<f64>() / samples as f64;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples as f64;
            (
                key,
                BaselineStats {
                    mean,
                    std: variance.sqrt(),
                    samples,
                    sufficient: samples >= min_samples,
                },
            )
        })
        .collect()
}

/// `(value - mean) / std`; a flat bucket scores infinite for any deviation.
pub fn zscore(value: f64, mean: f64, std: f64) -> f64 {
    if std > 0.0 {
        (value - mean) / std
    } else if value == mean {
        0.0
    } else if value > mean {
        f64::INFINITY
    } else {
        f64::NEG_INFINITY
    }
}

pub fn score(
    rows: &[Reading],
    baseline: &HashMap<BucketKey, BaselineStats>,
    threshold: f64,
    bucket_minutes: u32,
) -> ScoreOutcome {
    let mut outcome = ScoreOutcome::default();
    for row in rows {
        let Some(value) = row.value else {
            outcome.unscored += 1;
            continue;
        };
        let bucket = BucketKey::of(row.ts, bucket_minutes);
        let Some(stats) = baseline.get(&bucket).filter(|stats| stats.sufficient) else {
            outcome.unscored += 1;
            continue;
        };
        outcome.scored += 1;

        let z = zscore(value, stats.mean, stats.std);
        if z.abs() >= threshold {
            outcome.anomalies.push(AnomalyRecord {
                ts: row.ts,
                source: row.source.clone(),
                metric: row.metric.clone(),
                ukey: row.ukey.clone(),
                version: row.version,
                value,
                zscore: z,
                mean: stats.mean,
                std: stats.std,
                threshold,
                dow: bucket.dow,
                hour: bucket.hour,
                minute: bucket.minute,
            });
        }
    }
    outcome
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AnomalySummary {
    pub baseline_rows: usize,
    pub baseline_buckets: usize,
    pub evaluated: usize,
    pub scored: usize,
    pub unscored: usize,
    pub flagged: usize,
    pub written: usize,
}

/// One stateless scoring run: baseline and evaluation are recomputed from the store.
#[derive(Clone)]
pub struct AnomalyCycle {
    store: Arc<dyn MeasurementStore>,
    retry: RetryPolicy,
    config: AnomalyConfig,
}

impl AnomalyCycle {
    pub fn new(store: Arc<dyn MeasurementStore>, retry: RetryPolicy, config: AnomalyConfig) -> Self {
        Self {
            store,
            retry,
            config,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let report = match self.run(now).await {
            Ok(summary) => CycleReport {
                rows_written: summary.written as u64,
                rows_skipped: summary.unscored as u64,
                ..CycleReport::new("anomaly")
            },
            Err(err) => CycleReport::new("anomaly").failed(&err),
        };
        report.with_duration(started.elapsed())
    }

    /// Fetches both windows, then scores. A failed fetch aborts before anything is written.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<AnomalySummary> {
        anyhow::ensure!(
            self.config.eval_hours > 0 && self.config.lookback_days > 0,
            "anomaly windows must be positive"
        );
        let eval_start = ChronoDuration::try_hours(self.config.eval_hours)
            .and_then(|span| now.checked_sub_signed(span))
            .context("evaluation window out of range")?;
        let baseline_start = ChronoDuration::try_days(self.config.lookback_days)
            .and_then(|span| eval_start.checked_sub_signed(span))
            .context("baseline window out of range")?;

        let baseline_rows = self
            .fetch_latest(baseline_start, eval_start)
            .await
            .context("failed to fetch baseline window")?;
        let eval_rows = self
            .fetch_latest(eval_start, now)
            .await
            .context("failed to fetch evaluation window")?;

        let baseline = build_baseline(
            &baseline_rows,
            self.config.bucket_minutes,
            self.config.min_samples,
        );
        let outcome = score(
            &eval_rows,
            &baseline,
            self.config.z_threshold,
            self.config.bucket_minutes,
        );

        let written = if outcome.anomalies.is_empty() {
            0
        } else {
            self.retry
                .run("anomalies.append", |_| {
                    self.store.append_anomalies(&outcome.anomalies)
                })
                .await
                .context("failed to persist anomalies")?
        };

        let summary = AnomalySummary {
            baseline_rows: baseline_rows.len(),
            baseline_buckets: baseline.values().filter(|stats| stats.sufficient).count(),
            evaluated: eval_rows.len(),
            scored: outcome.scored,
            unscored: outcome.unscored,
            flagged: outcome.anomalies.len(),
            written,
        };
        tracing::info!(
            metric = %self.config.metric,
            baseline_rows = summary.baseline_rows,
            baseline_buckets = summary.baseline_buckets,
            evaluated = summary.evaluated,
            scored = summary.scored,
            flagged = summary.flagged,
            "anomaly scoring complete"
        );
        Ok(summary)
    }

    /// Latest version per key for `[start, end)`, read in day-sized chunks.
    async fn fetch_latest(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        let mut rows = Vec::new();
        let mut chunk_start = start;
        while chunk_start < end {
            let chunk_end = (chunk_start + ChronoDuration::hours(FETCH_CHUNK_HOURS)).min(end);
            let filter = HistoryFilter {
                start: Some(chunk_start),
                end: Some(chunk_end),
                source: self.config.source.clone(),
                metric: Some(self.config.metric.clone()),
                order: SortOrder::Asc,
                ..HistoryFilter::default()
            };
            let chunk = self
                .retry
                .run("anomaly.fetch", |_| self.store.history(&filter))
                .await?;
            tracing::debug!(start = %chunk_start, end = %chunk_end, rows = chunk.len(), "fetched scoring chunk");
            rows.extend(chunk);
            chunk_start = chunk_end;
        }
        Ok(latest_by_identity(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::AnomalyQuery;
    use chrono::TimeZone;
    use std::time::Duration;

    fn reading(ts: DateTime<Utc>, value: f64, version: u64) -> Reading {
        Reading {
            ts,
            source: "France".into(),
            metric: "consommation".into(),
            value: Some(value),
            ukey: format!("k-{}", ts.timestamp()),
            version,
            ingested_at: ts,
        }
    }

    /// Twenty Monday 00:00 samples alternating 90 / 110: mean 100, std 10.
    fn monday_baseline() -> Vec<Reading> {
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..20)
            .map(|week| {
                let value = if week % 2 == 0 { 90.0 } else { 110.0 };
                reading(first + ChronoDuration::weeks(week), value, 1)
            })
            .collect()
    }

    fn eval_monday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap()
    }

    #[test]
    fn bucket_floors_minute_and_starts_week_on_monday() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 7, 13, 44, 59).unwrap();
        let key = BucketKey::of(ts, 15);
        assert_eq!(key, BucketKey { dow: 6, hour: 13, minute: 30 });
    }

    #[test]
    fn threshold_is_inclusive() {
        let baseline = build_baseline(&monday_baseline(), 15, 20);
        let stats = baseline[&BucketKey { dow: 0, hour: 0, minute: 0 }];
        assert_eq!(stats.mean, 100.0);
        assert_eq!(stats.std, 10.0);
        assert!(stats.sufficient);

        let at_threshold = score(&[reading(eval_monday(), 130.0, 2)], &baseline, 3.0, 15);
        assert_eq!(at_threshold.anomalies.len(), 1);
        let record = &at_threshold.anomalies[0];
        assert_eq!(record.zscore, 3.0);
        assert_eq!((record.dow, record.hour, record.minute), (0, 0, 0));
        assert_eq!(record.version, 2);

        let below = score(&[reading(eval_monday(), 129.0, 1)], &baseline, 3.0, 15);
        assert_eq!(below.scored, 1);
        assert!(below.anomalies.is_empty());

        let low = score(&[reading(eval_monday(), 70.0, 1)], &baseline, 3.0, 15);
        assert_eq!(low.anomalies[0].zscore, -3.0);
    }

    #[test]
    fn insufficient_buckets_never_score() {
        let rows: Vec<Reading> = monday_baseline().into_iter().take(19).collect();
        let baseline = build_baseline(&rows, 15, 20);
        let outcome = score(&[reading(eval_monday(), 10_000.0, 1)], &baseline, 3.0, 15);
        assert_eq!(outcome.scored, 0);
        assert_eq!(outcome.unscored, 1);
        assert!(outcome.anomalies.is_empty());
    }

    #[test]
    fn flat_bucket_flags_any_deviation() {
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rows: Vec<Reading> = (0..20)
            .map(|week| reading(first + ChronoDuration::weeks(week), 50.0, 1))
            .collect();
        let baseline = build_baseline(&rows, 15, 20);

        let same = score(&[reading(eval_monday(), 50.0, 1)], &baseline, 3.0, 15);
        assert!(same.anomalies.is_empty());
        let off = score(&[reading(eval_monday(), 50.5, 1)], &baseline, 3.0, 15);
        assert_eq!(off.anomalies.len(), 1);
        assert!(off.anomalies[0].zscore.is_infinite());

        let json = serde_json::to_value(&off.anomalies[0]).unwrap();
        assert_eq!(json["zscore"], "inf");
        let low = score(&[reading(eval_monday(), 49.0, 1)], &baseline, 3.0, 15);
        assert_eq!(serde_json::to_value(&low.anomalies[0]).unwrap()["zscore"], "-inf");
    }

    #[tokio::test]
    async fn cycle_scores_latest_versions_and_persists_flags() {
        let store = Arc::new(MemoryStore::new());
        let mut rows = monday_baseline();
        // A superseded baseline version must not pollute the statistics.
        let mut stale = rows[0].clone();
        stale.value = Some(1_000_000.0);
        stale.version = 0;
        rows.push(stale);
        let mut flagged = reading(eval_monday(), 130.0, 1);
        flagged.ukey = "eval".into();
        rows.push(flagged);
        store.insert_raw(rows);

        let cycle = AnomalyCycle::new(
            store.clone(),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
            AnomalyConfig {
                lookback_days: 200,
                ..AnomalyConfig::default()
            },
        );
        let summary = cycle
            .run(eval_monday() + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(summary.baseline_buckets, 1);
        assert_eq!(summary.flagged, 1);
        assert_eq!(summary.written, 1);

        let stored = store.anomalies(&AnomalyQuery::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].ukey, "eval");
    }

    #[tokio::test]
    async fn out_of_range_lookback_fails_instead_of_panicking() {
        let store = Arc::new(MemoryStore::new());
        let cycle = AnomalyCycle::new(
            store.clone(),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            AnomalyConfig {
                lookback_days: i64::MAX,
                ..AnomalyConfig::default()
            },
        );
        let report = cycle.run_once(eval_monday()).await;
        assert!(!report.is_success());
        assert!(report.error.as_deref().unwrap_or_default().contains("out of range"));
    }

    #[tokio::test]
    async fn failed_fetch_aborts_without_emitting() {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw(monday_baseline());
        store.fail_next_reads(2);

        let cycle = AnomalyCycle::new(
            store.clone(),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
            AnomalyConfig::default(),
        );
        let report = cycle.run_once(eval_monday()).await;
        assert!(!report.is_success());
        assert_eq!(report.errors, 1);
        assert!(store.anomalies(&AnomalyQuery::default()).await.unwrap().is_empty());
    }
}
