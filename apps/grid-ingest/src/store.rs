//! Durable store interface.
//!
//! The store is append-only and may hold several versions of the same identity
//! key at once; any physical deduplication it performs happens in the background
//! and is never relied upon. Every "current value" read is an explicit
//! aggregation over all stored versions.

#[cfg(test)]
pub mod memory;
mod postgres;

pub use postgres::PgStore;

use crate::anomaly::AnomalyRecord;
use crate::coverage::DailyCount;
use crate::error::StoreError;
use crate::telemetry::{LatestState, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order {other:?}")),
        }
    }
}

/// Raw history filter. `start` is inclusive, `end` exclusive.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub metric: Option<String>,
    pub ukey: Option<String>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

impl HistoryFilter {
    pub fn matches(&self, row: &Reading) -> bool {
        self.start.map(|start| row.ts >= start).unwrap_or(true)
            && self.end.map(|end| row.ts < end).unwrap_or(true)
            && self.source.as_ref().map(|s| &row.source == s).unwrap_or(true)
            && self.metric.as_ref().map(|m| &row.metric == m).unwrap_or(true)
            && self.ukey.as_ref().map(|k| &row.ukey == k).unwrap_or(true)
    }
}

/// Filter applied to the reconciled latest state.
#[derive(Debug, Clone, Default)]
pub struct LatestQuery {
    pub ukey: Option<String>,
    pub source: Option<String>,
    pub metric: Option<String>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub metric: Option<String>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

#[derive(Debug, Default)]
pub struct AppendOutcome {
    pub written: usize,
    /// Rows whose `(ukey, version)` was already taken. When non-empty the
    /// whole append was rolled back and `written` is zero.
    pub conflicts: Vec<(String, u64)>,
}

#[async_trait]
pub trait MeasurementStore: Send + Sync {
    async fn is_empty(&self) -> Result<bool, StoreError>;

    /// Highest-version value per key, for the keys that have any history.
    async fn latest_state(
        &self,
        ukeys: &[String],
    ) -> Result<HashMap<String, LatestState>, StoreError>;

    /// Appends rows as one unit: either every row lands or none does. Rows
    /// colliding on `(ukey, version)` are reported in the outcome.
    async fn append(&self, rows: &[Reading]) -> Result<AppendOutcome, StoreError>;

    async fn history(&self, filter: &HistoryFilter) -> Result<Vec<Reading>, StoreError>;

    /// Raw row count under `filter`; `limit` and `order` are ignored.
    async fn count(&self, filter: &HistoryFilter) -> Result<u64, StoreError>;

    async fn latest(&self, query: &LatestQuery) -> Result<Vec<Reading>, StoreError>;

    async fn daily_counts(&self) -> Result<Vec<DailyCount>, StoreError>;

    /// Upserts anomaly rows keyed by the scored reading's `(ukey, version)`.
    async fn append_anomalies(&self, rows: &[AnomalyRecord]) -> Result<usize, StoreError>;

    async fn anomalies(&self, query: &AnomalyQuery) -> Result<Vec<AnomalyRecord>, StoreError>;
}

/// Bounds a store call; an elapsed deadline counts as a transient failure.
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Transient(format!(
            "{operation} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

pub(crate) fn apply_order_and_limit<T, K>(rows: &mut Vec<T>, order: SortOrder, limit: Option<usize>, key: K)
where
    K: Fn(&T) -> DateTime<Utc>,
{
    rows.sort_by_key(|row| key(row));
    if order == SortOrder::Desc {
        rows.reverse();
    }
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
}
