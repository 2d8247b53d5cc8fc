//! Append-only in-memory store with injectable failures.
//!
//! Appends are all-or-nothing, like the PostgreSQL transaction.

use super::{apply_order_and_limit, AnomalyQuery, AppendOutcome, HistoryFilter, LatestQuery, MeasurementStore};
use crate::anomaly::AnomalyRecord;
use crate::coverage::{daily_counts, DailyCount};
use crate::error::StoreError;
use crate::reconcile::{latest_state_map, query_latest};
use crate::telemetry::{LatestState, Reading};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    rows: Vec<Reading>,
    anomalies: BTreeMap<(String, u64), AnomalyRecord>,
    fail_appends: usize,
    fail_reads: usize,
    land_then_fail: bool,
    racing_rows: Vec<Reading>,
    append_calls: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts rows as-is, bypassing uniqueness; models un-merged history.
    pub fn insert_raw(&self, rows: impl IntoIterator<Item = Reading>) {
        self.lock().rows.extend(rows);
    }

    pub fn rows(&self) -> Vec<Reading> {
        self.lock().rows.clone()
    }

    pub fn append_calls(&self) -> usize {
        self.lock().append_calls
    }

    /// The next `n` appends fail transiently without writing anything.
    pub fn fail_next_appends(&self, n: usize) {
        self.lock().fail_appends = n;
    }

    /// The next append writes its rows, then reports a transient failure.
    pub fn land_then_fail_next_append(&self) {
        self.lock().land_then_fail = true;
    }

    /// Lands `rows` just before the next append, as a concurrent writer would.
    pub fn race_next_append(&self, rows: Vec<Reading>) {
        self.lock().racing_rows = rows;
    }

    /// The next `n` reads of any kind fail transiently.
    pub fn fail_next_reads(&self, n: usize) {
        self.lock().fail_reads = n;
    }

    /// Physical deduplication: keeps only the highest version per key.
    pub fn merge(&self) {
        let mut inner = self.lock();
        let rows = std::mem::take(&mut inner.rows);
        inner.rows = crate::reconcile::latest_by_identity(rows);
    }

    fn check_read(inner: &mut Inner) -> Result<(), StoreError> {
        if inner.fail_reads > 0 {
            inner.fail_reads -= 1;
            return Err(StoreError::Transient("injected read failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn is_empty(&self) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        Self::check_read(&mut inner)?;
        Ok(inner.rows.is_empty())
    }

    async fn latest_state(&self, ukeys: &[String]) -> Result<HashMap<String, LatestState>, StoreError> {
        let mut inner = self.lock();
        Self::check_read(&mut inner)?;
        let wanted: HashSet<&str> = ukeys.iter().map(String::as_str).collect();
        Ok(latest_state_map(inner.rows.iter().filter(|row| wanted.contains(row.ukey.as_str())))
            .into_iter()
            .collect())
    }

    async fn append(&self, rows: &[Reading]) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.lock();
        inner.append_calls += 1;
        if inner.fail_appends > 0 {
            inner.fail_appends -= 1;
            return Err(StoreError::Transient("injected append failure".into()));
        }

        let racing = std::mem::take(&mut inner.racing_rows);
        inner.rows.extend(racing);

        let mut taken: HashSet<(String, u64)> = inner
            .rows
            .iter()
            .map(|row| (row.ukey.clone(), row.version))
            .collect();
        let conflicts: Vec<(String, u64)> = rows
            .iter()
            .filter(|row| !taken.insert((row.ukey.clone(), row.version)))
            .map(|row| (row.ukey.clone(), row.version))
            .collect();
        if !conflicts.is_empty() {
            return Ok(AppendOutcome { written: 0, conflicts });
        }
        inner.rows.extend(rows.iter().cloned());
        let outcome = AppendOutcome {
            written: rows.len(),
            conflicts,
        };

        if inner.land_then_fail {
            inner.land_then_fail = false;
            return Err(StoreError::Transient("connection lost after commit".into()));
        }
        Ok(outcome)
    }

    async fn history(&self, filter: &HistoryFilter) -> Result<Vec<Reading>, StoreError> {
        let mut inner = self.lock();
        Self::check_read(&mut inner)?;
        let mut rows: Vec<Reading> = inner.rows.iter().filter(|row| filter.matches(row)).cloned().collect();
        apply_order_and_limit(&mut rows, filter.order, filter.limit, |row| row.ts);
        Ok(rows)
    }

    async fn count(&self, filter: &HistoryFilter) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        Self::check_read(&mut inner)?;
        Ok(inner.rows.iter().filter(|row| filter.matches(row)).count() as u64)
    }

    async fn latest(&self, query: &LatestQuery) -> Result<Vec<Reading>, StoreError> {
        let mut inner = self.lock();
        Self::check_read(&mut inner)?;
        Ok(query_latest(inner.rows.clone(), query))
    }

    async fn daily_counts(&self) -> Result<Vec<DailyCount>, StoreError> {
        let mut inner = self.lock();
        Self::check_read(&mut inner)?;
        Ok(daily_counts(&inner.rows))
    }

    async fn append_anomalies(&self, rows: &[AnomalyRecord]) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        for row in rows {
            inner
                .anomalies
                .insert((row.ukey.clone(), row.version), row.clone());
        }
        Ok(rows.len())
    }

    async fn anomalies(&self, query: &AnomalyQuery) -> Result<Vec<AnomalyRecord>, StoreError> {
        let mut inner = self.lock();
        Self::check_read(&mut inner)?;
        let mut rows: Vec<AnomalyRecord> = inner
            .anomalies
            .values()
            .filter(|row| query.start.map(|start| row.ts >= start).unwrap_or(true))
            .filter(|row| query.end.map(|end| row.ts < end).unwrap_or(true))
            .filter(|row| query.source.as_ref().map(|s| &row.source == s).unwrap_or(true))
            .filter(|row| query.metric.as_ref().map(|m| &row.metric == m).unwrap_or(true))
            .cloned()
            .collect();
        apply_order_and_limit(&mut rows, query.order, query.limit, |row| row.ts);
        Ok(rows)
    }
}
