use super::versioning::{StagedBatch, VersionPlanner};
use crate::error::StoreError;
use crate::retry::RetryPolicy;
use crate::store::MeasurementStore;
use crate::telemetry::{LatestState, RawReading, Reading};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const LATEST_STATE_CHUNK: usize = 500;

#[derive(Debug, Default, Clone)]
pub struct WriteSummary {
    pub staged: usize,
    pub written: usize,
    pub skipped: usize,
    /// Rows rejected before versioning because their key belongs to other coordinates.
    pub collisions: usize,
    /// `(ukey, version)` collisions still unresolved after the last attempt.
    pub conflicts: Vec<(String, u64)>,
    /// Planned rows given up on because their key kept colliding.
    pub unwritten: usize,
    pub attempts: u32,
}

impl WriteSummary {
    pub fn invariant_violations(&self) -> usize {
        self.collisions + self.conflicts.len()
    }
}

#[derive(Default)]
struct AttemptLedger {
    attempt: u32,
    written: usize,
    unwritten: usize,
    conflicts: Vec<(String, u64)>,
    /// Rows of an append that failed without telling whether it committed.
    unconfirmed: Vec<Reading>,
}

fn with_ledger<R>(ledger: &Mutex<AttemptLedger>, f: impl FnOnce(&mut AttemptLedger) -> R) -> R {
    let mut guard = ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

/// Counts the rows of an unconfirmed append that durable state shows as landed.
///
/// A key counts when its latest stored `(version, value)` is exactly the last
/// row planned for it.
fn confirmed_landed(unconfirmed: &[Reading], state: &HashMap<String, LatestState>) -> usize {
    let mut planned: HashMap<&str, (LatestState, usize)> = HashMap::new();
    for row in unconfirmed {
        let entry = planned.entry(row.ukey.as_str()).or_insert((
            LatestState {
                value: row.value,
                version: row.version,
            },
            0,
        ));
        if row.version >= entry.0.version {
            entry.0 = LatestState {
                value: row.value,
                version: row.version,
            };
        }
        entry.1 += 1;
    }
    planned
        .into_iter()
        .filter(|(ukey, (last, _))| state.get(*ukey) == Some(last))
        .map(|(_, (_, rows))| rows)
        .sum()
}

/// Persists versioned readings, one append per attempt.
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn MeasurementStore>,
    retry: RetryPolicy,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn MeasurementStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Versions and appends one cycle's readings.
    ///
    /// Each attempt re-reads the last known state from the store, so a retry
    /// after a partially landed append skips what already landed and a
    /// version collision is re-planned against the winner. On the last
    /// attempt, keys that still collide are given up on and the rest land.
    pub async fn write(&self, raw: &[RawReading]) -> Result<WriteSummary, StoreError> {
        let started = Instant::now();
        let batch = StagedBatch::stage(raw);
        let keys = batch.distinct_keys();
        let ledger = Mutex::new(AttemptLedger::default());
        let max_attempts = self.retry.max_attempts;

        if batch.rows.is_empty() {
            return Ok(WriteSummary {
                staged: raw.len(),
                collisions: batch.collisions.len(),
                ..WriteSummary::default()
            });
        }

        self.retry
            .run("measurements.append", |attempt| {
                let batch = &batch;
                let keys = &keys;
                let ledger = &ledger;
                async move {
                    let state = self.load_state(keys).await?;
                    with_ledger(ledger, |ledger| {
                        let unconfirmed = std::mem::take(&mut ledger.unconfirmed);
                        ledger.written += confirmed_landed(&unconfirmed, &state);
                        ledger.attempt = attempt;
                        ledger.conflicts.clear();
                        ledger.unwritten = 0;
                    });

                    let mut planner = VersionPlanner::new(state);
                    let ingested_at = Utc::now();
                    let mut rows: Vec<Reading> = batch
                        .rows
                        .iter()
                        .filter_map(|row| planner.plan(row, ingested_at))
                        .collect();

                    while !rows.is_empty() {
                        with_ledger(ledger, |ledger| ledger.unconfirmed = rows.clone());
                        let outcome = self.store.append(&rows).await?;
                        with_ledger(ledger, |ledger| {
                            ledger.unconfirmed.clear();
                            ledger.written += outcome.written;
                        });
                        if outcome.conflicts.is_empty() {
                            break;
                        }

                        for (ukey, version) in &outcome.conflicts {
                            tracing::warn!(%ukey, version, attempt, "version already taken; re-planning");
                        }
                        if attempt < max_attempts {
                            let (ukey, version) = outcome.conflicts[0].clone();
                            return Err(StoreError::Conflict { ukey, version });
                        }

                        let lost: HashSet<&str> = outcome
                            .conflicts
                            .iter()
                            .map(|(ukey, _)| ukey.as_str())
                            .collect();
                        let (kept, dropped): (Vec<Reading>, Vec<Reading>) = rows
                            .into_iter()
                            .partition(|row| !lost.contains(row.ukey.as_str()));
                        with_ledger(ledger, |ledger| {
                            ledger.unwritten += dropped.len();
                            ledger.conflicts.extend(outcome.conflicts.iter().cloned());
                        });
                        rows = kept;
                    }
                    Ok(())
                }
            })
            .await?;

        let ledger = ledger
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (ukey, version) in &ledger.conflicts {
            tracing::error!(%ukey, version, "duplicate version after retries; key not written");
        }

        let summary = WriteSummary {
            staged: raw.len(),
            written: ledger.written,
            skipped: batch
                .rows
                .len()
                .saturating_sub(ledger.written + ledger.unwritten),
            unwritten: ledger.unwritten,
            collisions: batch.collisions.len(),
            conflicts: ledger.conflicts,
            attempts: ledger.attempt,
        };
        tracing::debug!(
            staged = summary.staged,
            written = summary.written,
            skipped = summary.skipped,
            attempts = summary.attempts,
            micros = started.elapsed().as_micros() as u64,
            "wrote measurement batch"
        );
        Ok(summary)
    }

    async fn load_state(&self, keys: &[String]) -> Result<HashMap<String, LatestState>, StoreError> {
        let mut state = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(LATEST_STATE_CHUNK) {
            state.extend(self.store.latest_state(chunk).await?);
        }
        Ok(state)
    }
}
