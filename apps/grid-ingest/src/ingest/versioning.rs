use super::identity::identity_key;
use crate::telemetry::{LatestState, RawReading, Reading};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDecision {
    /// Value unchanged since the last stored version; nothing is written.
    Skip,
    Write(u64),
}

/// Non-finite values carry no information and are stored as absent.
pub fn sanitize_value(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

pub fn values_equal(left: Option<f64>, right: Option<f64>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub fn decide_version(previous: Option<&LatestState>, value: Option<f64>) -> VersionDecision {
    match previous {
        None => VersionDecision::Write(1),
        Some(prev) if values_equal(prev.value, value) => VersionDecision::Skip,
        Some(prev) => VersionDecision::Write(prev.version + 1),
    }
}

/// A sanitized, keyed reading waiting for its version decision.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedReading {
    pub ts: DateTime<Utc>,
    pub source: String,
    pub metric: String,
    pub value: Option<f64>,
    pub ukey: String,
}

impl StagedReading {
    pub fn from_raw(raw: &RawReading) -> Self {
        Self {
            ts: raw.ts,
            source: raw.source.clone(),
            metric: raw.metric.clone(),
            value: sanitize_value(raw.value),
            ukey: identity_key(raw.ts, &raw.perimetre, raw.nature.as_deref(), &raw.metric),
        }
    }

    fn same_coordinates(&self, other: &StagedReading) -> bool {
        self.ts == other.ts && self.source == other.source && self.metric == other.metric
    }
}

/// Result of keying a batch: accepted rows in arrival order, plus rows whose
/// key was already claimed by different coordinates.
#[derive(Debug, Default)]
pub struct StagedBatch {
    pub rows: Vec<StagedReading>,
    pub collisions: Vec<StagedReading>,
}

impl StagedBatch {
    pub fn stage<'a, I>(raw: I) -> Self
    where
        I: IntoIterator<Item = &'a RawReading>,
    {
        let mut batch = StagedBatch::default();
        let mut claimed: HashMap<String, StagedReading> = HashMap::new();
        for reading in raw {
            let staged = StagedReading::from_raw(reading);
            if let Some(owner) = claimed.get(&staged.ukey) {
                if !owner.same_coordinates(&staged) {
                    tracing::error!(
                        ukey = %staged.ukey,
                        source = %staged.source,
                        ts = %staged.ts,
                        "identity key collision across distinct coordinates; row rejected"
                    );
                    batch.collisions.push(staged);
                    continue;
                }
            } else {
                claimed.insert(staged.ukey.clone(), staged.clone());
            }
            batch.rows.push(staged);
        }
        batch
    }

    pub fn distinct_keys(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.rows
            .iter()
            .filter(|row| seen.insert(row.ukey.as_str()))
            .map(|row| row.ukey.clone())
            .collect()
    }
}

/// Sequential version assignment seeded from durable state.
///
/// Rows must be fed in source arrival order; each decision updates the
/// planner so later rows of the same key see it.
#[derive(Debug)]
pub struct VersionPlanner {
    state: HashMap<String, LatestState>,
}

impl VersionPlanner {
    pub fn new(state: HashMap<String, LatestState>) -> Self {
        Self { state }
    }

    pub fn plan(&mut self, staged: &StagedReading, ingested_at: DateTime<Utc>) -> Option<Reading> {
        match decide_version(self.state.get(&staged.ukey), staged.value) {
            VersionDecision::Skip => None,
            VersionDecision::Write(version) => {
                self.state.insert(
                    staged.ukey.clone(),
                    LatestState {
                        value: staged.value,
                        version,
                    },
                );
                Some(Reading {
                    ts: staged.ts,
                    source: staged.source.clone(),
                    metric: staged.metric.clone(),
                    value: staged.value,
                    ukey: staged.ukey.clone(),
                    version,
                    ingested_at,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(value: Option<f64>) -> RawReading {
        RawReading {
            ts: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            source: "A".into(),
            metric: "m".into(),
            value,
            perimetre: "A".into(),
            nature: None,
        }
    }

    #[test]
    fn first_observation_gets_version_one_even_when_absent() {
        assert_eq!(decide_version(None, Some(10.0)), VersionDecision::Write(1));
        assert_eq!(decide_version(None, None), VersionDecision::Write(1));
    }

    #[test]
    fn unchanged_values_skip_including_absent() {
        let prev = LatestState { value: Some(10.0), version: 4 };
        assert_eq!(decide_version(Some(&prev), Some(10.0)), VersionDecision::Skip);
        let absent = LatestState { value: None, version: 2 };
        assert_eq!(decide_version(Some(&absent), None), VersionDecision::Skip);
    }

    #[test]
    fn null_transitions_are_changes() {
        let prev = LatestState { value: Some(10.0), version: 1 };
        assert_eq!(decide_version(Some(&prev), None), VersionDecision::Write(2));
        let absent = LatestState { value: None, version: 2 };
        assert_eq!(decide_version(Some(&absent), Some(0.0)), VersionDecision::Write(3));
    }

    #[test]
    fn non_finite_values_compare_as_absent() {
        assert_eq!(sanitize_value(Some(f64::NAN)), None);
        assert_eq!(sanitize_value(Some(f64::INFINITY)), None);
        let staged = StagedReading::from_raw(&raw(Some(f64::NAN)));
        let absent = LatestState { value: None, version: 1 };
        assert_eq!(decide_version(Some(&absent), staged.value), VersionDecision::Skip);
    }

    #[test]
    fn planner_versions_same_key_in_arrival_order() {
        let batch = StagedBatch::stage(&[
            raw(Some(10.0)),
            raw(Some(10.0)),
            raw(Some(12.0)),
            raw(None),
            raw(None),
        ]);
        assert!(batch.collisions.is_empty());
        assert_eq!(batch.distinct_keys().len(), 1);

        let mut planner = VersionPlanner::new(HashMap::new());
        let now = Utc::now();
        let planned: Vec<Reading> = batch
            .rows
            .iter()
            .filter_map(|row| planner.plan(row, now))
            .collect();
        let versions: Vec<(u64, Option<f64>)> =
            planned.iter().map(|r| (r.version, r.value)).collect();
        assert_eq!(versions, vec![(1, Some(10.0)), (2, Some(12.0)), (3, None)]);
    }

    #[test]
    fn planner_continues_from_durable_state() {
        let staged = StagedReading::from_raw(&raw(Some(7.0)));
        let mut state = HashMap::new();
        state.insert(staged.ukey.clone(), LatestState { value: Some(6.0), version: 9 });
        let mut planner = VersionPlanner::new(state);
        assert_eq!(planner.plan(&staged, Utc::now()).map(|r| r.version), Some(10));
        assert!(planner.plan(&staged, Utc::now()).is_none());
    }

    #[test]
    fn colliding_coordinates_are_rejected() {
        let first = raw(Some(1.0));
        let mut second = raw(Some(2.0));
        second.source = "B".into();
        let batch = StagedBatch::stage(&[first, second]);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.collisions.len(), 1);
        assert_eq!(batch.collisions[0].source, "B");
    }
}
