pub mod identity;
pub mod versioning;
pub mod writer;


pub use writer::{BatchWriter, WriteSummary};

use crate::history::load_history_file;
use crate::pipeline::CycleReport;
use crate::retry::RetryPolicy;
use crate::store::MeasurementStore;
use crate::telemetry::{normalize_record, NormalizeOutcome};
use crate::upstream::RecordSource;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Fetch, normalize, version and write one window of upstream records.
#[derive(Clone)]
pub struct IngestCycle {
    store: Arc<dyn MeasurementStore>,
    source: Arc<dyn RecordSource>,
    writer: BatchWriter,
    retry: RetryPolicy,
    default_source: String,
    history_file: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct IngestSummary {
    pub fetched: usize,
    pub dropped: usize,
    pub bootstrap: Option<WriteSummary>,
    pub live: WriteSummary,
}

impl IngestSummary {
    pub fn written(&self) -> usize {
        self.live.written + self.bootstrap.as_ref().map_or(0, |b| b.written)
    }

    pub fn skipped(&self) -> usize {
        self.live.skipped + self.bootstrap.as_ref().map_or(0, |b| b.skipped)
    }

    pub fn invariant_violations(&self) -> usize {
        self.live.invariant_violations()
            + self
                .bootstrap
                .as_ref()
                .map_or(0, WriteSummary::invariant_violations)
    }
}

impl IngestCycle {
    pub fn new(
        store: Arc<dyn MeasurementStore>,
        source: Arc<dyn RecordSource>,
        retry: RetryPolicy,
        default_source: impl Into<String>,
    ) -> Self {
        Self {
            writer: BatchWriter::new(store.clone(), retry.clone()),
            store,
            source,
            retry,
            default_source: default_source.into(),
            history_file: None,
        }
    }

    pub fn with_history_file(mut self, path: Option<PathBuf>) -> Self {
        self.history_file = path;
        self
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let report = match self.run(now).await {
            Ok(summary) => CycleReport {
                rows_written: summary.written() as u64,
                rows_skipped: summary.skipped() as u64,
                rows_dropped: summary.dropped as u64,
                errors: summary.invariant_violations() as u64,
                ..CycleReport::new("ingest")
            },
            Err(err) => CycleReport::new("ingest").failed(&err),
        };
        report.with_duration(started.elapsed())
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<IngestSummary> {
        let mut summary = IngestSummary {
            bootstrap: self.bootstrap(now).await?,
            ..IngestSummary::default()
        };

        let records = self
            .source
            .fetch_window(now)
            .await
            .context("failed to fetch upstream window")?;
        summary.fetched = records.len();

        let mut normalized = NormalizeOutcome::default();
        for record in &records {
            normalized.extend(normalize_record(record, &self.default_source));
        }
        summary.dropped = normalized.dropped;
        if normalized.dropped > 0 {
            tracing::warn!(dropped = normalized.dropped, "dropped malformed upstream values");
        }

        summary.live = self
            .writer
            .write(&normalized.readings)
            .await
            .context("failed to write measurements")?;
        tracing::info!(
            fetched = summary.fetched,
            readings = normalized.readings.len(),
            written = summary.live.written,
            skipped = summary.live.skipped,
            attempts = summary.live.attempts,
            "ingest window processed"
        );
        Ok(summary)
    }

    /// Loads the history export into an empty store, once.
    async fn bootstrap(&self, now: DateTime<Utc>) -> Result<Option<WriteSummary>> {
        let Some(path) = self.history_file.as_ref() else {
            return Ok(None);
        };
        let empty = self
            .retry
            .run("measurements.is_empty", |_| self.store.is_empty())
            .await
            .context("failed to check for existing measurements")?;
        if !empty {
            return Ok(None);
        }

        let cutoff = now.date_naive();
        let path = path.clone();
        let default_source = self.default_source.clone();
        let history = tokio::task::spawn_blocking(move || load_history_file(&path, &default_source, cutoff))
            .await
            .context("history parser panicked")??;

        tracing::info!(readings = history.readings.len(), "bootstrapping empty store from history export");
        let written = self
            .writer
            .write(&history.readings)
            .await
            .context("failed to write history export")?;
        Ok(Some(written))
    }
}
