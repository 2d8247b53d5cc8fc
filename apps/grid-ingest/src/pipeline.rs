use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

/// Outcome of one scheduled cycle, logged whether it succeeded or not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub pipeline: &'static str,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub rows_dropped: u64,
    pub errors: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl CycleReport {
    pub fn new(pipeline: &'static str) -> Self {
        Self {
            pipeline,
            ..Self::default()
        }
    }

    pub fn failed(mut self, err: &anyhow::Error) -> Self {
        self.errors += 1;
        self.error = Some(format!("{err:#}"));
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn log(&self) {
        if let Some(error) = &self.error {
            tracing::error!(
                pipeline = self.pipeline,
                rows_written = self.rows_written,
                rows_skipped = self.rows_skipped,
                rows_dropped = self.rows_dropped,
                errors = self.errors,
                duration_ms = self.duration_ms,
                error = %error,
                "cycle failed"
            );
        } else {
            tracing::info!(
                pipeline = self.pipeline,
                rows_written = self.rows_written,
                rows_skipped = self.rows_skipped,
                rows_dropped = self.rows_dropped,
                errors = self.errors,
                duration_ms = self.duration_ms,
                "cycle complete"
            );
        }
    }
}

#[derive(Debug)]
pub struct PipelineStats {
    pub cycles: AtomicU64,
    pub rows_written: AtomicU64,
    pub rows_skipped: AtomicU64,
    pub rows_dropped: AtomicU64,
    pub errors: AtomicU64,
    pub skipped_ticks: AtomicU64,
    pub last_duration_ms: AtomicU64,
    pub last_success_unix_ms: AtomicU64,
    pub running: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            rows_skipped: AtomicU64::new(0),
            rows_dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            last_duration_ms: AtomicU64::new(0),
            last_success_unix_ms: AtomicU64::new(0),
            running: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn record(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.rows_written
            .fetch_add(report.rows_written, Ordering::Relaxed);
        self.rows_skipped
            .fetch_add(report.rows_skipped, Ordering::Relaxed);
        self.rows_dropped
            .fetch_add(report.rows_dropped, Ordering::Relaxed);
        self.errors.fetch_add(report.errors, Ordering::Relaxed);
        self.last_duration_ms
            .store(report.duration_ms, Ordering::Relaxed);
        match &report.error {
            Some(err) => self.record_error(err.clone()),
            None => {
                let now = Utc::now().timestamp_millis().max(0) as u64;
                self.last_success_unix_ms.store(now, Ordering::Relaxed);
                self.clear_error();
            }
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes the cycles of one logical pipeline.
///
/// A tick that arrives while the previous cycle is still running is skipped
/// rather than queued. Separate pipelines use separate guards and may run
/// concurrently.
pub struct PipelineGuard {
    name: &'static str,
    lock: tokio::sync::Mutex<()>,
    stats: Arc<PipelineStats>,
}

impl PipelineGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: tokio::sync::Mutex::new(()),
            stats: Arc::new(PipelineStats::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub async fn try_run<F, Fut>(&self, cycle: F) -> Option<CycleReport>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CycleReport>,
    {
        let Ok(_held) = self.lock.try_lock() else {
            self.stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(pipeline = self.name, "previous cycle still running; skipping tick");
            return None;
        };
        self.stats.running.store(true, Ordering::Relaxed);
        let report = cycle().await;
        self.stats.running.store(false, Ordering::Relaxed);
        self.stats.record(&report);
        report.log();
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn overlapping_cycles_of_one_pipeline_are_skipped() {
        let guard = Arc::new(PipelineGuard::new("ingest"));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let slow = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .try_run(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        CycleReport::new("ingest")
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let overlapped = guard.try_run(|| async { CycleReport::new("ingest") }).await;
        assert!(overlapped.is_none());
        assert_eq!(guard.stats().skipped_ticks.load(Ordering::Relaxed), 1);

        release_tx.send(()).unwrap();
        assert!(slow.await.unwrap().is_some());
        assert!(guard
            .try_run(|| async { CycleReport::new("ingest") })
            .await
            .is_some());
        assert_eq!(guard.stats().cycles.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn independent_pipelines_do_not_block_each_other() {
        let ingest = PipelineGuard::new("ingest");
        let anomaly = PipelineGuard::new("anomaly");
        let report = ingest
            .try_run(|| async {
                anomaly
                    .try_run(|| async { CycleReport::new("anomaly") })
                    .await
                    .expect("anomaly pipeline runs while ingest is busy");
                CycleReport::new("ingest")
            })
            .await;
        assert!(report.is_some());
    }

    #[test]
    fn failed_reports_are_recorded_as_errors() {
        let stats = PipelineStats::new();
        let report = CycleReport::new("ingest").failed(&anyhow::anyhow!("upstream unreachable"));
        stats.record(&report);
        assert_eq!(stats.errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.last_error().as_deref(), Some("upstream unreachable"));
        stats.record(&CycleReport::new("ingest"));
        assert!(stats.last_error().is_none());
    }
}
