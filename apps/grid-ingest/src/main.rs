use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use grid_ingest::anomaly::AnomalyCycle;
use grid_ingest::cli::{AnomaliesArgs, Cli, Commands, CountArgs, CoverageArgs, HistoryArgs, LatestArgs};
use grid_ingest::config::Config;
use grid_ingest::coverage::build_coverage;
use grid_ingest::ingest::IngestCycle;
use grid_ingest::pipeline::PipelineGuard;
use grid_ingest::store::{AnomalyQuery, LatestQuery, MeasurementStore, PgStore, SortOrder};
use grid_ingest::upstream::UpstreamClient;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,grid_ingest=info".into());
    // stdout carries query output; logs go to stderr.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "grid-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn connect_store(config: &Config) -> Result<Arc<PgStore>> {
    let url = config.require_database_url()?;
    let store = PgStore::connect(url, config.db_pool_size, config.store_timeout())
        .await
        .context("failed to connect to the measurement store")?;
    store
        .ensure_schema()
        .await
        .context("failed to ensure store schema")?;
    Ok(Arc::new(store))
}

fn build_ingest(config: &Config, store: Arc<PgStore>) -> Result<IngestCycle> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("grid-ingest/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    let upstream = UpstreamClient::new(
        http,
        config.upstream_url()?,
        config.page_limit,
        config.fetch_window(),
        config.http_timeout(),
        config.retry_policy(),
    );
    Ok(IngestCycle::new(
        store,
        Arc::new(upstream),
        config.retry_policy(),
        config.default_source.clone(),
    )
    .with_history_file(config.history_file.clone()))
}

fn build_anomaly(config: &Config, store: Arc<PgStore>) -> AnomalyCycle {
    AnomalyCycle::new(store, config.retry_policy(), config.anomaly())
}

fn print_json<T: Serialize>(rows: &T) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, rows)?;
    writeln!(out)?;
    Ok(())
}

/// Ticks `cycle` on `period` until the task is aborted; a tick never waits on a slow cycle.
fn spawn_schedule<F, Fut>(guard: Arc<PipelineGuard>, period: Duration, cycle: F) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = grid_ingest::pipeline::CycleReport> + Send + 'static,
{
    let cycle = Arc::new(cycle);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(pipeline = guard.name(), period_secs = period.as_secs(), "pipeline scheduled");
        loop {
            ticker.tick().await;
            let guard = guard.clone();
            let cycle = cycle.clone();
            tokio::spawn(async move {
                guard.try_run(|| cycle()).await;
            });
        }
    })
}

async fn run_scheduler(config: Config) -> Result<()> {
    let store = connect_store(&config).await?;
    let ingest = Arc::new(build_ingest(&config, store.clone())?);
    let anomaly = Arc::new(build_anomaly(&config, store));

    let ingest_guard = Arc::new(PipelineGuard::new("ingest"));
    let anomaly_guard = Arc::new(PipelineGuard::new("anomaly"));

    let ingest_handle = spawn_schedule(ingest_guard.clone(), config.ingest_interval(), move || {
        let ingest = ingest.clone();
        async move { ingest.run_once(Utc::now()).await }
    });
    let anomaly_handle = spawn_schedule(anomaly_guard.clone(), config.anomaly_interval(), move || {
        let anomaly = anomaly.clone();
        async move { anomaly.run_once(Utc::now()).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    ingest_handle.abort();
    anomaly_handle.abort();

    for guard in [&ingest_guard, &anomaly_guard] {
        let stats = guard.stats();
        tracing::info!(
            pipeline = guard.name(),
            cycles = stats.cycles.load(std::sync::atomic::Ordering::Relaxed),
            rows_written = stats.rows_written.load(std::sync::atomic::Ordering::Relaxed),
            errors = stats.errors.load(std::sync::atomic::Ordering::Relaxed),
            skipped_ticks = stats.skipped_ticks.load(std::sync::atomic::Ordering::Relaxed),
            "pipeline stopped"
        );
    }
    Ok(())
}

async fn run_history(config: &Config, args: HistoryArgs) -> Result<()> {
    let store = connect_store(config).await?;
    let rows = store
        .history(&args.filter.into_filter(Some(args.limit), args.order))
        .await
        .context("failed to read history")?;
    print_json(&rows)
}

async fn run_count(config: &Config, args: CountArgs) -> Result<()> {
    let store = connect_store(config).await?;
    let count = store
        .count(&args.filter.into_filter(None, SortOrder::default()))
        .await
        .context("failed to count rows")?;
    print_json(&serde_json::json!({ "count": count }))
}

async fn run_latest(config: &Config, args: LatestArgs) -> Result<()> {
    let store = connect_store(config).await?;
    let rows = store
        .latest(&LatestQuery {
            ukey: args.ukey,
            source: args.source,
            metric: args.metric,
            limit: Some(args.limit),
            order: args.order,
        })
        .await
        .context("failed to read latest state")?;
    print_json(&rows)
}

async fn run_coverage(config: &Config, args: CoverageArgs) -> Result<()> {
    let store = connect_store(config).await?;
    let counts = store
        .daily_counts()
        .await
        .context("failed to read daily counts")?;
    let mut rows = build_coverage(&counts, Utc::now().date_naive());
    if args.missing_only {
        rows.retain(|row| row.is_missing_day);
    }
    print_json(&rows)
}

async fn run_anomalies(config: &Config, args: AnomaliesArgs) -> Result<()> {
    let store = connect_store(config).await?;
    let rows = store
        .anomalies(&AnomalyQuery {
            start: args.start,
            end: args.end,
            source: args.source,
            metric: args.metric,
            limit: Some(args.limit),
            order: args.order,
        })
        .await
        .context("failed to read anomalies")?;
    print_json(&rows)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    match cli.command {
        Commands::Run => run_scheduler(config).await,
        Commands::Ingest => {
            let store = connect_store(&config).await?;
            let report = build_ingest(&config, store)?.run_once(Utc::now()).await;
            report.log();
            print_json(&report)?;
            anyhow::ensure!(report.is_success(), "ingest cycle failed");
            Ok(())
        }
        Commands::Detect => {
            let store = connect_store(&config).await?;
            let report = build_anomaly(&config, store).run_once(Utc::now()).await;
            report.log();
            print_json(&report)?;
            anyhow::ensure!(report.is_success(), "anomaly cycle failed");
            Ok(())
        }
        Commands::History(args) => run_history(&config, args).await,
        Commands::Count(args) => run_count(&config, args).await,
        Commands::Latest(args) => run_latest(&config, args).await,
        Commands::Coverage(args) => run_coverage(&config, args).await,
        Commands::Anomalies(args) => run_anomalies(&config, args).await,
    }
}
