use crate::anomaly::AnomalyConfig;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const MAX_WINDOW_HOURS: i64 = 24 * 366;
const MAX_LOOKBACK_DAYS: i64 = 3660;
const DEFAULT_UPSTREAM_URL: &str = "https://odre.opendatasoft.com/api/explore/v2.1/catalog/datasets/eco2mix-national-tr/records?order_by=date_heure%20DESC";

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|value| value.parse::<T>().ok())
}

fn overrides_path() -> Option<PathBuf> {
    env_value("GRID_CONFIG_PATH").map(PathBuf::from)
}

/// JSON file values; each applies only when its env var is unset.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    upstream_url: Option<String>,
    #[serde(default)]
    default_source: Option<String>,
    #[serde(default)]
    page_limit: Option<usize>,
    #[serde(default)]
    fetch_window_hours: Option<i64>,
    #[serde(default)]
    ingest_interval_secs: Option<u64>,
    #[serde(default)]
    anomaly_interval_secs: Option<u64>,
    #[serde(default)]
    retry_attempts: Option<u32>,
    #[serde(default)]
    anomaly_lookback_days: Option<i64>,
    #[serde(default)]
    anomaly_eval_hours: Option<i64>,
    #[serde(default)]
    anomaly_z_threshold: Option<f64>,
    #[serde(default)]
    anomaly_min_samples: Option<usize>,
    #[serde(default)]
    anomaly_metric: Option<String>,
    #[serde(default)]
    history_file: Option<String>,
}

fn load_overrides() -> Option<ConfigOverrides> {
    let path = overrides_path()?;
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "grid-ingest failed to read config overrides; using env defaults"
            );
            return None;
        }
    };
    parse_overrides(contents).map_err(|err| {
        tracing::warn!(
            path = %path.display(),
            error = %err,
            "grid-ingest failed to parse config overrides; using env defaults"
        );
    })
    .ok()
}

fn parse_overrides(contents: String) -> Result<ConfigOverrides, simd_json::Error> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
}

fn apply_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    let env_allows = |key: &str| env_value(key).is_none();
    let text = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if config.database_url.is_none() {
        config.database_url = text(&overrides.database_url).map(normalize_database_url);
    }
    if env_allows("GRID_UPSTREAM_URL") {
        if let Some(url) = text(&overrides.upstream_url) {
            config.upstream_url = url;
        }
    }
    if env_allows("GRID_DEFAULT_SOURCE") {
        if let Some(source) = text(&overrides.default_source) {
            config.default_source = source;
        }
    }
    if env_allows("GRID_PAGE_LIMIT") {
        if let Some(value) = overrides.page_limit.filter(|v| *v != 0) {
            config.page_limit = value;
        }
    }
    if env_allows("GRID_FETCH_WINDOW_HOURS") {
        if let Some(value) = overrides.fetch_window_hours.filter(|v| *v > 0) {
            config.fetch_window_hours = value;
        }
    }
    if env_allows("GRID_INGEST_INTERVAL_SECS") {
        if let Some(value) = overrides.ingest_interval_secs.filter(|v| *v != 0) {
            config.ingest_interval_secs = value;
        }
    }
    if env_allows("GRID_ANOMALY_INTERVAL_SECS") {
        if let Some(value) = overrides.anomaly_interval_secs.filter(|v| *v != 0) {
            config.anomaly_interval_secs = value;
        }
    }
    if env_allows("GRID_RETRY_ATTEMPTS") {
        if let Some(value) = overrides.retry_attempts.filter(|v| *v != 0) {
            config.retry_attempts = value;
        }
    }
    if env_allows("GRID_ANOMALY_LOOKBACK_DAYS") {
        if let Some(value) = overrides.anomaly_lookback_days.filter(|v| *v > 0) {
            config.anomaly_lookback_days = value;
        }
    }
    if env_allows("GRID_ANOMALY_EVAL_HOURS") {
        if let Some(value) = overrides.anomaly_eval_hours.filter(|v| *v > 0) {
            config.anomaly_eval_hours = value;
        }
    }
    if env_allows("GRID_ANOMALY_Z") {
        if let Some(value) = overrides.anomaly_z_threshold.filter(|v| *v > 0.0) {
            config.anomaly_z_threshold = value;
        }
    }
    if env_allows("GRID_ANOMALY_MIN_SAMPLES") {
        if let Some(value) = overrides.anomaly_min_samples.filter(|v| *v != 0) {
            config.anomaly_min_samples = value;
        }
    }
    if env_allows("GRID_ANOMALY_METRIC") {
        if let Some(metric) = text(&overrides.anomaly_metric) {
            config.anomaly_metric = metric;
        }
    }
    if env_allows("GRID_HISTORY_FILE") {
        if let Some(path) = text(&overrides.history_file) {
            config.history_file = Some(PathBuf::from(path));
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub upstream_url: String,
    pub default_source: String,
    pub page_limit: usize,
    pub fetch_window_hours: i64,
    pub http_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub ingest_interval_secs: u64,
    pub anomaly_interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub anomaly_lookback_days: i64,
    pub anomaly_eval_hours: i64,
    pub anomaly_z_threshold: f64,
    pub anomaly_min_samples: usize,
    pub anomaly_metric: String,
    pub anomaly_source: Option<String>,
    pub bucket_minutes: u32,
    pub history_file: Option<PathBuf>,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let anomaly = AnomalyConfig::default();
        Self {
            database_url: None,
            db_pool_size: 5,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            default_source: "France".to_string(),
            page_limit: 100,
            fetch_window_hours: 24,
            http_timeout_secs: 30,
            store_timeout_secs: 30,
            ingest_interval_secs: 60,
            anomaly_interval_secs: 900,
            retry_attempts: 5,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            anomaly_lookback_days: anomaly.lookback_days,
            anomaly_eval_hours: anomaly.eval_hours,
            anomaly_z_threshold: anomaly.z_threshold,
            anomaly_min_samples: anomaly.min_samples,
            anomaly_metric: anomaly.metric,
            anomaly_source: anomaly.source,
            bucket_minutes: anomaly.bucket_minutes,
            history_file: None,
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let defaults = Self::default();
        let database_url = env_value("GRID_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .map(normalize_database_url);

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("GRID_DB_POOL_SIZE").unwrap_or(defaults.db_pool_size),
            upstream_url: env_value("GRID_UPSTREAM_URL").unwrap_or(defaults.upstream_url),
            default_source: env_value("GRID_DEFAULT_SOURCE").unwrap_or(defaults.default_source),
            page_limit: env_parse("GRID_PAGE_LIMIT").unwrap_or(defaults.page_limit),
            fetch_window_hours: env_parse("GRID_FETCH_WINDOW_HOURS")
                .unwrap_or(defaults.fetch_window_hours),
            http_timeout_secs: env_parse("GRID_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            store_timeout_secs: env_parse("GRID_STORE_TIMEOUT_SECS")
                .unwrap_or(defaults.store_timeout_secs),
            ingest_interval_secs: env_parse("GRID_INGEST_INTERVAL_SECS")
                .unwrap_or(defaults.ingest_interval_secs),
            anomaly_interval_secs: env_parse("GRID_ANOMALY_INTERVAL_SECS")
                .unwrap_or(defaults.anomaly_interval_secs),
            retry_attempts: env_parse("GRID_RETRY_ATTEMPTS").unwrap_or(defaults.retry_attempts),
            retry_base_delay_ms: env_parse("GRID_RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.retry_base_delay_ms),
            retry_max_delay_ms: env_parse("GRID_RETRY_MAX_DELAY_MS")
                .unwrap_or(defaults.retry_max_delay_ms),
            anomaly_lookback_days: env_parse("GRID_ANOMALY_LOOKBACK_DAYS")
                .unwrap_or(defaults.anomaly_lookback_days),
            anomaly_eval_hours: env_parse("GRID_ANOMALY_EVAL_HOURS")
                .unwrap_or(defaults.anomaly_eval_hours),
            anomaly_z_threshold: env_parse("GRID_ANOMALY_Z").unwrap_or(defaults.anomaly_z_threshold),
            anomaly_min_samples: env_parse("GRID_ANOMALY_MIN_SAMPLES")
                .unwrap_or(defaults.anomaly_min_samples),
            anomaly_metric: env_value("GRID_ANOMALY_METRIC").unwrap_or(defaults.anomaly_metric),
            anomaly_source: env_value("GRID_ANOMALY_SOURCE"),
            bucket_minutes: env_parse("GRID_BUCKET_MINUTES").unwrap_or(defaults.bucket_minutes),
            history_file: env_value("GRID_HISTORY_FILE").map(PathBuf::from),
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = load_overrides() {
            apply_overrides(&mut config, &overrides);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.upstream_url()?;
        anyhow::ensure!(self.page_limit > 0, "GRID_PAGE_LIMIT must be positive");
        anyhow::ensure!(
            (1..=60).contains(&self.bucket_minutes) && 60 % self.bucket_minutes == 0,
            "GRID_BUCKET_MINUTES must divide an hour"
        );
        anyhow::ensure!(
            (1..=MAX_WINDOW_HOURS).contains(&self.fetch_window_hours),
            "GRID_FETCH_WINDOW_HOURS must be between 1 and {MAX_WINDOW_HOURS}"
        );
        anyhow::ensure!(
            (1..=MAX_WINDOW_HOURS).contains(&self.anomaly_eval_hours),
            "GRID_ANOMALY_EVAL_HOURS must be between 1 and {MAX_WINDOW_HOURS}"
        );
        anyhow::ensure!(
            (1..=MAX_LOOKBACK_DAYS).contains(&self.anomaly_lookback_days),
            "GRID_ANOMALY_LOOKBACK_DAYS must be between 1 and {MAX_LOOKBACK_DAYS}"
        );
        anyhow::ensure!(
            self.anomaly_z_threshold.is_finite() && self.anomaly_z_threshold > 0.0,
            "GRID_ANOMALY_Z must be a positive number"
        );
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("GRID_DATABASE_URL or DATABASE_URL is required (or database_url in GRID_CONFIG_PATH)")
    }

    pub fn upstream_url(&self) -> Result<Url> {
        Url::parse(&self.upstream_url)
            .with_context(|| format!("invalid GRID_UPSTREAM_URL {:?}", self.upstream_url))
    }

    pub fn fetch_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.fetch_window_hours)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_secs(self.ingest_interval_secs.max(1))
    }

    pub fn anomaly_interval(&self) -> Duration {
        Duration::from_secs(self.anomaly_interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn anomaly(&self) -> AnomalyConfig {
        AnomalyConfig {
            metric: self.anomaly_metric.clone(),
            source: self.anomaly_source.clone(),
            lookback_days: self.anomaly_lookback_days,
            eval_hours: self.anomaly_eval_hours,
            z_threshold: self.anomaly_z_threshold,
            min_samples: self.anomaly_min_samples,
            bucket_minutes: self.bucket_minutes,
        }
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_parse_partial_documents() {
        let overrides = parse_overrides(
            r#"{"anomaly_metric": "nucleaire", "anomaly_min_samples": 8, "unknown": true}"#.to_string(),
        )
        .unwrap();
        assert_eq!(overrides.anomaly_metric.as_deref(), Some("nucleaire"));
        assert_eq!(overrides.anomaly_min_samples, Some(8));
        assert!(overrides.database_url.is_none());
    }

    #[test]
    fn overrides_fill_missing_database_url_and_skip_blank_values() {
        let mut config = Config::default();
        let overrides = ConfigOverrides {
            database_url: Some("postgresql+asyncpg://grid@db/grid".into()),
            default_source: Some("   ".into()),
            ..ConfigOverrides::default()
        };
        apply_overrides(&mut config, &overrides);
        assert_eq!(config.database_url.as_deref(), Some("postgresql://grid@db/grid"));
        assert_eq!(config.default_source, "France");
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.anomaly().min_samples, 20);
        assert_eq!(config.fetch_window(), chrono::Duration::hours(24));
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn out_of_range_windows_are_rejected() {
        let config = Config {
            anomaly_lookback_days: i64::MAX,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            anomaly_eval_hours: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            fetch_window_hours: i64::MAX / 2,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
