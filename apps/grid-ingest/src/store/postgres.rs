use super::{
    bounded, AnomalyQuery, AppendOutcome, HistoryFilter, LatestQuery, MeasurementStore, SortOrder,
};
use crate::anomaly::AnomalyRecord;
use crate::coverage::DailyCount;
use crate::error::StoreError;
use crate::telemetry::{LatestState, Reading};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Rows per INSERT statement; keeps bind parameters well under the protocol limit.
const INSERT_CHUNK: usize = 5000;

const READING_COLUMNS: &str = "ts, source, metric, value, ukey, version, inserted_at";

const ANOMALY_COLUMNS: &str =
    "ts, source, metric, ukey, version, value, zscore, mean, std, threshold, dow, hour, minute";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32, timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool, timeout))
    }

    pub fn from_pool(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        bounded(self.timeout, "schema.ensure", async {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS measurements (
                    ts timestamptz not null,
                    source text not null,
                    metric text not null,
                    value double precision null,
                    ukey text not null,
                    version bigint not null,
                    inserted_at timestamptz not null default now(),
                    primary key (ukey, version)
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS measurements_metric_ts_idx ON measurements (metric, ts)",
            )
            .execute(&self.pool)
            .await?;
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS anomalies (
                    ts timestamptz not null,
                    source text not null,
                    metric text not null,
                    ukey text not null,
                    version bigint not null,
                    value double precision not null,
                    zscore double precision not null,
                    mean double precision not null,
                    std double precision not null,
                    threshold double precision not null,
                    dow smallint not null,
                    hour smallint not null,
                    minute smallint not null,
                    detected_at timestamptz not null default now(),
                    primary key (ukey, version)
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Fatal(format!("version {version} out of range")))
}

fn from_db_version(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version).map_err(|_| StoreError::Fatal(format!("negative version {version}")))
}

fn small(value: i16, column: &str) -> Result<u8, StoreError> {
    u8::try_from(value).map_err(|_| StoreError::Fatal(format!("{column} out of range: {value}")))
}

fn reading_from_row(row: &PgRow) -> Result<Reading, StoreError> {
    Ok(Reading {
        ts: row.try_get::<DateTime<Utc>, _>("ts")?,
        source: row.try_get::<String, _>("source")?,
        metric: row.try_get::<String, _>("metric")?,
        value: row.try_get::<Option<f64>, _>("value")?,
        ukey: row.try_get::<String, _>("ukey")?,
        version: from_db_version(row.try_get::<i64, _>("version")?)?,
        ingested_at: row.try_get::<DateTime<Utc>, _>("inserted_at")?,
    })
}

fn anomaly_from_row(row: &PgRow) -> Result<AnomalyRecord, StoreError> {
    Ok(AnomalyRecord {
        ts: row.try_get::<DateTime<Utc>, _>("ts")?,
        source: row.try_get::<String, _>("source")?,
        metric: row.try_get::<String, _>("metric")?,
        ukey: row.try_get::<String, _>("ukey")?,
        version: from_db_version(row.try_get::<i64, _>("version")?)?,
        value: row.try_get::<f64, _>("value")?,
        zscore: row.try_get::<f64, _>("zscore")?,
        mean: row.try_get::<f64, _>("mean")?,
        std: row.try_get::<f64, _>("std")?,
        threshold: row.try_get::<f64, _>("threshold")?,
        dow: small(row.try_get::<i16, _>("dow")?, "dow")?,
        hour: small(row.try_get::<i16, _>("hour")?, "hour")?,
        minute: small(row.try_get::<i16, _>("minute")?, "minute")?,
    })
}

fn push_history_filter<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a HistoryFilter) {
    if let Some(start) = filter.start {
        builder.push(" AND ts >= ").push_bind(start);
    }
    if let Some(end) = filter.end {
        builder.push(" AND ts < ").push_bind(end);
    }
    if let Some(source) = &filter.source {
        builder.push(" AND source = ").push_bind(source);
    }
    if let Some(metric) = &filter.metric {
        builder.push(" AND metric = ").push_bind(metric);
    }
    if let Some(ukey) = &filter.ukey {
        builder.push(" AND ukey = ").push_bind(ukey);
    }
}

fn push_order_and_limit(builder: &mut QueryBuilder<'_, Postgres>, column: &str, order: SortOrder, limit: Option<usize>) {
    builder.push(format!(" ORDER BY {column} "));
    builder.push(match order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    });
    if let Some(limit) = limit {
        builder.push(" LIMIT ");
        builder.push_bind(limit.min(i64::MAX as usize) as i64);
    }
}

#[async_trait]
impl MeasurementStore for PgStore {
    async fn is_empty(&self) -> Result<bool, StoreError> {
        bounded(self.timeout, "measurements.is_empty", async {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM measurements)")
                .fetch_one(&self.pool)
                .await?;
            Ok(!exists)
        })
        .await
    }

    async fn latest_state(&self, ukeys: &[String]) -> Result<HashMap<String, LatestState>, StoreError> {
        if ukeys.is_empty() {
            return Ok(HashMap::new());
        }
        bounded(self.timeout, "measurements.latest_state", async {
            let rows = sqlx::query(
                r#"
                SELECT DISTINCT ON (ukey) ukey, value, version
                FROM measurements
                WHERE ukey = ANY($1)
                ORDER BY ukey, version DESC, inserted_at DESC
                "#,
            )
            .bind(ukeys)
            .fetch_all(&self.pool)
            .await?;

            let mut state = HashMap::with_capacity(rows.len());
            for row in rows {
                state.insert(
                    row.try_get::<String, _>("ukey")?,
                    LatestState {
                        value: row.try_get::<Option<f64>, _>("value")?,
                        version: from_db_version(row.try_get::<i64, _>("version")?)?,
                    },
                );
            }
            Ok(state)
        })
        .await
    }

    async fn append(&self, rows: &[Reading]) -> Result<AppendOutcome, StoreError> {
        if rows.is_empty() {
            return Ok(AppendOutcome::default());
        }
        let versions = rows
            .iter()
            .map(|row| to_db_version(row.version))
            .collect::<Result<Vec<i64>, _>>()?;

        bounded(self.timeout, "measurements.append", async {
            let mut tx = self.pool.begin().await?;
            let mut inserted: HashSet<(String, i64)> = HashSet::with_capacity(rows.len());
            for (chunk, chunk_versions) in rows.chunks(INSERT_CHUNK).zip(versions.chunks(INSERT_CHUNK)) {
                let mut builder: QueryBuilder<Postgres> =
                    QueryBuilder::new(format!("INSERT INTO measurements ({READING_COLUMNS}) "));
                builder.push_values(chunk.iter().zip(chunk_versions), |mut b, (row, version)| {
                    b.push_bind(row.ts)
                        .push_bind(&row.source)
                        .push_bind(&row.metric)
                        .push_bind(row.value)
                        .push_bind(&row.ukey)
                        .push_bind(*version)
                        .push_bind(row.ingested_at);
                });
                builder.push(" ON CONFLICT (ukey, version) DO NOTHING RETURNING ukey, version");

                for returned in builder.build().fetch_all(&mut *tx).await? {
                    inserted.insert((
                        returned.try_get::<String, _>("ukey")?,
                        returned.try_get::<i64, _>("version")?,
                    ));
                }
            }
            let conflicts: Vec<(String, u64)> = rows
                .iter()
                .zip(&versions)
                .filter(|(row, version)| !inserted.contains(&(row.ukey.clone(), **version)))
                .map(|(row, _)| (row.ukey.clone(), row.version))
                .collect();
            if !conflicts.is_empty() {
                tx.rollback().await?;
                tracing::warn!(
                    rows = rows.len(),
                    conflicts = conflicts.len(),
                    "append rolled back on existing (ukey, version)"
                );
                return Ok(AppendOutcome { written: 0, conflicts });
            }
            tx.commit().await?;
            Ok(AppendOutcome {
                written: inserted.len(),
                conflicts,
            })
        })
        .await
    }

    async fn history(&self, filter: &HistoryFilter) -> Result<Vec<Reading>, StoreError> {
        bounded(self.timeout, "measurements.history", async {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("SELECT {READING_COLUMNS} FROM measurements WHERE TRUE"));
            push_history_filter(&mut builder, filter);
            push_order_and_limit(&mut builder, "ts", filter.order, filter.limit);

            let rows = builder.build().fetch_all(&self.pool).await?;
            rows.iter().map(reading_from_row).collect()
        })
        .await
    }

    async fn count(&self, filter: &HistoryFilter) -> Result<u64, StoreError> {
        bounded(self.timeout, "measurements.count", async {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("SELECT COUNT(*) FROM measurements WHERE TRUE");
            push_history_filter(&mut builder, filter);
            let count = builder.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
            u64::try_from(count).map_err(|_| StoreError::Fatal(format!("negative row count {count}")))
        })
        .await
    }

    async fn latest(&self, query: &LatestQuery) -> Result<Vec<Reading>, StoreError> {
        bounded(self.timeout, "measurements.latest", async {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "SELECT {READING_COLUMNS} FROM (SELECT DISTINCT ON (ukey) {READING_COLUMNS} FROM measurements WHERE TRUE"
            ));
            if let Some(ukey) = &query.ukey {
                builder.push(" AND ukey = ").push_bind(ukey);
            }
            if let Some(source) = &query.source {
                builder.push(" AND source = ").push_bind(source);
            }
            if let Some(metric) = &query.metric {
                builder.push(" AND metric = ").push_bind(metric);
            }
            builder.push(" ORDER BY ukey, version DESC, inserted_at DESC) latest");
            push_order_and_limit(&mut builder, "ts", query.order, query.limit);

            let rows = builder.build().fetch_all(&self.pool).await?;
            rows.iter().map(reading_from_row).collect()
        })
        .await
    }

    async fn daily_counts(&self) -> Result<Vec<DailyCount>, StoreError> {
        bounded(self.timeout, "measurements.daily_counts", async {
            let rows = sqlx::query(
                r#"
                SELECT
                    (ts AT TIME ZONE 'UTC')::date AS day,
                    source,
                    metric,
                    COUNT(*) AS row_count,
                    MIN(inserted_at) AS first_ingested_at,
                    MAX(inserted_at) AS last_ingested_at
                FROM measurements
                GROUP BY 1, 2, 3
                ORDER BY 1, 2, 3
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

            rows.iter()
                .map(|row| -> Result<DailyCount, StoreError> {
                    Ok(DailyCount {
                        day: row.try_get::<NaiveDate, _>("day")?,
                        source: row.try_get::<String, _>("source")?,
                        metric: row.try_get::<String, _>("metric")?,
                        rows: row.try_get::<i64, _>("row_count")?.max(0) as u64,
                        first_ingested_at: row.try_get::<Option<DateTime<Utc>>, _>("first_ingested_at")?,
                        last_ingested_at: row.try_get::<Option<DateTime<Utc>>, _>("last_ingested_at")?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn append_anomalies(&self, rows: &[AnomalyRecord]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let versions = rows
            .iter()
            .map(|row| to_db_version(row.version))
            .collect::<Result<Vec<i64>, _>>()?;

        bounded(self.timeout, "anomalies.append", async {
            let mut tx = self.pool.begin().await?;
            let mut written = 0usize;
            for (chunk, chunk_versions) in rows.chunks(INSERT_CHUNK / 2).zip(versions.chunks(INSERT_CHUNK / 2)) {
                let mut builder: QueryBuilder<Postgres> =
                    QueryBuilder::new(format!("INSERT INTO anomalies ({ANOMALY_COLUMNS}) "));
                builder.push_values(chunk.iter().zip(chunk_versions), |mut b, (row, version)| {
                    b.push_bind(row.ts)
                        .push_bind(&row.source)
                        .push_bind(&row.metric)
                        .push_bind(&row.ukey)
                        .push_bind(*version)
                        .push_bind(row.value)
                        .push_bind(row.zscore)
                        .push_bind(row.mean)
                        .push_bind(row.std)
                        .push_bind(row.threshold)
                        .push_bind(i16::from(row.dow))
                        .push_bind(i16::from(row.hour))
                        .push_bind(i16::from(row.minute));
                });
                builder.push(
                    r#" ON CONFLICT (ukey, version) DO UPDATE SET
                        zscore = EXCLUDED.zscore,
                        mean = EXCLUDED.mean,
                        std = EXCLUDED.std,
                        threshold = EXCLUDED.threshold,
                        detected_at = now()"#,
                );
                written += builder.build().execute(&mut *tx).await?.rows_affected() as usize;
            }
            tx.commit().await?;
            Ok(written)
        })
        .await
    }

    async fn anomalies(&self, query: &AnomalyQuery) -> Result<Vec<AnomalyRecord>, StoreError> {
        bounded(self.timeout, "anomalies.list", async {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE TRUE"));
            if let Some(start) = query.start {
                builder.push(" AND ts >= ").push_bind(start);
            }
            if let Some(end) = query.end {
                builder.push(" AND ts < ").push_bind(end);
            }
            if let Some(source) = &query.source {
                builder.push(" AND source = ").push_bind(source);
            }
            if let Some(metric) = &query.metric {
                builder.push(" AND metric = ").push_bind(metric);
            }
            push_order_and_limit(&mut builder, "ts", query.order, query.limit);

            let rows = builder.build().fetch_all(&self.pool).await?;
            rows.iter().map(anomaly_from_row).collect()
        })
        .await
    }
}
