/*!
Observability trace store.

An append-only `trace_events` table keyed by correlation id, with a
`(day, event, level)` daily rollup for trend analysis. Every FSM step, tool
call, plan state change, timed dispatch, and slice transition writes one
structured event.

Retention is TTL-based per severity (errors outlive non-errors) plus a
global row cap pruned oldest-first. The sink never fails its caller: a
trace write error is logged and swallowed.
*/

use std::path::Path;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;
use tracing::instrument;

use crate::store::StoreError;

const MAX_DETAIL_CHARS: usize = 4096;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trace_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  created_at TEXT NOT NULL,
  level TEXT NOT NULL,
  event TEXT NOT NULL,
  correlation_id TEXT,
  channel TEXT,
  user_id TEXT,
  node TEXT,
  cycle INTEGER,
  status TEXT,
  tool TEXT,
  error_code TEXT,
  latency_ms INTEGER,
  detail_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_trace_events_correlation_created
  ON trace_events (correlation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_trace_events_event_created
  ON trace_events (event, created_at);
CREATE INDEX IF NOT EXISTS idx_trace_events_level_created
  ON trace_events (level, created_at);

CREATE TABLE IF NOT EXISTS trace_daily_rollups (
  day TEXT NOT NULL,
  event TEXT NOT NULL,
  level TEXT NOT NULL,
  count INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (day, event, level)
);
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl TraceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceLevel::Debug => "debug",
            TraceLevel::Info => "info",
            TraceLevel::Warning => "warning",
            TraceLevel::Error => "error",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetentionConfig {
    pub non_error_ttl_days: i64,
    pub error_ttl_days: i64,
    pub max_rows: i64,
    pub maintenance_interval: StdDuration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            non_error_ttl_days: 14,
            error_ttl_days: 30,
            max_rows: 1_000_000,
            maintenance_interval: StdDuration::from_secs(6 * 60 * 60),
        }
    }
}

/// One structured trace event.
#[derive(Clone, Debug, Default)]
pub struct TraceEventRecord {
    pub ts: Option<DateTime<Utc>>,
    pub level: String,
    pub event: String,
    pub correlation_id: Option<String>,
    pub channel: Option<String>,
    pub user_id: Option<String>,
    pub node: Option<String>,
    pub cycle: Option<i64>,
    pub status: Option<String>,
    pub tool: Option<String>,
    pub error_code: Option<String>,
    pub latency_ms: Option<i64>,
    pub detail: Option<Value>,
}

/// SQLite-backed trace store. May share the main store's file or live in
/// its own (`OBSERVABILITY_DB_PATH`).
#[derive(Clone)]
pub struct TraceStore {
    pool: SqlitePool,
    retention: RetentionConfig,
}

impl TraceStore {
    pub async fn connect(
        path: impl AsRef<Path>,
        retention: RetentionConfig,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool, retention).await
    }

    pub async fn connect_in_memory(retention: RetentionConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool, retention).await
    }

    async fn from_pool(pool: SqlitePool, retention: RetentionConfig) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool, retention })
    }

    pub async fn record(&self, record: TraceEventRecord) -> Result<(), StoreError> {
        let created_at = record.ts.unwrap_or_else(Utc::now).to_rfc3339();
        let level = if record.level.is_empty() {
            "info".to_string()
        } else {
            record.level
        };
        let event = if record.event.is_empty() {
            "unknown_event".to_string()
        } else {
            record.event
        };
        let detail = record
            .detail
            .map(|value| truncate(&value.to_string(), MAX_DETAIL_CHARS));

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO trace_events
              (created_at, level, event, correlation_id, channel, user_id, node,
               cycle, status, tool, error_code, latency_ms, detail_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&created_at)
        .bind(&level)
        .bind(&event)
        .bind(record.correlation_id.as_deref())
        .bind(record.channel.as_deref())
        .bind(record.user_id.as_deref())
        .bind(record.node.as_deref())
        .bind(record.cycle)
        .bind(record.status.as_deref())
        .bind(record.tool.as_deref())
        .bind(record.error_code.as_deref())
        .bind(record.latency_ms)
        .bind(detail)
        .execute(&mut *tx)
        .await?;

        let day = &created_at[..10];
        sqlx::query(
            r#"
            INSERT INTO trace_daily_rollups (day, event, level, count)
            VALUES (?1, ?2, ?3, 1)
            ON CONFLICT (day, event, level) DO UPDATE SET count = count + 1
            "#,
        )
        .bind(day)
        .bind(&event)
        .bind(&level)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// TTL pruning plus the global row cap, oldest first.
    #[instrument(skip(self), err)]
    pub async fn run_maintenance(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let non_error_cutoff =
            (now - Duration::days(self.retention.non_error_ttl_days.max(1))).to_rfc3339();
        let error_cutoff =
            (now - Duration::days(self.retention.error_ttl_days.max(1))).to_rfc3339();

        let mut pruned = 0u64;
        pruned += sqlx::query(
            r#"
            DELETE FROM trace_events
            WHERE created_at < ?1
              AND lower(coalesce(level, 'info')) NOT IN ('warning', 'error')
            "#,
        )
        .bind(&non_error_cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        pruned += sqlx::query(
            r#"
            DELETE FROM trace_events
            WHERE created_at < ?1
              AND lower(coalesce(level, 'info')) IN ('warning', 'error')
            "#,
        )
        .bind(&error_cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if self.retention.max_rows > 0 {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trace_events")
                .fetch_one(&self.pool)
                .await?;
            let overflow = total - self.retention.max_rows;
            if overflow > 0 {
                pruned += sqlx::query(
                    r#"
                    DELETE FROM trace_events
                    WHERE id IN (
                        SELECT id FROM trace_events ORDER BY id ASC LIMIT ?1
                    )
                    "#,
                )
                .bind(overflow)
                .execute(&self.pool)
                .await?
                .rows_affected();
            }
        }
        Ok(pruned)
    }

    pub async fn events_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<TraceEventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT created_at, level, event, correlation_id, channel, user_id,
                   node, cycle, status, tool, error_code, latency_ms, detail_json
            FROM trace_events
            WHERE correlation_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| TraceEventRecord {
                ts: DateTime::parse_from_rfc3339(&row.get::<String, _>("created_at"))
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc)),
                level: row.get("level"),
                event: row.get("event"),
                correlation_id: row.get("correlation_id"),
                channel: row.get("channel"),
                user_id: row.get("user_id"),
                node: row.get("node"),
                cycle: row.get("cycle"),
                status: row.get("status"),
                tool: row.get("tool"),
                error_code: row.get("error_code"),
                latency_ms: row.get("latency_ms"),
                detail: row
                    .get::<Option<String>, _>("detail_json")
                    .and_then(|raw| serde_json::from_str(&raw).ok()),
            })
            .collect())
    }

    pub async fn rollup_count(&self, day: &str, event: &str, level: &str) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count FROM trace_daily_rollups WHERE day = ?1 AND event = ?2 AND level = ?3",
        )
        .bind(day)
        .bind(event)
        .bind(level)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn total_rows(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM trace_events")
            .fetch_one(&self.pool)
            .await?)
    }

    fn maintenance_interval(&self) -> StdDuration {
        self.retention.maintenance_interval.max(StdDuration::from_secs(1))
    }
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        raw.to_string()
    } else {
        let mut end = max;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        raw[..end].to_string()
    }
}

/// Cheap handle components use to emit trace events. Never fails the
/// caller.
#[derive(Clone)]
pub struct TraceSink {
    store: TraceStore,
}

impl TraceSink {
    #[must_use]
    pub fn new(store: TraceStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TraceStore {
        &self.store
    }

    pub fn event(&self, event: &str, level: TraceLevel) -> TraceEventBuilder<'_> {
        TraceEventBuilder {
            sink: self,
            record: TraceEventRecord {
                level: level.as_str().to_string(),
                event: event.to_string(),
                ..TraceEventRecord::default()
            },
        }
    }

    /// Background pruning loop.
    pub async fn run_maintenance_loop(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.store.maintenance_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.store.run_maintenance().await {
                        tracing::warn!(error = %err, "trace maintenance failed");
                    }
                }
            }
        }
    }
}

pub struct TraceEventBuilder<'a> {
    sink: &'a TraceSink,
    record: TraceEventRecord,
}

impl TraceEventBuilder<'_> {
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: Option<&str>) -> Self {
        self.record.correlation_id = correlation_id.map(ToString::to_string);
        self
    }

    #[must_use]
    pub fn channel(mut self, channel: &str) -> Self {
        self.record.channel = Some(channel.to_string());
        self
    }

    #[must_use]
    pub fn user_id(mut self, user_id: &str) -> Self {
        self.record.user_id = Some(user_id.to_string());
        self
    }

    #[must_use]
    pub fn node(mut self, node: &str) -> Self {
        self.record.node = Some(node.to_string());
        self
    }

    #[must_use]
    pub fn cycle(mut self, cycle: i64) -> Self {
        self.record.cycle = Some(cycle);
        self
    }

    #[must_use]
    pub fn status(mut self, status: &str) -> Self {
        self.record.status = Some(status.to_string());
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: &str) -> Self {
        self.record.tool = Some(tool.to_string());
        self
    }

    #[must_use]
    pub fn error_code(mut self, error_code: &str) -> Self {
        self.record.error_code = Some(error_code.to_string());
        self
    }

    #[must_use]
    pub fn latency_ms(mut self, latency_ms: i64) -> Self {
        self.record.latency_ms = Some(latency_ms);
        self
    }

    #[must_use]
    pub fn detail(mut self, detail: Value) -> Self {
        self.record.detail = Some(detail);
        self
    }

    pub async fn record(self) {
        if let Err(err) = self.sink.store.record(self.record).await {
            tracing::warn!(error = %err, "trace event write failed");
        }
    }
}
