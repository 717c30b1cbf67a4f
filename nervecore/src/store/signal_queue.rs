//! Durable signal queue: at-least-once ingestion, idempotent on signal id.
//!
//! Durable signals land here before the in-memory bus delivery; the queue
//! poller re-feeds unconsumed rows after a restart. Consumers must be
//! idempotent: a row may be delivered more than once, never zero times.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{Result, SqliteTx};
use crate::signal::{Signal, SignalStatus};

#[derive(Clone, Debug)]
pub struct QueuedSignal {
    pub signal: Signal,
    pub status: SignalStatus,
    pub error: Option<String>,
}

pub struct SignalQueueRepo {
    pool: SqlitePool,
}

impl SignalQueueRepo {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the signal if its id is not already queued. Returns `true`
    /// when a new row was created.
    #[instrument(skip(self, signal), fields(signal_id = %signal.id), err)]
    pub async fn enqueue(&self, signal: &Signal) -> Result<bool> {
        let payload = serde_json::to_string(&signal.payload)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO signal_queue
              (signal_id, signal_type, source, payload, correlation_id,
               durable, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?7)
            "#,
        )
        .bind(&signal.id)
        .bind(&signal.signal_type)
        .bind(&signal.source)
        .bind(payload)
        .bind(&signal.correlation_id)
        .bind(signal.durable as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transactional variant used when an action's emitted signals must
    /// commit atomically with the FSM step.
    pub async fn enqueue_tx(tx: &mut SqliteTx<'_>, signal: &Signal) -> Result<bool> {
        let payload = serde_json::to_string(&signal.payload)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO signal_queue
              (signal_id, signal_type, source, payload, correlation_id,
               durable, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?7)
            "#,
        )
        .bind(&signal.id)
        .bind(&signal.signal_type)
        .bind(&signal.source)
        .bind(payload)
        .bind(&signal.correlation_id)
        .bind(signal.durable as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically claim up to `max_n` queued rows for `worker_id`, oldest
    /// first. Claimed rows move to `processing`.
    #[instrument(skip(self), err)]
    pub async fn claim(&self, max_n: i64, worker_id: &str) -> Result<Vec<Signal>> {
        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            r#"
            UPDATE signal_queue
            SET status = 'processing', worker_id = ?1, claimed_at = ?2, updated_at = ?2
            WHERE signal_id IN (
                SELECT signal_id FROM signal_queue
                WHERE status = 'queued'
                ORDER BY created_at ASC
                LIMIT ?3
            )
            RETURNING signal_id, signal_type, source, payload, correlation_id,
                      durable, created_at
            "#,
        )
        .bind(worker_id)
        .bind(&now)
        .bind(max_n)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_signal).collect()
    }

    /// Claim queued rows older than `min_age`. The queue poller uses this:
    /// a freshly enqueued row is normally consumed through the in-memory
    /// bus, so only rows that sat unconsumed (typically from a previous
    /// process) are re-fed.
    #[instrument(skip(self), err)]
    pub async fn claim_overdue(
        &self,
        max_n: i64,
        worker_id: &str,
        min_age: Duration,
    ) -> Result<Vec<Signal>> {
        let now = Utc::now().to_rfc3339();
        let cutoff = (Utc::now() - min_age).to_rfc3339();
        let rows = sqlx::query(
            r#"
            UPDATE signal_queue
            SET status = 'processing', worker_id = ?1, claimed_at = ?2, updated_at = ?2
            WHERE signal_id IN (
                SELECT signal_id FROM signal_queue
                WHERE status = 'queued' AND created_at < ?3
                ORDER BY created_at ASC
                LIMIT ?4
            )
            RETURNING signal_id, signal_type, source, payload, correlation_id,
                      durable, created_at
            "#,
        )
        .bind(worker_id)
        .bind(&now)
        .bind(&cutoff)
        .bind(max_n)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_signal).collect()
    }

    /// Mark a claimed signal terminal.
    pub async fn complete(
        &self,
        signal_id: &str,
        ok: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let status = if ok { "done" } else { "failed" };
        sqlx::query(
            r#"
            UPDATE signal_queue
            SET status = ?2, error = ?3, updated_at = ?4
            WHERE signal_id = ?1
            "#,
        )
        .bind(signal_id)
        .bind(status)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_tx(
        tx: &mut SqliteTx<'_>,
        signal_id: &str,
        ok: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let status = if ok { "done" } else { "failed" };
        sqlx::query(
            r#"
            UPDATE signal_queue
            SET status = ?2, error = ?3, updated_at = ?4
            WHERE signal_id = ?1
            "#,
        )
        .bind(signal_id)
        .bind(status)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Return `processing` rows whose claim is older than `lease` to
    /// `queued`. Crash recovery: the claiming worker never completed them.
    #[instrument(skip(self), err)]
    pub async fn reclaim_stale(&self, lease: Duration) -> Result<u64> {
        let cutoff = (Utc::now() - lease).to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE signal_queue
            SET status = 'queued', worker_id = NULL, claimed_at = NULL, updated_at = ?2
            WHERE status = 'processing' AND claimed_at < ?1
            "#,
        )
        .bind(cutoff)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, signal_id: &str) -> Result<Option<QueuedSignal>> {
        let row = sqlx::query(
            r#"
            SELECT signal_id, signal_type, source, payload, correlation_id,
                   durable, status, error, created_at
            FROM signal_queue
            WHERE signal_id = ?1
            "#,
        )
        .bind(signal_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let status = match row.get::<String, _>("status").as_str() {
                    "processing" => SignalStatus::Processing,
                    "done" => SignalStatus::Done,
                    "failed" => SignalStatus::Failed,
                    _ => SignalStatus::Queued,
                };
                let error: Option<String> = row.get("error");
                Ok(Some(QueuedSignal {
                    signal: row_to_signal(row)?,
                    status,
                    error,
                }))
            }
        }
    }

    pub async fn count_with_status(&self, status: SignalStatus) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM signal_queue WHERE status = ?1",
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn row_to_signal(row: sqlx::sqlite::SqliteRow) -> Result<Signal> {
    let payload: Option<String> = row.get("payload");
    let payload = match payload {
        Some(raw) => serde_json::from_str(&raw)?,
        None => serde_json::Value::Null,
    };
    let created_at: String = row.get("created_at");
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let id: String = row.get("signal_id");
    let correlation_id: Option<String> = row.get("correlation_id");
    Ok(Signal {
        correlation_id: correlation_id.unwrap_or_else(|| id.clone()),
        id,
        signal_type: row.get("signal_type"),
        source: row.get::<Option<String>, _>("source").unwrap_or_default(),
        payload,
        created_at,
        durable: row.get::<i64, _>("durable") != 0,
    })
}
