//! Timed-signal repository.
//!
//! Rows are claimed for dispatch via a conditional update from `pending` to
//! `processing` stamped with a worker id, so exactly one scheduler wins a
//! row even if several tick concurrently. A crash mid-dispatch leaves a
//! stale `processing` row that `reclaim_stale` returns to `pending`.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{Result, SqliteTx};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimedStatus {
    Pending,
    Processing,
    Fired,
    Failed,
    Cancelled,
    Skipped,
    Dispatched,
}

impl TimedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimedStatus::Pending => "pending",
            TimedStatus::Processing => "processing",
            TimedStatus::Fired => "fired",
            TimedStatus::Failed => "failed",
            TimedStatus::Cancelled => "cancelled",
            TimedStatus::Skipped => "skipped",
            TimedStatus::Dispatched => "dispatched",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "processing" => TimedStatus::Processing,
            "fired" => TimedStatus::Fired,
            "failed" => TimedStatus::Failed,
            "cancelled" => TimedStatus::Cancelled,
            "skipped" => TimedStatus::Skipped,
            "dispatched" => TimedStatus::Dispatched,
            _ => TimedStatus::Pending,
        }
    }
}

/// Authoring shape for a new timed row.
#[derive(Clone, Debug)]
pub struct NewTimedSignal {
    pub id: String,
    pub trigger_at: DateTime<Utc>,
    pub rrule: Option<String>,
    pub timezone: Option<String>,
    pub signal_type: String,
    pub payload: Value,
    pub target: Option<String>,
    pub origin: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TimedSignalRow {
    pub id: String,
    pub trigger_at: DateTime<Utc>,
    pub next_trigger_at: Option<DateTime<Utc>>,
    pub rrule: Option<String>,
    pub timezone: Option<String>,
    pub status: TimedStatus,
    pub fired_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub signal_type: String,
    pub payload: Value,
    pub target: Option<String>,
    pub origin: Option<String>,
    pub correlation_id: Option<String>,
}

impl TimedSignalRow {
    /// The instant this row is due: the recurrence cursor if set, otherwise
    /// the original trigger.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.next_trigger_at.unwrap_or(self.trigger_at)
    }
}

pub struct TimedRepo {
    pool: SqlitePool,
}

impl TimedRepo {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotent insert on the row id.
    #[instrument(skip(self, row), fields(timed_id = %row.id), err)]
    pub async fn insert(&self, row: &NewTimedSignal) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let created = Self::insert_tx(&mut tx, row).await?;
        tx.commit().await?;
        Ok(created)
    }

    pub async fn insert_tx(tx: &mut SqliteTx<'_>, row: &NewTimedSignal) -> Result<bool> {
        let payload = serde_json::to_string(&row.payload)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO timed_signals
              (id, trigger_at, rrule, timezone, status, signal_type, payload,
               target, origin, correlation_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            "#,
        )
        .bind(&row.id)
        .bind(row.trigger_at.to_rfc3339())
        .bind(row.rrule.as_deref())
        .bind(row.timezone.as_deref())
        .bind(&row.signal_type)
        .bind(payload)
        .bind(row.target.as_deref())
        .bind(row.origin.as_deref())
        .bind(row.correlation_id.as_deref())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim all due pending rows for `worker_id`: conditional update to
    /// `processing`. Only one scheduler wins each row.
    #[instrument(skip(self), err)]
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<Vec<TimedSignalRow>> {
        let now_text = now.to_rfc3339();
        let rows = sqlx::query(
            r#"
            UPDATE timed_signals
            SET status = 'processing', worker_id = ?1, claimed_at = ?2,
                attempts = attempts + 1, updated_at = ?2
            WHERE status = 'pending'
              AND COALESCE(next_trigger_at, trigger_at) <= ?2
            RETURNING id, trigger_at, next_trigger_at, rrule, timezone, status,
                      fired_at, attempts, last_error, signal_type, payload,
                      target, origin, correlation_id
            "#,
        )
        .bind(worker_id)
        .bind(&now_text)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_timed).collect()
    }

    pub async fn mark_fired(&self, id: &str, fired_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE timed_signals
            SET status = 'fired', fired_at = ?2, worker_id = NULL,
                claimed_at = NULL, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(fired_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE timed_signals
            SET status = 'failed', last_error = ?2, worker_id = NULL,
                claimed_at = NULL, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark the current occurrence skipped and, for recurring rows, park the
    /// recurrence cursor at the next future occurrence.
    pub async fn mark_skipped(
        &self,
        id: &str,
        next_trigger_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match next_trigger_at {
            Some(next) => {
                sqlx::query(
                    r#"
                    UPDATE timed_signals
                    SET status = 'pending', next_trigger_at = ?2, worker_id = NULL,
                        claimed_at = NULL, updated_at = ?3
                    WHERE id = ?1
                    "#,
                )
                .bind(id)
                .bind(next.to_rfc3339())
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE timed_signals
                    SET status = 'skipped', worker_id = NULL, claimed_at = NULL,
                        updated_at = ?2
                    WHERE id = ?1
                    "#,
                )
                .bind(id)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// After a recurring row fired, move its cursor to the next occurrence
    /// and return it to `pending`.
    pub async fn reschedule(&self, id: &str, next_trigger_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE timed_signals
            SET status = 'pending', next_trigger_at = ?2, fired_at = NULL,
                worker_id = NULL, claimed_at = NULL, updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(next_trigger_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE timed_signals
            SET status = 'cancelled', updated_at = ?2
            WHERE id = ?1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return stale `processing` rows (claims older than `lease`) to
    /// `pending` so the next tick retries them.
    #[instrument(skip(self), err)]
    pub async fn reclaim_stale(&self, lease: Duration) -> Result<u64> {
        let cutoff = (Utc::now() - lease).to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE timed_signals
            SET status = 'pending', worker_id = NULL, claimed_at = NULL, updated_at = ?2
            WHERE status = 'processing' AND claimed_at < ?1
            "#,
        )
        .bind(cutoff)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: &str) -> Result<Option<TimedSignalRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, trigger_at, next_trigger_at, rrule, timezone, status,
                   fired_at, attempts, last_error, signal_type, payload,
                   target, origin, correlation_id
            FROM timed_signals
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_timed).transpose()
    }

    /// Pending rows ordered by due time, for status surfaces.
    pub async fn list_pending(&self, limit: i64) -> Result<Vec<TimedSignalRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, trigger_at, next_trigger_at, rrule, timezone, status,
                   fired_at, attempts, last_error, signal_type, payload,
                   target, origin, correlation_id
            FROM timed_signals
            WHERE status = 'pending'
            ORDER BY COALESCE(next_trigger_at, trigger_at) ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_timed).collect()
    }

    pub async fn count_with_status(&self, status: TimedStatus) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM timed_signals WHERE status = ?1",
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

fn row_to_timed(row: sqlx::sqlite::SqliteRow) -> Result<TimedSignalRow> {
    let payload: Option<String> = row.get("payload");
    let payload = match payload {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Value::Null,
    };
    Ok(TimedSignalRow {
        id: row.get("id"),
        trigger_at: parse_dt(row.get("trigger_at")),
        next_trigger_at: row
            .get::<Option<String>, _>("next_trigger_at")
            .map(parse_dt),
        rrule: row.get("rrule"),
        timezone: row.get("timezone"),
        status: TimedStatus::parse(&row.get::<String, _>("status")),
        fired_at: row.get::<Option<String>, _>("fired_at").map(parse_dt),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        signal_type: row.get("signal_type"),
        payload,
        target: row.get("target"),
        origin: row.get("origin"),
        correlation_id: row.get("correlation_id"),
    })
}

fn parse_dt(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
