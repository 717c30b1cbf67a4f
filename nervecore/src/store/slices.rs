//! Slice-executor repository: cooperative tasks, versioned checkpoints, and
//! the per-task audit trail.
//!
//! Leases are conditional updates (at most one worker holds a task at a
//! time; a lease whose wall clock expired may be stolen). Checkpoint writes
//! are compare-and-swap on `version`, so a stale worker cannot clobber a
//! newer checkpoint.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use super::{Result, SqliteTx};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceStatus {
    Queued,
    Running,
    WaitingUser,
    Done,
    Failed,
    Paused,
}

impl SliceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceStatus::Queued => "queued",
            SliceStatus::Running => "running",
            SliceStatus::WaitingUser => "waiting_user",
            SliceStatus::Done => "done",
            SliceStatus::Failed => "failed",
            SliceStatus::Paused => "paused",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => SliceStatus::Running,
            "waiting_user" => SliceStatus::WaitingUser,
            "done" => SliceStatus::Done,
            "failed" => SliceStatus::Failed,
            "paused" => SliceStatus::Paused,
            _ => SliceStatus::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SliceStatus::Done | SliceStatus::Failed)
    }
}

#[derive(Clone, Debug)]
pub struct SliceTask {
    pub task_id: String,
    pub owner_id: String,
    pub conversation_key: String,
    pub session_id: Option<String>,
    pub status: SliceStatus,
    pub priority: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub slice_cycles: i64,
    pub max_cycles: Option<i64>,
    pub max_runtime_seconds: Option<i64>,
    pub token_budget_remaining: Option<i64>,
    pub failure_streak: i64,
    pub last_error: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SliceTask {
    /// A fresh queued task with defaults matching the executor's budgets.
    #[must_use]
    pub fn queued(owner_id: &str, conversation_key: &str, slice_cycles: i64) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            conversation_key: conversation_key.into(),
            session_id: None,
            status: SliceStatus::Queued,
            priority: 100,
            next_run_at: None,
            lease_until: None,
            worker_id: None,
            slice_cycles,
            max_cycles: None,
            max_runtime_seconds: None,
            token_budget_remaining: None,
            failure_streak: 0,
            last_error: None,
            metadata: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SliceCheckpoint {
    pub task_id: String,
    pub state: Value,
    pub task_state: Value,
    pub version: i64,
}

#[derive(Clone, Debug)]
pub struct SliceEvent {
    pub event_id: String,
    pub task_id: String,
    pub event_type: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
}

pub struct SliceRepo {
    pool: SqlitePool,
}

impl SliceRepo {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, task), fields(task_id = %task.task_id), err)]
    pub async fn upsert_task(&self, task: &SliceTask) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_task_tx(&mut tx, task).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_task_tx(tx: &mut SqliteTx<'_>, task: &SliceTask) -> Result<()> {
        let metadata = serde_json::to_string(&task.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO pdca_tasks
              (task_id, owner_id, conversation_key, session_id, status, priority,
               next_run_at, lease_until, worker_id, slice_cycles, max_cycles,
               max_runtime_seconds, token_budget_remaining, failure_streak,
               last_error, metadata_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT (task_id) DO UPDATE SET
              owner_id = excluded.owner_id,
              conversation_key = excluded.conversation_key,
              session_id = excluded.session_id,
              status = excluded.status,
              priority = excluded.priority,
              next_run_at = excluded.next_run_at,
              lease_until = excluded.lease_until,
              worker_id = excluded.worker_id,
              slice_cycles = excluded.slice_cycles,
              max_cycles = excluded.max_cycles,
              max_runtime_seconds = excluded.max_runtime_seconds,
              token_budget_remaining = excluded.token_budget_remaining,
              failure_streak = excluded.failure_streak,
              last_error = excluded.last_error,
              metadata_json = excluded.metadata_json,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.owner_id)
        .bind(&task.conversation_key)
        .bind(task.session_id.as_deref())
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.next_run_at.map(|dt| dt.to_rfc3339()))
        .bind(task.lease_until.map(|dt| dt.to_rfc3339()))
        .bind(task.worker_id.as_deref())
        .bind(task.slice_cycles)
        .bind(task.max_cycles)
        .bind(task.max_runtime_seconds)
        .bind(task.token_budget_remaining)
        .bind(task.failure_streak)
        .bind(task.last_error.as_deref())
        .bind(metadata)
        .bind(task.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<SliceTask>> {
        let row = sqlx::query(&format!("{SELECT_TASK} WHERE task_id = ?1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_task).transpose()
    }

    /// Runnable tasks in fair order: highest priority first, then earliest
    /// due, then least recently touched. Tasks under an unexpired lease are
    /// excluded.
    #[instrument(skip(self), err)]
    pub async fn list_runnable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SliceTask>> {
        let now_text = now.to_rfc3339();
        let rows = sqlx::query(&format!(
            r#"{SELECT_TASK}
            WHERE status IN ('queued', 'running')
              AND (next_run_at IS NULL OR next_run_at <= ?1)
              AND (lease_until IS NULL OR lease_until <= ?1)
            ORDER BY priority DESC, COALESCE(next_run_at, created_at) ASC,
                     updated_at ASC
            LIMIT ?2
            "#
        ))
        .bind(&now_text)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    /// Conditional lease acquisition. Succeeds only when the task is
    /// runnable and no unexpired lease exists; an expired lease is stolen.
    #[instrument(skip(self), err)]
    pub async fn acquire_lease(
        &self,
        task_id: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_text = now.to_rfc3339();
        let lease_until = (now + lease).to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE pdca_tasks
            SET lease_until = ?1, worker_id = ?2,
                status = CASE WHEN status = 'queued' THEN 'running' ELSE status END,
                updated_at = ?3
            WHERE task_id = ?4
              AND status IN ('queued', 'running')
              AND (lease_until IS NULL OR lease_until <= ?3)
            "#,
        )
        .bind(&lease_until)
        .bind(worker_id)
        .bind(&now_text)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn release_lease(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pdca_tasks
            SET lease_until = NULL, worker_id = NULL, updated_at = ?1
            WHERE task_id = ?2 AND worker_id = ?3
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(
        &self,
        task_id: &str,
        status: SliceStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pdca_tasks
            SET status = ?2, last_error = ?3, updated_at = ?4
            WHERE task_id = ?1
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(last_error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Compare-and-swap checkpoint write.
    ///
    /// `expected_version` of `Some(0)` means "no checkpoint yet" (insert
    /// version 1); `Some(v)` updates only if the stored version equals `v`;
    /// `None` skips the check (first writer wins on fresh tasks). Returns
    /// the new version, or `None` on a version conflict.
    #[instrument(skip(self, state, task_state), err)]
    pub async fn save_checkpoint(
        &self,
        task_id: &str,
        state: &Value,
        task_state: &Value,
        expected_version: Option<i64>,
    ) -> Result<Option<i64>> {
        let state_json = serde_json::to_string(state)?;
        let task_state_json = serde_json::to_string(task_state)?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        let new_version = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO pdca_checkpoints
                      (task_id, state_json, task_state_json, version, created_at, updated_at)
                    VALUES (?1, ?2, ?3, 1, ?4, ?4)
                    ON CONFLICT (task_id) DO UPDATE SET
                      state_json = excluded.state_json,
                      task_state_json = excluded.task_state_json,
                      version = pdca_checkpoints.version + 1,
                      updated_at = excluded.updated_at
                    "#,
                )
                .bind(task_id)
                .bind(&state_json)
                .bind(&task_state_json)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                sqlx::query_scalar::<_, i64>(
                    "SELECT version FROM pdca_checkpoints WHERE task_id = ?1",
                )
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
            }
            Some(0) => {
                let inserted = sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO pdca_checkpoints
                      (task_id, state_json, task_state_json, version, created_at, updated_at)
                    VALUES (?1, ?2, ?3, 1, ?4, ?4)
                    "#,
                )
                .bind(task_id)
                .bind(&state_json)
                .bind(&task_state_json)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                if inserted.rows_affected() > 0 {
                    Some(1)
                } else {
                    None
                }
            }
            Some(expected) => {
                let updated = sqlx::query(
                    r#"
                    UPDATE pdca_checkpoints
                    SET state_json = ?2, task_state_json = ?3,
                        version = version + 1, updated_at = ?4
                    WHERE task_id = ?1 AND version = ?5
                    "#,
                )
                .bind(task_id)
                .bind(&state_json)
                .bind(&task_state_json)
                .bind(&now)
                .bind(expected)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() > 0 {
                    Some(expected + 1)
                } else {
                    None
                }
            }
        };
        tx.commit().await?;
        Ok(new_version)
    }

    pub async fn load_checkpoint(&self, task_id: &str) -> Result<Option<SliceCheckpoint>> {
        let row = sqlx::query(
            r#"
            SELECT task_id, state_json, task_state_json, version
            FROM pdca_checkpoints
            WHERE task_id = ?1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let state: String = row.get("state_json");
                let task_state: String = row.get("task_state_json");
                Ok(Some(SliceCheckpoint {
                    task_id: row.get("task_id"),
                    state: serde_json::from_str(&state)?,
                    task_state: serde_json::from_str(&task_state)?,
                    version: row.get("version"),
                }))
            }
        }
    }

    pub async fn append_event(
        &self,
        task_id: &str,
        event_type: &str,
        payload: &Value,
        correlation_id: Option<&str>,
    ) -> Result<String> {
        let event_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO pdca_events
              (event_id, task_id, event_type, payload_json, correlation_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&event_id)
        .bind(task_id)
        .bind(event_type)
        .bind(serde_json::to_string(payload)?)
        .bind(correlation_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(event_id)
    }

    pub async fn list_events(&self, task_id: &str, limit: i64) -> Result<Vec<SliceEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, task_id, event_type, payload_json, correlation_id
            FROM pdca_events
            WHERE task_id = ?1
            ORDER BY created_at ASC, event_id ASC
            LIMIT ?2
            "#,
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let payload: Option<String> = row.get("payload_json");
                let payload = match payload {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => Value::Null,
                };
                Ok(SliceEvent {
                    event_id: row.get("event_id"),
                    task_id: row.get("task_id"),
                    event_type: row.get("event_type"),
                    payload,
                    correlation_id: row.get("correlation_id"),
                })
            })
            .collect()
    }

    pub async fn count_with_status(&self, status: SliceStatus) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM pdca_tasks WHERE status = ?1",
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

const SELECT_TASK: &str = r#"
    SELECT task_id, owner_id, conversation_key, session_id, status, priority,
           next_run_at, lease_until, worker_id, slice_cycles, max_cycles,
           max_runtime_seconds, token_budget_remaining, failure_streak,
           last_error, metadata_json, created_at, updated_at
    FROM pdca_tasks
"#;

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> Result<SliceTask> {
    let metadata: Option<String> = row.get("metadata_json");
    let metadata = match metadata {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Value::Object(Default::default()),
    };
    Ok(SliceTask {
        task_id: row.get("task_id"),
        owner_id: row.get("owner_id"),
        conversation_key: row.get("conversation_key"),
        session_id: row.get("session_id"),
        status: SliceStatus::parse(&row.get::<String, _>("status")),
        priority: row.get("priority"),
        next_run_at: row.get::<Option<String>, _>("next_run_at").map(parse_dt),
        lease_until: row.get::<Option<String>, _>("lease_until").map(parse_dt),
        worker_id: row.get("worker_id"),
        slice_cycles: row.get("slice_cycles"),
        max_cycles: row.get("max_cycles"),
        max_runtime_seconds: row.get("max_runtime_seconds"),
        token_budget_remaining: row.get("token_budget_remaining"),
        failure_streak: row.get("failure_streak"),
        last_error: row.get("last_error"),
        metadata,
        created_at: parse_dt(row.get("created_at")),
        updated_at: parse_dt(row.get("updated_at")),
    })
}

fn parse_dt(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
