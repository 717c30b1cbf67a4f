//! FSM runtime repository: the process-wide current-state marker and the
//! per-step trace.
//!
//! The marker is read-modify-written only inside the engine's transaction;
//! nothing else may touch it.

use chrono::Utc;
use sqlx::{Row, SqlitePool};

use super::{Result, SqliteTx};

/// One committed FSM step.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceRow {
    pub id: i64,
    pub correlation_id: Option<String>,
    pub state_before: String,
    pub signal_type: String,
    pub transition_id: Option<i64>,
    pub action_key: Option<String>,
    pub state_after: String,
    pub result: String,
    pub error_summary: Option<String>,
}

/// Trace payload written inside the engine transaction.
#[derive(Clone, Debug)]
pub struct TraceEntry {
    pub correlation_id: Option<String>,
    pub state_before: String,
    pub signal_type: String,
    pub transition_id: Option<i64>,
    pub action_key: Option<String>,
    pub state_after: String,
    pub result: String,
    pub error_summary: Option<String>,
}

pub struct FsmRuntimeRepo {
    pool: SqlitePool,
}

impl FsmRuntimeRepo {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Install the marker row if absent. Called once at boot with the
    /// configured initial state.
    pub async fn init_current_state(&self, state_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO fsm_runtime (id, current_state_id, updated_at)
            VALUES (1, ?1, ?2)
            "#,
        )
        .bind(state_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn current_state_id(&self) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT current_state_id FROM fsm_runtime WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Advance the marker. Only the engine calls this, inside its step
    /// transaction.
    pub async fn set_current_state_tx(tx: &mut SqliteTx<'_>, state_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE fsm_runtime SET current_state_id = ?1, updated_at = ?2 WHERE id = 1",
        )
        .bind(state_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn append_trace_tx(tx: &mut SqliteTx<'_>, entry: &TraceEntry) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO fsm_trace
              (correlation_id, state_before, signal_type, transition_id,
               action_key, state_after, result, error_summary, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(entry.correlation_id.as_deref())
        .bind(&entry.state_before)
        .bind(&entry.signal_type)
        .bind(entry.transition_id)
        .bind(entry.action_key.as_deref())
        .bind(&entry.state_after)
        .bind(&entry.result)
        .bind(entry.error_summary.as_deref())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn trace_for_correlation(&self, correlation_id: &str) -> Result<Vec<TraceRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, state_before, signal_type, transition_id,
                   action_key, state_after, result, error_summary
            FROM fsm_trace
            WHERE correlation_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_trace).collect())
    }

    pub async fn recent_trace(&self, limit: i64) -> Result<Vec<TraceRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, state_before, signal_type, transition_id,
                   action_key, state_after, result, error_summary
            FROM fsm_trace
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_trace).collect())
    }
}

fn row_to_trace(row: sqlx::sqlite::SqliteRow) -> TraceRow {
    TraceRow {
        id: row.get("id"),
        correlation_id: row.get("correlation_id"),
        state_before: row.get("state_before"),
        signal_type: row.get("signal_type"),
        transition_id: row.get("transition_id"),
        action_key: row.get("action_key"),
        state_after: row.get("state_after"),
        result: row.get("result"),
        error_summary: row.get("error_summary"),
    }
}
