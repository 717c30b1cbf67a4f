//! Plan registry and instance repository.
//!
//! The registry indexes `(plan_kind, plan_version)` to a JSON schema, an
//! executor key, and a deprecation flag. Instances move
//! `queued → running → done | failed | awaiting_user`; each execution
//! attempt gets a `plan_runs` row.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use super::{Result, SqliteTx};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlanStatus {
    #[default]
    Queued,
    Running,
    Done,
    Failed,
    AwaitingUser,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Queued => "queued",
            PlanStatus::Running => "running",
            PlanStatus::Done => "done",
            PlanStatus::Failed => "failed",
            PlanStatus::AwaitingUser => "awaiting_user",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => PlanStatus::Running,
            "done" => PlanStatus::Done,
            "failed" => PlanStatus::Failed,
            "awaiting_user" => PlanStatus::AwaitingUser,
            _ => PlanStatus::Queued,
        }
    }
}

/// One registry entry: the contract for a plan kind at a version.
#[derive(Clone, Debug)]
pub struct PlanKindVersion {
    pub plan_kind: String,
    pub plan_version: i64,
    pub schema: Value,
    pub example: Option<Value>,
    pub executor_key: String,
    pub is_deprecated: bool,
}

#[derive(Clone, Debug)]
pub struct PlanInstance {
    pub plan_id: String,
    pub plan_kind: String,
    pub plan_version: i64,
    pub correlation_id: Option<String>,
    pub status: PlanStatus,
    pub payload: Value,
    pub actor: Option<String>,
    pub source_channel: Option<String>,
    pub intent_confidence: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct PlanRunRow {
    pub run_id: String,
    pub plan_id: String,
    pub status: String,
    pub resolution: Option<String>,
}

pub struct PlanRepo {
    pool: SqlitePool,
}

impl PlanRepo {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_kind(&self, entry: &PlanKindVersion) -> Result<()> {
        let schema = serde_json::to_string(&entry.schema)?;
        let example = entry
            .example
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO plan_kind_versions
              (plan_kind, plan_version, schema_json, example_json, executor_key,
               is_deprecated, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (plan_kind, plan_version) DO UPDATE SET
              schema_json = excluded.schema_json,
              example_json = excluded.example_json,
              executor_key = excluded.executor_key,
              is_deprecated = excluded.is_deprecated
            "#,
        )
        .bind(&entry.plan_kind)
        .bind(entry.plan_version)
        .bind(schema)
        .bind(example)
        .bind(&entry.executor_key)
        .bind(entry.is_deprecated as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_kind(&self, plan_kind: &str, plan_version: i64) -> Result<Option<PlanKindVersion>> {
        let row = sqlx::query(
            r#"
            SELECT plan_kind, plan_version, schema_json, example_json,
                   executor_key, is_deprecated
            FROM plan_kind_versions
            WHERE plan_kind = ?1 AND plan_version = ?2
            "#,
        )
        .bind(plan_kind)
        .bind(plan_version)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let schema: String = row.get("schema_json");
                let example: Option<String> = row.get("example_json");
                Ok(Some(PlanKindVersion {
                    plan_kind: row.get("plan_kind"),
                    plan_version: row.get("plan_version"),
                    schema: serde_json::from_str(&schema)?,
                    example: example.map(|raw| serde_json::from_str(&raw)).transpose()?,
                    executor_key: row.get("executor_key"),
                    is_deprecated: row.get::<i64, _>("is_deprecated") != 0,
                }))
            }
        }
    }

    /// Idempotent insert on plan id.
    #[instrument(skip(self, instance), fields(plan_id = %instance.plan_id), err)]
    pub async fn insert_instance(&self, instance: &PlanInstance) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let created = Self::insert_instance_tx(&mut tx, instance).await?;
        tx.commit().await?;
        Ok(created)
    }

    pub async fn insert_instance_tx(
        tx: &mut SqliteTx<'_>,
        instance: &PlanInstance,
    ) -> Result<bool> {
        let payload = serde_json::to_string(&instance.payload)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO plan_instances
              (plan_id, plan_kind, plan_version, correlation_id, status, payload,
               actor, source_channel, intent_confidence, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            "#,
        )
        .bind(&instance.plan_id)
        .bind(&instance.plan_kind)
        .bind(instance.plan_version)
        .bind(instance.correlation_id.as_deref())
        .bind(instance.status.as_str())
        .bind(payload)
        .bind(instance.actor.as_deref())
        .bind(instance.source_channel.as_deref())
        .bind(instance.intent_confidence)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically move up to `max_n` queued plans to `running` and return
    /// them, oldest first.
    #[instrument(skip(self), err)]
    pub async fn claim_queued(&self, max_n: i64) -> Result<Vec<PlanInstance>> {
        let rows = sqlx::query(
            r#"
            UPDATE plan_instances
            SET status = 'running', updated_at = ?1
            WHERE plan_id IN (
                SELECT plan_id FROM plan_instances
                WHERE status = 'queued'
                ORDER BY created_at ASC
                LIMIT ?2
            )
            RETURNING plan_id, plan_kind, plan_version, correlation_id, status,
                      payload, actor, source_channel, intent_confidence, error,
                      created_at
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(max_n)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_instance).collect()
    }

    pub async fn set_status(
        &self,
        plan_id: &str,
        status: PlanStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE plan_instances
            SET status = ?2, error = ?3, updated_at = ?4
            WHERE plan_id = ?1
            "#,
        )
        .bind(plan_id)
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_instance(&self, plan_id: &str) -> Result<Option<PlanInstance>> {
        let row = sqlx::query(
            r#"
            SELECT plan_id, plan_kind, plan_version, correlation_id, status,
                   payload, actor, source_channel, intent_confidence, error,
                   created_at
            FROM plan_instances
            WHERE plan_id = ?1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_instance).transpose()
    }

    pub async fn count_with_status(&self, status: PlanStatus) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM plan_instances WHERE status = ?1",
        )
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Open a run row for one execution attempt.
    pub async fn start_run(&self, plan_id: &str) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO plan_runs (run_id, plan_id, status, started_at)
            VALUES (?1, ?2, 'running', ?3)
            "#,
        )
        .bind(&run_id)
        .bind(plan_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    pub async fn finish_run(
        &self,
        run_id: &str,
        status: &str,
        resolution: Option<&str>,
        state_json: Option<&Value>,
        scheduled_json: Option<&Value>,
    ) -> Result<()> {
        let state = state_json.map(serde_json::to_string).transpose()?;
        let scheduled = scheduled_json.map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            UPDATE plan_runs
            SET status = ?2, resolution = ?3, state_json = ?4,
                scheduled_json = ?5, ended_at = ?6
            WHERE run_id = ?1
            "#,
        )
        .bind(run_id)
        .bind(status)
        .bind(resolution)
        .bind(state)
        .bind(scheduled)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn runs_for_plan(&self, plan_id: &str) -> Result<Vec<PlanRunRow>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, plan_id, status, resolution
            FROM plan_runs
            WHERE plan_id = ?1
            ORDER BY started_at ASC
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PlanRunRow {
                run_id: row.get("run_id"),
                plan_id: row.get("plan_id"),
                status: row.get("status"),
                resolution: row.get("resolution"),
            })
            .collect())
    }
}

fn row_to_instance(row: sqlx::sqlite::SqliteRow) -> Result<PlanInstance> {
    let payload: String = row.get("payload");
    let created_at: String = row.get("created_at");
    Ok(PlanInstance {
        plan_id: row.get("plan_id"),
        plan_kind: row.get("plan_kind"),
        plan_version: row.get("plan_version"),
        correlation_id: row.get("correlation_id"),
        status: PlanStatus::parse(&row.get::<String, _>("status")),
        payload: serde_json::from_str(&payload)?,
        actor: row.get("actor"),
        source_channel: row.get("source_channel"),
        intent_confidence: row.get("intent_confidence"),
        error: row.get("error"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
