//! Built-in plan executors.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::{ExecutorOutcome, PlanError, PlanExecutor};
use crate::runtime::RuntimeContext;
use crate::signal::{Audience, NormalizedOutboundMessage};
use crate::store::plans::PlanInstance;
use crate::store::slices::SliceTask;
use crate::store::timed::NewTimedSignal;

fn target_parts(payload: &Value) -> Option<(String, String)> {
    let target = payload.get("target")?;
    let channel_type = target.get("channel_type")?.as_str()?.to_string();
    let channel_target = target.get("channel_target")?.as_str()?.to_string();
    Some((channel_type, channel_target))
}

/// Turn a validated reminder plan into a timed row. The row id is the
/// payload's idempotency key, so re-running the plan (at-least-once
/// delivery, duplicate webhooks) cannot create duplicate reminders.
pub struct CreateReminderExecutor;

#[async_trait]
impl PlanExecutor for CreateReminderExecutor {
    fn key(&self) -> &str {
        "create_reminder"
    }

    async fn run(
        &self,
        plan: &PlanInstance,
        _ctx: &RuntimeContext,
    ) -> Result<ExecutorOutcome, PlanError> {
        let payload = &plan.payload;
        let (channel_type, channel_target) =
            target_parts(payload).ok_or_else(|| PlanError::Validation {
                message: "target is missing channel coordinates".to_string(),
            })?;
        let schedule = payload.get("schedule").cloned().unwrap_or(Value::Null);

        let trigger_at = resolve_trigger(&schedule)?;
        let rrule = schedule
            .get("rrule")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let timezone = schedule
            .get("timezone")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let id = payload
            .get("idempotency_key")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| plan.plan_id.clone());

        let timed = NewTimedSignal {
            id,
            trigger_at,
            rrule,
            timezone,
            signal_type: "reminder".to_string(),
            payload: payload.clone(),
            target: Some(channel_target),
            origin: Some(channel_type),
            correlation_id: plan.correlation_id.clone(),
        };

        let mut outcome = ExecutorOutcome::done();
        outcome.resolution = Some("reminder_scheduled".to_string());
        outcome.timed_signals.push(timed);
        Ok(outcome)
    }
}

fn resolve_trigger(schedule: &Value) -> Result<DateTime<Utc>, PlanError> {
    if let Some(seconds) = schedule.get("in_seconds").and_then(Value::as_i64) {
        return Ok(Utc::now() + Duration::seconds(seconds.max(1)));
    }
    if let Some(at) = schedule.get("trigger_at").and_then(Value::as_str) {
        return DateTime::parse_from_rfc3339(at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| PlanError::Validation {
                message: format!("trigger_at is not RFC3339: {err}"),
            });
    }
    if schedule.get("rrule").and_then(Value::as_str).is_some() {
        // Recurring with no anchor: the scheduler computes the first
        // occurrence from now.
        return Ok(Utc::now());
    }
    Err(PlanError::Validation {
        message: "schedule needs in_seconds, trigger_at, or rrule".to_string(),
    })
}

/// Immediate outbound delivery.
pub struct SendMessageExecutor;

#[async_trait]
impl PlanExecutor for SendMessageExecutor {
    fn key(&self) -> &str {
        "send_message"
    }

    async fn run(
        &self,
        plan: &PlanInstance,
        _ctx: &RuntimeContext,
    ) -> Result<ExecutorOutcome, PlanError> {
        let payload = &plan.payload;
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| PlanError::Validation {
                message: "message text is missing".to_string(),
            })?;
        let (channel_type, channel_target) =
            target_parts(payload).ok_or_else(|| PlanError::Validation {
                message: "target is missing channel coordinates".to_string(),
            })?;

        let mut outcome = ExecutorOutcome::done();
        outcome.resolution = Some("message_dispatched".to_string());
        outcome.outbound_messages.push(NormalizedOutboundMessage::new(
            message,
            channel_type,
            channel_target.clone(),
            Audience::user(channel_target),
            plan.correlation_id.clone().unwrap_or_else(|| plan.plan_id.clone()),
        ));
        Ok(outcome)
    }
}

/// Enqueue a cooperative slice task for the long-running work the plan
/// describes.
pub struct RunTaskExecutor;

#[async_trait]
impl PlanExecutor for RunTaskExecutor {
    fn key(&self) -> &str {
        "run_task"
    }

    async fn run(
        &self,
        plan: &PlanInstance,
        ctx: &RuntimeContext,
    ) -> Result<ExecutorOutcome, PlanError> {
        let payload = &plan.payload;
        let owner_id = payload
            .get("owner_id")
            .and_then(Value::as_str)
            .ok_or_else(|| PlanError::Validation {
                message: "owner_id is missing".to_string(),
            })?;
        let conversation_key = payload
            .get("conversation_key")
            .and_then(Value::as_str)
            .ok_or_else(|| PlanError::Validation {
                message: "conversation_key is missing".to_string(),
            })?;

        let mut task = SliceTask::queued(
            owner_id,
            conversation_key,
            payload
                .get("slice_cycles")
                .and_then(Value::as_i64)
                .unwrap_or(ctx.config.slice_default_cycles),
        );
        // Deterministic task id: re-running the plan re-upserts, it does not
        // fork a second task.
        task.task_id = plan.plan_id.clone();
        if let Some(priority) = payload.get("priority").and_then(Value::as_i64) {
            task.priority = priority;
        }
        task.max_runtime_seconds = Some(ctx.config.slice_max_runtime.as_secs() as i64);
        task.metadata = payload.clone();

        ctx.store.slices().upsert_task(&task).await?;
        ctx.store
            .slices()
            .append_event(
                &task.task_id,
                "task.enqueued",
                payload,
                plan.correlation_id.as_deref(),
            )
            .await?;

        let mut outcome = ExecutorOutcome::done();
        outcome.resolution = Some("task_enqueued".to_string());
        Ok(outcome)
    }
}
