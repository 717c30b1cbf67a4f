//! Inbound user message handling.
//!
//! Deterministic intent parsing for reminder phrasing. Anything the parser
//! does not recognize gets a clarify response, never a guess.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{keys, Action, ActionError, ActionResult};
use crate::plans::kinds;
use crate::runtime::{response_keys, RuntimeContext};
use crate::signal::{types, Audience, NormalizedOutboundMessage, Signal};
use crate::store::plans::{PlanInstance, PlanStatus};
use crate::store::timed::NewTimedSignal;

/// When a recognized reminder should fire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReminderSchedule {
    /// One-shot, relative to now.
    In(Duration),
    /// Recurring, every day at the given local time.
    DailyAt { hour: u32, minute: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReminderIntent {
    pub summary: String,
    pub schedule: ReminderSchedule,
}

/// Parse reminder phrasing: `remind me to <task> in <n> <unit>` and
/// `remind me to <task> every day at <h[:mm]>`. Returns `None` for anything
/// else.
pub fn parse_reminder(text: &str) -> Option<ReminderIntent> {
    let lowered = text.trim().to_lowercase();
    let rest = lowered.strip_prefix("remind me to ")?;

    if let Some(idx) = rest.rfind(" every day at ") {
        let summary = rest[..idx].trim();
        let time = rest[idx + " every day at ".len()..].trim();
        let (hour, minute) = parse_clock(time)?;
        if summary.is_empty() {
            return None;
        }
        return Some(ReminderIntent {
            summary: summary.to_string(),
            schedule: ReminderSchedule::DailyAt { hour, minute },
        });
    }

    if let Some(idx) = rest.rfind(" in ") {
        let summary = rest[..idx].trim();
        let spec = rest[idx + 4..].trim();
        let duration = parse_duration(spec)?;
        if summary.is_empty() {
            return None;
        }
        return Some(ReminderIntent {
            summary: summary.to_string(),
            schedule: ReminderSchedule::In(duration),
        });
    }

    None
}

fn parse_duration(spec: &str) -> Option<Duration> {
    let mut parts = spec.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    if amount < 1 {
        return None;
    }
    let unit = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    match unit {
        "second" | "seconds" | "sec" | "secs" => Some(Duration::seconds(amount)),
        "minute" | "minutes" | "min" | "mins" => Some(Duration::minutes(amount)),
        "hour" | "hours" | "hr" | "hrs" => Some(Duration::hours(amount)),
        "day" | "days" => Some(Duration::days(amount)),
        _ => None,
    }
}

fn parse_clock(spec: &str) -> Option<(u32, u32)> {
    let (hour_text, minute_text) = match spec.split_once(':') {
        Some((h, m)) => (h, m),
        None => (spec, "0"),
    };
    let hour: u32 = hour_text.trim().parse().ok()?;
    let minute: u32 = minute_text.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Route a normalized inbound message.
pub struct HandleIncomingMessage;

#[async_trait]
impl Action for HandleIncomingMessage {
    fn key(&self) -> &str {
        keys::HANDLE_INCOMING_MESSAGE
    }

    async fn execute(
        &self,
        signal: &Signal,
        ctx: &RuntimeContext,
    ) -> Result<ActionResult, ActionError> {
        let text = payload_str(&signal.payload, "text").unwrap_or_default();
        let channel_type = payload_str(&signal.payload, "channel_type")
            .or_else(|| payload_str(&signal.payload, "channel"))
            .unwrap_or_else(|| "api".to_string());
        let channel_target = payload_str(&signal.payload, "channel_target")
            .or_else(|| payload_str(&signal.payload, "target"))
            .unwrap_or_else(|| "local".to_string());
        let user_id = payload_str(&signal.payload, "user_id")
            .unwrap_or_else(|| channel_target.clone());

        let Some(intent) = parse_reminder(&text) else {
            let reply = ctx
                .renderer
                .render(response_keys::CLARIFY_INTENT, &FxHashMap::default());
            return Ok(ActionResult::succeeded().with_outbound(
                NormalizedOutboundMessage::new(
                    reply,
                    channel_type,
                    channel_target,
                    Audience::user(user_id),
                    signal.correlation_id.clone(),
                ),
            ));
        };

        let plan_id = Uuid::new_v4().to_string();
        let schedule = match &intent.schedule {
            ReminderSchedule::In(duration) => json!({
                "in_seconds": duration.num_seconds(),
            }),
            ReminderSchedule::DailyAt { hour, minute } => json!({
                "rrule": format!("FREQ=DAILY;BYHOUR={hour};BYMINUTE={minute}"),
            }),
        };
        let plan_payload = json!({
            "kind": kinds::CREATE_REMINDER,
            "summary": intent.summary,
            "schedule": schedule,
            "target": {
                "channel_type": channel_type,
                "channel_target": channel_target,
            },
            "idempotency_key": plan_id,
        });

        let plan = PlanInstance {
            plan_id: plan_id.clone(),
            plan_kind: kinds::CREATE_REMINDER.to_string(),
            plan_version: 1,
            correlation_id: Some(signal.correlation_id.clone()),
            status: PlanStatus::Queued,
            payload: plan_payload.clone(),
            actor: Some(user_id.clone()),
            source_channel: Some(channel_type.clone()),
            intent_confidence: Some(1.0),
            error: None,
            created_at: Utc::now(),
        };

        // The timed row is written inside the FSM transaction so the
        // reminder exists the moment the acknowledgement goes out. The plan
        // executor's own insert is idempotent on the same id.
        let timed = match &intent.schedule {
            ReminderSchedule::In(duration) => NewTimedSignal {
                id: plan_id.clone(),
                trigger_at: Utc::now() + *duration,
                rrule: None,
                timezone: None,
                signal_type: "reminder".to_string(),
                payload: plan_payload.clone(),
                target: Some(channel_target.clone()),
                origin: Some(channel_type.clone()),
                correlation_id: Some(signal.correlation_id.clone()),
            },
            ReminderSchedule::DailyAt { hour, minute } => NewTimedSignal {
                id: plan_id.clone(),
                trigger_at: Utc::now(),
                rrule: Some(format!("FREQ=DAILY;BYHOUR={hour};BYMINUTE={minute}")),
                timezone: None,
                signal_type: "reminder".to_string(),
                payload: plan_payload.clone(),
                target: Some(channel_target.clone()),
                origin: Some(channel_type.clone()),
                correlation_id: Some(signal.correlation_id.clone()),
            },
        };

        let mut vars = FxHashMap::default();
        vars.insert("summary".to_string(), Value::String(intent.summary.clone()));
        let ack = ctx.renderer.render(response_keys::REMINDER_ACK, &vars);

        let nudge = Signal::new(types::PLAN_RUN, "fsm", json!({"plan_id": plan_id}))
            .with_correlation_id(signal.correlation_id.clone());

        Ok(ActionResult::succeeded()
            .with_plan(plan)
            .with_timed_signal(timed)
            .with_outbound(NormalizedOutboundMessage::new(
                ack,
                channel_type,
                channel_target,
                Audience::user(user_id),
                signal.correlation_id.clone(),
            ))
            .with_signal(nudge))
    }
}

pub(crate) fn payload_str(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}
