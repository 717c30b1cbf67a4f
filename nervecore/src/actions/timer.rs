//! Timed dispatch handling.
//!
//! Consumes `timed_signal.fired` and turns the carried payload into its
//! user-visible effect. Dispatch is at-least-once; the reminder payload's
//! idempotency key keeps duplicates harmless downstream.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;

use super::incoming::payload_str;
use super::{keys, Action, ActionError, ActionResult};
use crate::runtime::{response_keys, RuntimeContext};
use crate::signal::{Audience, NormalizedOutboundMessage, Signal};

pub struct HandleTimerFired;

#[async_trait]
impl Action for HandleTimerFired {
    fn key(&self) -> &str {
        keys::HANDLE_TIMER_FIRED
    }

    async fn execute(
        &self,
        signal: &Signal,
        ctx: &RuntimeContext,
    ) -> Result<ActionResult, ActionError> {
        let signal_type = payload_str(&signal.payload, "signal_type").unwrap_or_default();
        let inner = signal.payload.get("payload").cloned().unwrap_or(Value::Null);
        let target = payload_str(&signal.payload, "target")
            .or_else(|| payload_str(&inner, "channel_target"));
        let origin = payload_str(&signal.payload, "origin")
            .or_else(|| {
                inner
                    .get("target")
                    .and_then(|t| t.get("channel_type"))
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| "cli".to_string());

        tracing::info!(
            timed_signal_id = payload_str(&signal.payload, "timed_signal_id").as_deref(),
            signal_type = %signal_type,
            correlation_id = %signal.correlation_id,
            "timed signal fired"
        );

        let Some(target) = target.or_else(|| {
            inner
                .get("target")
                .and_then(|t| t.get("channel_target"))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        }) else {
            tracing::warn!(correlation_id = %signal.correlation_id, "timed dispatch missing target");
            return Ok(ActionResult::succeeded());
        };

        let summary = payload_str(&inner, "summary")
            .or_else(|| payload_str(&inner, "message"))
            .unwrap_or_else(|| "you had something planned".to_string());

        let mut vars = FxHashMap::default();
        vars.insert("summary".to_string(), Value::String(summary));
        let text = ctx.renderer.render(response_keys::REMINDER_FIRE, &vars);

        Ok(ActionResult::succeeded().with_outbound(NormalizedOutboundMessage::new(
            text,
            origin,
            target.clone(),
            Audience::user(target),
            signal.correlation_id.clone(),
        )))
    }
}
