//! Administrative request handlers: status summaries and timed-signal
//! listings, answered synchronously over the originating channel.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use super::incoming::payload_str;
use super::{keys, Action, ActionError, ActionResult};
use crate::runtime::{response_keys, RuntimeContext};
use crate::signal::{Audience, NormalizedOutboundMessage, Signal};
use crate::signal::SignalStatus;
use crate::store::timed::TimedStatus;

fn reply_route(signal: &Signal) -> (String, String) {
    let channel_type = payload_str(&signal.payload, "channel_type")
        .or_else(|| payload_str(&signal.payload, "channel"))
        .unwrap_or_else(|| "api".to_string());
    let channel_target = payload_str(&signal.payload, "channel_target")
        .or_else(|| payload_str(&signal.payload, "target"))
        .unwrap_or_else(|| "local".to_string());
    (channel_type, channel_target)
}

/// Snapshot of queue depths and the current state.
pub struct HandleStatus;

#[async_trait]
impl Action for HandleStatus {
    fn key(&self) -> &str {
        keys::HANDLE_STATUS
    }

    async fn execute(
        &self,
        signal: &Signal,
        ctx: &RuntimeContext,
    ) -> Result<ActionResult, ActionError> {
        let queued = ctx
            .store
            .signal_queue()
            .count_with_status(SignalStatus::Queued)
            .await
            .map_err(|e| ActionError::handler(e.to_string()))?;
        let timers = ctx
            .store
            .timed()
            .count_with_status(TimedStatus::Pending)
            .await
            .map_err(|e| ActionError::handler(e.to_string()))?;
        let state_key = current_state_key(ctx).await?;

        let mut vars = FxHashMap::default();
        vars.insert("state".to_string(), Value::String(state_key));
        vars.insert("queued".to_string(), json!(queued));
        vars.insert("timers".to_string(), json!(timers));
        let text = ctx.renderer.render(response_keys::STATUS_SUMMARY, &vars);

        let (channel_type, channel_target) = reply_route(signal);
        Ok(ActionResult::succeeded().with_outbound(NormalizedOutboundMessage::new(
            text,
            channel_type,
            channel_target.clone(),
            Audience::user(channel_target),
            signal.correlation_id.clone(),
        )))
    }
}

async fn current_state_key(ctx: &RuntimeContext) -> Result<String, ActionError> {
    let state_id = ctx
        .store
        .fsm()
        .current_state_id()
        .await
        .map_err(|e| ActionError::handler(e.to_string()))?;
    let Some(state_id) = state_id else {
        return Ok("unknown".to_string());
    };
    let catalog = ctx
        .store
        .catalog()
        .load()
        .await
        .map_err(|e| ActionError::handler(e.to_string()))?;
    Ok(catalog
        .state(state_id)
        .map(|s| s.key.clone())
        .unwrap_or_else(|| "unknown".to_string()))
}

/// Pending timed signals, newest horizon first capped at a page.
pub struct HandleTimedSignals;

#[async_trait]
impl Action for HandleTimedSignals {
    fn key(&self) -> &str {
        keys::HANDLE_TIMED_SIGNALS
    }

    async fn execute(
        &self,
        signal: &Signal,
        ctx: &RuntimeContext,
    ) -> Result<ActionResult, ActionError> {
        let pending = ctx
            .store
            .timed()
            .list_pending(50)
            .await
            .map_err(|e| ActionError::handler(e.to_string()))?;

        let listing: Vec<Value> = pending
            .iter()
            .map(|row| {
                json!({
                    "id": row.id,
                    "due_at": row.due_at().to_rfc3339(),
                    "signal_type": row.signal_type,
                    "recurring": row.rrule.is_some(),
                    "target": row.target,
                })
            })
            .collect();

        let (channel_type, channel_target) = reply_route(signal);
        let message = serde_json::to_string(&json!({ "timed_signals": listing }))
            .map_err(|e| ActionError::handler(e.to_string()))?;
        Ok(ActionResult::succeeded().with_outbound(
            NormalizedOutboundMessage::new(
                message,
                channel_type,
                channel_target.clone(),
                Audience::user(channel_target),
                signal.correlation_id.clone(),
            )
            .with_metadata_pair("content_type".to_string(), json!("application/json")),
        ))
    }
}
