//! Handler-failure fallout.
//!
//! The engine emits a synthetic `action.failed` when a guard or action
//! throws; the default catalog routes it here (and into the error state).
//! The user sees a calm internal-pause message, never the underlying error.

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use super::incoming::payload_str;
use super::{keys, Action, ActionError, ActionResult};
use crate::runtime::{response_keys, RuntimeContext};
use crate::signal::{Audience, NormalizedOutboundMessage, Signal};

pub struct HandleActionFailure;

#[async_trait]
impl Action for HandleActionFailure {
    fn key(&self) -> &str {
        keys::HANDLE_ACTION_FAILURE
    }

    async fn execute(
        &self,
        signal: &Signal,
        ctx: &RuntimeContext,
    ) -> Result<ActionResult, ActionError> {
        let failed_action = payload_str(&signal.payload, "action_key").unwrap_or_default();
        let error = payload_str(&signal.payload, "error_summary").unwrap_or_default();
        tracing::warn!(
            failed_action = %failed_action,
            error = %error,
            correlation_id = %signal.correlation_id,
            "action failure routed to error state"
        );

        // Only reply when the failed signal identified a conversation.
        let mut result = ActionResult::succeeded();
        if let (Some(channel_type), Some(channel_target)) = (
            payload_str(&signal.payload, "channel_type"),
            payload_str(&signal.payload, "channel_target"),
        ) {
            let text = ctx
                .renderer
                .render(response_keys::INTERNAL_PAUSE, &FxHashMap::default());
            result = result.with_outbound(NormalizedOutboundMessage::new(
                text,
                channel_type,
                channel_target.clone(),
                Audience::user(channel_target),
                signal.correlation_id.clone(),
            ));
        }
        Ok(result)
    }
}
