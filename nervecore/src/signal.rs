use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A typed event consumed by the FSM.
///
/// Signals are the only thing that flows over the bus. They are cheap to
/// clone, serializable, and carry an opaque JSON payload the engine never
/// interprets; only actions do.
///
/// # Examples
///
/// ```
/// use nervecore::signal::Signal;
/// use serde_json::json;
///
/// let signal = Signal::new("cli.message_received", "cli", json!({"text": "hello"}));
/// // The correlation id defaults to the signal's own id.
/// assert_eq!(signal.correlation_id, signal.id);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    /// Unique signal id. Durable enqueue is idempotent on this value.
    pub id: String,
    /// Dotted signal type key, e.g. `cli.message_received`.
    pub signal_type: String,
    /// Key of the sense (or internal producer) that emitted this signal.
    pub source: String,
    /// Opaque structured payload. The engine never branches on it.
    pub payload: Value,
    /// Identifier threaded through every causally related event.
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    /// Durable signals are persisted to the signal queue before delivery.
    pub durable: bool,
}

impl Signal {
    #[must_use]
    pub fn new(
        signal_type: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            correlation_id: id.clone(),
            id,
            signal_type: signal_type.into(),
            source: source.into(),
            payload,
            created_at: Utc::now(),
            durable: false,
        }
    }

    /// Mark the signal durable: it survives restarts via the signal queue.
    #[must_use]
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Override the correlation id, threading an existing causal chain.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        if !correlation_id.is_empty() {
            self.correlation_id = correlation_id;
        }
        self
    }

    /// Override the generated id. Used by senses that dedupe on a
    /// provider-supplied identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if self.correlation_id == self.id {
            self.correlation_id = id.clone();
        }
        self.id = id;
        self
    }
}

/// Terminal disposition of a consumed signal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Queued => "queued",
            SignalStatus::Processing => "processing",
            SignalStatus::Done => "done",
            SignalStatus::Failed => "failed",
        }
    }
}

/// Canonical inbound message produced by senses.
///
/// Unknown channel-specific fields live in `metadata`; the core never
/// branches on metadata.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizedInboundMessage {
    pub text: String,
    pub channel_type: String,
    pub channel_target: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

/// Who an outbound message is addressed to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Audience {
    pub kind: String,
    pub id: String,
}

impl Audience {
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: "user".into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn channel(id: impl Into<String>) -> Self {
        Self {
            kind: "channel".into(),
            id: id.into(),
        }
    }
}

/// Canonical outbound message handed to extremities.
///
/// `metadata` carries hints only (tone, locale, urgency); extremities own
/// channel-specific formatting and must not consult core state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NormalizedOutboundMessage {
    pub message: String,
    pub channel_type: String,
    pub channel_target: String,
    pub audience: Audience,
    pub correlation_id: String,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl NormalizedOutboundMessage {
    #[must_use]
    pub fn new(
        message: impl Into<String>,
        channel_type: impl Into<String>,
        channel_target: impl Into<String>,
        audience: Audience,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            channel_type: channel_type.into(),
            channel_target: channel_target.into(),
            audience,
            correlation_id: correlation_id.into(),
            metadata: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_metadata_pair(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Signal types the kernel itself understands. Senses may extend this set
/// through the catalog; these are the ones wired by default.
pub mod types {
    pub const TELEGRAM_MESSAGE_RECEIVED: &str = "telegram.message_received";
    pub const CLI_MESSAGE_RECEIVED: &str = "cli.message_received";
    pub const API_MESSAGE_RECEIVED: &str = "api.message_received";
    pub const API_STATUS_REQUESTED: &str = "api.status_requested";
    pub const API_TIMED_SIGNALS_REQUESTED: &str = "api.timed_signals_requested";
    pub const TIMER_FIRED: &str = "timer.fired";
    pub const TIMED_SIGNAL_FIRED: &str = "timed_signal.fired";
    pub const TERMINAL_COMMAND_UPDATED: &str = "terminal.command_updated";
    pub const TERMINAL_COMMAND_EXECUTED: &str = "terminal.command_executed";
    pub const TELEGRAM_INVITE_REQUESTED: &str = "telegram.invite_requested";
    pub const ACTION_SUCCEEDED: &str = "action.succeeded";
    pub const ACTION_FAILED: &str = "action.failed";
    pub const SHUTDOWN_REQUESTED: &str = "shutdown_requested";
    pub const PLAN_RUN: &str = "plan.run";
    pub const PDCA_SLICE_REQUESTED: &str = "pdca.slice_requested";
    pub const PDCA_RESUME_REQUESTED: &str = "pdca.resume_requested";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn correlation_id_defaults_to_signal_id() {
        let signal = Signal::new("timer.fired", "clock", json!({}));
        assert_eq!(signal.correlation_id, signal.id);
    }

    #[test]
    fn with_id_keeps_explicit_correlation() {
        let signal = Signal::new("cli.message_received", "cli", json!({}))
            .with_correlation_id("C1")
            .with_id("provider-42");
        assert_eq!(signal.id, "provider-42");
        assert_eq!(signal.correlation_id, "C1");
    }

    #[test]
    fn signal_serde_round_trip() {
        let signal = Signal::new("api.message_received", "api", json!({"text": "hi"})).durable();
        let encoded = serde_json::to_string(&signal).unwrap();
        let decoded: Signal = serde_json::from_str(&encoded).unwrap();
        assert_eq!(signal, decoded);
    }
}
