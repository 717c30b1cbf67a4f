/*!
Action and guard registries.

The catalog references handlers by key; the registries map those keys to
code. Actions are pure with respect to the kernel: they read the runtime
facade, then *declare* every effect (signals to emit, outbound messages,
plans, timed signals, slice tasks) in the returned [`ActionResult`]. The
engine's transaction applies the effects, so an action that throws leaves no
partial writes behind.
*/

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::runtime::RuntimeContext;
use crate::signal::{NormalizedOutboundMessage, Signal};
use crate::store::plans::PlanInstance;
use crate::store::slices::SliceTask;
use crate::store::timed::NewTimedSignal;

mod admin;
mod failure;
mod incoming;
mod timer;

pub use admin::{HandleStatus, HandleTimedSignals};
pub use failure::HandleActionFailure;
pub use incoming::{parse_reminder, HandleIncomingMessage, ReminderSchedule};
pub use timer::HandleTimerFired;

/// Handler keys referenced by the default catalog.
pub mod keys {
    pub const SHUTDOWN: &str = "shutdown";
    pub const HANDLE_INCOMING_MESSAGE: &str = "handle_incoming_message";
    pub const HANDLE_TIMER_FIRED: &str = "handle_timer_fired";
    pub const HANDLE_ACTION_FAILURE: &str = "handle_action_failure";
    pub const HANDLE_STATUS: &str = "handle_status";
    pub const HANDLE_TIMED_SIGNALS: &str = "handle_timed_signals";
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResultCode {
    #[default]
    Succeeded,
    Failed,
    WaitingUser,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Succeeded => "succeeded",
            ResultCode::Failed => "failed",
            ResultCode::WaitingUser => "waiting_user",
        }
    }
}

/// Everything a handler wants done, declared rather than performed.
#[derive(Debug, Default)]
pub struct ActionResult {
    pub next_signals: Vec<Signal>,
    pub outbound_messages: Vec<NormalizedOutboundMessage>,
    pub plans: Vec<PlanInstance>,
    pub timed_signals: Vec<NewTimedSignal>,
    pub slice_requests: Vec<SliceTask>,
    pub result_code: ResultCode,
    pub error_summary: Option<String>,
}

impl ActionResult {
    #[must_use]
    pub fn succeeded() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_outbound(mut self, message: NormalizedOutboundMessage) -> Self {
        self.outbound_messages.push(message);
        self
    }

    #[must_use]
    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.next_signals.push(signal);
        self
    }

    #[must_use]
    pub fn with_plan(mut self, plan: PlanInstance) -> Self {
        self.plans.push(plan);
        self
    }

    #[must_use]
    pub fn with_timed_signal(mut self, timed: NewTimedSignal) -> Self {
        self.timed_signals.push(timed);
        self
    }

    #[must_use]
    pub fn with_slice_request(mut self, task: SliceTask) -> Self {
        self.slice_requests.push(task);
        self
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ActionError {
    #[error("handler failed: {message}")]
    #[diagnostic(code(nervecore::actions::handler))]
    Handler { message: String, retryable: bool },

    #[error("permission denied: {message}")]
    #[diagnostic(code(nervecore::actions::permission_denied))]
    PermissionDenied { message: String },
}

impl ActionError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            retryable: false,
        }
    }
}

#[async_trait]
pub trait Action: Send + Sync {
    fn key(&self) -> &str;
    async fn execute(
        &self,
        signal: &Signal,
        ctx: &RuntimeContext,
    ) -> Result<ActionResult, ActionError>;
}

/// Pure predicate over `(signal, runtime)`.
pub type GuardFn = Arc<dyn Fn(&Signal, &RuntimeContext) -> bool + Send + Sync>;

#[derive(Default)]
pub struct GuardRegistry {
    guards: FxHashMap<String, GuardFn>,
}

impl GuardRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        key: impl Into<String>,
        guard: impl Fn(&Signal, &RuntimeContext) -> bool + Send + Sync + 'static,
    ) {
        self.guards.insert(key.into(), Arc::new(guard));
    }

    pub fn get(&self, key: &str) -> Option<GuardFn> {
        self.guards.get(key).cloned()
    }

    pub fn known_keys(&self) -> FxHashSet<String> {
        self.guards.keys().cloned().collect()
    }
}

#[derive(Default)]
pub struct ActionRegistry {
    actions: FxHashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.key().to_string(), action);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(key).cloned()
    }

    pub fn known_keys(&self) -> FxHashSet<String> {
        self.actions.keys().cloned().collect()
    }
}

/// Shutdown acknowledges and carries no effects: the engine sees the
/// terminal target state and the heart tears the process down.
pub struct ShutdownAction;

#[async_trait]
impl Action for ShutdownAction {
    fn key(&self) -> &str {
        keys::SHUTDOWN
    }

    async fn execute(
        &self,
        signal: &Signal,
        _ctx: &RuntimeContext,
    ) -> Result<ActionResult, ActionError> {
        tracing::info!(correlation_id = %signal.correlation_id, "shutdown requested");
        Ok(ActionResult::succeeded())
    }
}

/// Registries with every handler the default catalog references.
#[must_use]
pub fn default_registries() -> (ActionRegistry, GuardRegistry) {
    let mut actions = ActionRegistry::new();
    actions.register(Arc::new(ShutdownAction));
    actions.register(Arc::new(HandleIncomingMessage));
    actions.register(Arc::new(HandleTimerFired));
    actions.register(Arc::new(HandleActionFailure));
    actions.register(Arc::new(HandleStatus));
    actions.register(Arc::new(HandleTimedSignals));
    (actions, GuardRegistry::new())
}
