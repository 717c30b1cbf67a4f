/*!
FSM engine.

The single cooperative consumer of the bus. For each signal it resolves a
transition from the catalog, evaluates the guard, runs the action under a
per-signal deadline, and commits one transaction covering the state marker,
the `fsm_trace` row, every declared side effect, and the consumed signal's
completion. Outbound messages publish after the commit.

A guard or action failure never advances the state: the signal is marked
failed, a synthetic `action.failed` signal is emitted, and the default
catalog routes it into the error state.
*/

use std::sync::Arc;
use std::time::Duration as StdDuration;

use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

use crate::actions::{ActionRegistry, ActionResult, GuardRegistry};
use crate::bus::{BusConsumer, SignalBus};
use crate::catalog::{Catalog, CatalogError, StateDef, TransitionDef};
use crate::extremities::DeliveryHub;
use crate::observability::{TraceLevel, TraceSink};
use crate::runtime::RuntimeContext;
use crate::signal::{types, Signal};
use crate::store::fsm::{FsmRuntimeRepo, TraceEntry};
use crate::store::signal_queue::SignalQueueRepo;
use crate::store::slices::SliceRepo;
use crate::store::timed::TimedRepo;
use crate::store::plans::PlanRepo;
use crate::store::StoreError;

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Catalog(#[from] CatalogError),

    #[error("current state {state_id} is not in the catalog")]
    #[diagnostic(
        code(nervecore::engine::state_missing),
        help("The state marker references a row the catalog no longer has.")
    )]
    StateMissing { state_id: i64 },
}

/// Why the consume loop returned.
#[derive(Debug, PartialEq, Eq)]
pub enum EngineExit {
    /// The FSM entered a terminal state; signal consumption halts.
    TerminalState,
    /// The bus closed and drained.
    BusClosed,
}

/// What one consumed signal did.
#[derive(Debug)]
pub struct StepOutcome {
    pub result: StepResult,
    pub state_after: i64,
    pub terminal: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StepResult {
    Transitioned,
    NoTransition,
    ActionFailed,
}

pub struct FsmEngine {
    ctx: RuntimeContext,
    catalog: Catalog,
    actions: ActionRegistry,
    guards: GuardRegistry,
    bus: Arc<SignalBus>,
    hub: Arc<DeliveryHub>,
    trace: Arc<TraceSink>,
    deadline: StdDuration,
    current_state_id: i64,
}

impl FsmEngine {
    /// Build the engine: validate the catalog against the registries and
    /// install the state marker at the configured initial state.
    pub async fn new(
        ctx: RuntimeContext,
        catalog: Catalog,
        actions: ActionRegistry,
        guards: GuardRegistry,
        bus: Arc<SignalBus>,
        hub: Arc<DeliveryHub>,
        trace: Arc<TraceSink>,
    ) -> Result<Self, EngineError> {
        if catalog.is_empty() {
            return Err(CatalogError::Empty.into());
        }
        catalog.validate_handlers(&guards.known_keys(), &actions.known_keys())?;

        let initial = catalog
            .state_by_key(&ctx.config.fsm_initial_state)
            .ok_or_else(|| CatalogError::UnknownInitialState {
                key: ctx.config.fsm_initial_state.clone(),
            })?
            .id;
        let fsm = ctx.store.fsm();
        fsm.init_current_state(initial).await?;
        let current_state_id = fsm.current_state_id().await?.unwrap_or(initial);
        let deadline = ctx.config.signal_deadline;

        Ok(Self {
            ctx,
            catalog,
            actions,
            guards,
            bus,
            hub,
            trace,
            deadline,
            current_state_id,
        })
    }

    pub fn current_state(&self) -> Option<&StateDef> {
        self.catalog.state(self.current_state_id)
    }

    /// Consume signals until the bus drains or a terminal state is reached.
    pub async fn run(mut self, consumer: BusConsumer) -> Result<EngineExit, EngineError> {
        while let Some(signal) = consumer.recv().await {
            let outcome = self.step(signal).await?;
            if outcome.terminal {
                return Ok(EngineExit::TerminalState);
            }
        }
        Ok(EngineExit::BusClosed)
    }

    /// Consume exactly one signal. Exposed for tests and embeddings that
    /// drive the loop themselves.
    #[instrument(skip(self, signal), fields(signal_type = %signal.signal_type, correlation_id = %signal.correlation_id))]
    pub async fn step(&mut self, signal: Signal) -> Result<StepOutcome, EngineError> {
        let state_before = self
            .catalog
            .state(self.current_state_id)
            .ok_or(EngineError::StateMissing {
                state_id: self.current_state_id,
            })?
            .clone();

        // Guards filter the ordered candidates; first pass wins.
        let selected = self
            .catalog
            .candidates(state_before.id, &signal.signal_type)
            .into_iter()
            .find(|transition| match &transition.guard_key {
                None => true,
                Some(key) => match self.guards.get(key) {
                    Some(guard) => guard(&signal, &self.ctx),
                    None => false,
                },
            })
            .cloned();

        let Some(transition) = selected else {
            return self.finish_no_transition(&signal, &state_before).await;
        };

        let action_outcome = match &transition.action_key {
            None => Ok(ActionResult::succeeded()),
            // Unknown keys are rejected at boot; this arm also covers a
            // catalog edited mid-run.
            Some(key) => match self.actions.get(key) {
                None => Err(format!("unknown action key: {key}")),
                Some(action) => {
                    match tokio::time::timeout(self.deadline, action.execute(&signal, &self.ctx))
                        .await
                    {
                        Ok(Ok(result)) => Ok(result),
                        Ok(Err(err)) => Err(err.to_string()),
                        Err(_) => Err("timeout".to_string()),
                    }
                }
            },
        };

        match action_outcome {
            Ok(result) => {
                self.commit_step(&signal, &state_before, &transition, result)
                    .await
            }
            Err(error_summary) => {
                self.fail_step(&signal, &state_before, &transition, error_summary)
                    .await
            }
        }
    }

    async fn finish_no_transition(
        &mut self,
        signal: &Signal,
        state_before: &StateDef,
    ) -> Result<StepOutcome, EngineError> {
        let mut tx = self.ctx.store.begin().await?;
        FsmRuntimeRepo::append_trace_tx(
            &mut tx,
            &TraceEntry {
                correlation_id: Some(signal.correlation_id.clone()),
                state_before: state_before.key.clone(),
                signal_type: signal.signal_type.clone(),
                transition_id: None,
                action_key: None,
                state_after: state_before.key.clone(),
                result: "no_transition".to_string(),
                error_summary: None,
            },
        )
        .await?;
        SignalQueueRepo::complete_tx(&mut tx, &signal.id, true, None).await?;
        tx.commit().await.map_err(StoreError::from)?;

        self.trace
            .event("fsm.no_transition", TraceLevel::Debug)
            .correlation_id(Some(&signal.correlation_id))
            .node(&state_before.key)
            .detail(json!({ "signal_type": signal.signal_type }))
            .record()
            .await;

        Ok(StepOutcome {
            result: StepResult::NoTransition,
            state_after: state_before.id,
            terminal: state_before.is_terminal,
        })
    }

    /// The success path: one transaction covering the state marker, the
    /// trace row, every declared side effect, and the signal completion.
    async fn commit_step(
        &mut self,
        signal: &Signal,
        state_before: &StateDef,
        transition: &TransitionDef,
        result: ActionResult,
    ) -> Result<StepOutcome, EngineError> {
        let state_after = self
            .catalog
            .state(transition.next_state_id)
            .ok_or(EngineError::StateMissing {
                state_id: transition.next_state_id,
            })?
            .clone();

        let mut tx = self.ctx.store.begin().await?;
        FsmRuntimeRepo::set_current_state_tx(&mut tx, state_after.id).await?;
        FsmRuntimeRepo::append_trace_tx(
            &mut tx,
            &TraceEntry {
                correlation_id: Some(signal.correlation_id.clone()),
                state_before: state_before.key.clone(),
                signal_type: signal.signal_type.clone(),
                transition_id: Some(transition.id),
                action_key: transition.action_key.clone(),
                state_after: state_after.key.clone(),
                result: result.result_code.as_str().to_string(),
                error_summary: result.error_summary.clone(),
            },
        )
        .await?;

        for next in result.next_signals.iter().filter(|s| s.durable) {
            SignalQueueRepo::enqueue_tx(&mut tx, next).await?;
        }
        for timed in &result.timed_signals {
            TimedRepo::insert_tx(&mut tx, timed).await?;
        }
        for plan in &result.plans {
            PlanRepo::insert_instance_tx(&mut tx, plan).await?;
        }
        for task in &result.slice_requests {
            SliceRepo::upsert_task_tx(&mut tx, task).await?;
        }
        SignalQueueRepo::complete_tx(&mut tx, &signal.id, true, None).await?;
        tx.commit().await.map_err(StoreError::from)?;

        self.current_state_id = state_after.id;

        // Outbound delivery happens outside the transaction; failures are
        // traced by the hub, never retried from here.
        for message in result.outbound_messages {
            self.hub.deliver(message).await;
        }
        for next in result.next_signals {
            if let Err(err) = self.bus.publish(next).await {
                tracing::warn!(error = %err, "follow-up signal not published");
            }
        }

        self.trace
            .event("fsm.transition", TraceLevel::Info)
            .correlation_id(Some(&signal.correlation_id))
            .node(&state_after.key)
            .status(result.result_code.as_str())
            .detail(json!({
                "signal_type": signal.signal_type,
                "state_before": state_before.key,
                "transition_id": transition.id,
            }))
            .record()
            .await;

        Ok(StepOutcome {
            result: StepResult::Transitioned,
            state_after: state_after.id,
            terminal: state_after.is_terminal,
        })
    }

    /// The failure path: the state does not advance, the signal is marked
    /// failed, and a synthetic `action.failed` signal re-enters the bus.
    async fn fail_step(
        &mut self,
        signal: &Signal,
        state_before: &StateDef,
        transition: &TransitionDef,
        error_summary: String,
    ) -> Result<StepOutcome, EngineError> {
        let mut tx = self.ctx.store.begin().await?;
        FsmRuntimeRepo::append_trace_tx(
            &mut tx,
            &TraceEntry {
                correlation_id: Some(signal.correlation_id.clone()),
                state_before: state_before.key.clone(),
                signal_type: signal.signal_type.clone(),
                transition_id: Some(transition.id),
                action_key: transition.action_key.clone(),
                state_after: state_before.key.clone(),
                result: "failed".to_string(),
                error_summary: Some(error_summary.clone()),
            },
        )
        .await?;
        SignalQueueRepo::complete_tx(&mut tx, &signal.id, false, Some(&error_summary)).await?;
        tx.commit().await.map_err(StoreError::from)?;

        self.trace
            .event("fsm.action_failed", TraceLevel::Error)
            .correlation_id(Some(&signal.correlation_id))
            .node(&state_before.key)
            .error_code(if error_summary == "timeout" {
                "timeout"
            } else {
                "handler_error"
            })
            .detail(json!({
                "signal_type": signal.signal_type,
                "action_key": transition.action_key,
                "error": error_summary,
            }))
            .record()
            .await;

        // Do not emit a synthetic failure for a failure signal: that loop
        // would never converge.
        if signal.signal_type != types::ACTION_FAILED {
            let mut payload = json!({
                "action_key": transition.action_key,
                "error_summary": error_summary,
                "failed_signal_type": signal.signal_type,
            });
            // Thread the conversation through so the failure handler can
            // answer the user.
            for key in ["channel_type", "channel", "channel_target", "target"] {
                if let Some(value) = signal.payload.get(key) {
                    payload[key] = value.clone();
                }
            }
            let failure = Signal::new(types::ACTION_FAILED, "fsm", payload)
                .with_correlation_id(signal.correlation_id.clone());
            if let Err(err) = self.bus.publish(failure).await {
                tracing::warn!(error = %err, "synthetic action.failed not published");
            }
        }

        Ok(StepOutcome {
            result: StepResult::ActionFailed,
            state_after: state_before.id,
            terminal: state_before.is_terminal,
        })
    }
}
