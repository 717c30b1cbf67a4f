//! Plan executor worker.
//!
//! Claims queued plan instances, validates them against the registry,
//! dispatches to the executor named by the contract, and records one
//! `plan_runs` row per attempt. A `plan.run` signal on the bus nudges the
//! worker immediately; a poll interval catches anything the nudge missed.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::instrument;

use super::{ExecutorOutcome, PlanError, PlanRegistry};
use crate::bus::SignalBus;
use crate::extremities::DeliveryHub;
use crate::observability::{TraceLevel, TraceSink};
use crate::runtime::{response_keys, RuntimeContext};
use crate::signal::{types, Audience, NormalizedOutboundMessage, Signal};
use crate::store::plans::{PlanInstance, PlanStatus};
use crate::store::timed::TimedRepo;

const CLAIM_BATCH: i64 = 8;

pub struct PlanWorker {
    ctx: RuntimeContext,
    registry: Arc<PlanRegistry>,
    bus: Arc<SignalBus>,
    hub: Arc<DeliveryHub>,
    trace: Arc<TraceSink>,
    poll: Duration,
}

impl PlanWorker {
    #[must_use]
    pub fn new(
        ctx: RuntimeContext,
        registry: Arc<PlanRegistry>,
        bus: Arc<SignalBus>,
        hub: Arc<DeliveryHub>,
        trace: Arc<TraceSink>,
    ) -> Self {
        Self {
            ctx,
            registry,
            bus,
            hub,
            trace,
            poll: Duration::from_secs(2),
        }
    }

    /// Worker loop: wake on `plan.run` nudges from the bus tap, fall back to
    /// polling so queued rows from a previous run are not stranded.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        nudges: flume::Receiver<Signal>,
    ) {
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                nudge = nudges.recv_async() => {
                    match nudge {
                        Ok(signal) if signal.signal_type == types::PLAN_RUN => {
                            self.drain_queued().await;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                _ = ticker.tick() => {
                    self.drain_queued().await;
                }
            }
        }
        tracing::debug!("plan worker stopped");
    }

    /// Claim and execute every queued plan. Exposed for tests and
    /// embeddings that drive the loop themselves.
    pub async fn drain_queued(&self) {
        loop {
            let claimed = match self.ctx.store.plans().claim_queued(CLAIM_BATCH).await {
                Ok(plans) => plans,
                Err(err) => {
                    tracing::warn!(error = %err, "claiming queued plans failed");
                    return;
                }
            };
            if claimed.is_empty() {
                return;
            }
            for plan in claimed {
                self.run_one(plan).await;
            }
        }
    }

    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id, kind = %plan.plan_kind))]
    async fn run_one(&self, plan: PlanInstance) {
        let repo = self.ctx.store.plans();
        let run_id = match repo.start_run(&plan.plan_id).await {
            Ok(run_id) => run_id,
            Err(err) => {
                tracing::warn!(error = %err, "opening plan run failed");
                return;
            }
        };

        let outcome = self.execute(&plan).await;
        match outcome {
            Ok(outcome) => {
                let status = outcome.status;
                let resolution = outcome.resolution.clone();
                self.apply_effects(&plan, outcome).await;
                let _ = repo
                    .finish_run(&run_id, status.as_str(), resolution.as_deref(), None, None)
                    .await;
                let _ = repo.set_status(&plan.plan_id, status, None).await;
                self.trace
                    .event("plan.completed", TraceLevel::Info)
                    .correlation_id(plan.correlation_id.as_deref())
                    .status(status.as_str())
                    .record()
                    .await;
            }
            Err(err) => {
                let error_text = err.to_string();
                let _ = repo
                    .finish_run(&run_id, "failed", Some(&error_text), None, None)
                    .await;
                let _ = repo
                    .set_status(&plan.plan_id, PlanStatus::Failed, Some(&error_text))
                    .await;
                self.trace
                    .event("plan.failed", TraceLevel::Error)
                    .correlation_id(plan.correlation_id.as_deref())
                    .error_code(plan_error_code(&err))
                    .detail(serde_json::json!({ "error": error_text }))
                    .record()
                    .await;
                self.send_safe_fallback(&plan).await;
            }
        }
    }

    async fn execute(&self, plan: &PlanInstance) -> Result<ExecutorOutcome, PlanError> {
        self.registry
            .validate_new(&plan.plan_kind, plan.plan_version, &plan.payload)?;
        let spec = self
            .registry
            .get(&plan.plan_kind, plan.plan_version)
            .ok_or_else(|| PlanError::UnknownKind {
                kind: plan.plan_kind.clone(),
                version: plan.plan_version,
            })?;
        let executor =
            self.registry
                .executor(&spec.executor_key)
                .ok_or_else(|| PlanError::UnknownExecutor {
                    key: spec.executor_key.clone(),
                })?;
        executor.run(plan, &self.ctx).await
    }

    async fn apply_effects(&self, plan: &PlanInstance, outcome: ExecutorOutcome) {
        let timed_repo: TimedRepo = self.ctx.store.timed();
        for timed in &outcome.timed_signals {
            if let Err(err) = timed_repo.insert(timed).await {
                tracing::warn!(error = %err, timed_id = %timed.id, "timed insert from plan failed");
            }
        }
        for message in outcome.outbound_messages {
            self.hub.deliver(message).await;
        }
        for signal in outcome.next_signals {
            let correlated = signal.with_correlation_id(
                plan.correlation_id
                    .clone()
                    .unwrap_or_else(|| plan.plan_id.clone()),
            );
            if let Err(err) = self.bus.publish(correlated).await {
                tracing::warn!(error = %err, "republishing plan follow-up failed");
            }
        }
    }

    /// The user never sees validation internals, only a calm pause message.
    async fn send_safe_fallback(&self, plan: &PlanInstance) {
        let target = plan
            .payload
            .get("target")
            .and_then(|t| t.get("channel_target"))
            .and_then(serde_json::Value::as_str);
        let channel = plan
            .source_channel
            .clone()
            .or_else(|| {
                plan.payload
                    .get("target")
                    .and_then(|t| t.get("channel_type"))
                    .and_then(serde_json::Value::as_str)
                    .map(ToString::to_string)
            });
        let (Some(target), Some(channel)) = (target, channel) else {
            return;
        };
        let text = self
            .ctx
            .renderer
            .render(response_keys::INTERNAL_PAUSE, &FxHashMap::default());
        self.hub
            .deliver(NormalizedOutboundMessage::new(
                text,
                channel,
                target,
                Audience::user(plan.actor.clone().unwrap_or_else(|| target.to_string())),
                plan.correlation_id
                    .clone()
                    .unwrap_or_else(|| plan.plan_id.clone()),
            ))
            .await;
    }
}

fn plan_error_code(err: &PlanError) -> &'static str {
    match err {
        PlanError::UnknownKind { .. } => "unknown_kind",
        PlanError::Deprecated { .. } => "deprecated_version",
        PlanError::Validation { .. } => "validation_failed",
        PlanError::Schema { .. } => "schema_invalid",
        PlanError::UnknownExecutor { .. } => "unknown_executor",
        PlanError::Store(_) => "store_error",
    }
}
