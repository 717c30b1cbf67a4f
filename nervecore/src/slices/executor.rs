//! The slice executor: fair scheduling, leases, budgets, and checkpointed
//! yielding.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::instrument;

use super::driver::{CycleOutcome, SliceDriver};
use super::{events, SliceError};
use crate::bus::SignalBus;
use crate::extremities::DeliveryHub;
use crate::observability::{TraceLevel, TraceSink};
use crate::runtime::RuntimeContext;
use crate::signal::{types, Audience, NormalizedOutboundMessage, Signal};
use crate::store::slices::{SliceStatus, SliceTask};

#[derive(Clone, Debug)]
pub struct SliceExecutorConfig {
    pub poll: StdDuration,
    pub lease: StdDuration,
    pub default_cycles: i64,
    /// Per-slice wall clock, used when the task carries no budget of its own.
    pub max_runtime: StdDuration,
    /// Cooldown before a yielded task becomes runnable again.
    pub yield_delay: StdDuration,
    /// Slices without net progress before the progress gate fails the task.
    pub no_progress_slices: i64,
    pub max_failure_streak: i64,
    /// Final fuse: total cycles across all slices.
    pub hard_cycle_cap: i64,
    pub starvation_warn: StdDuration,
}

impl Default for SliceExecutorConfig {
    fn default() -> Self {
        Self {
            poll: StdDuration::from_secs(2),
            lease: StdDuration::from_secs(30),
            default_cycles: 3,
            max_runtime: StdDuration::from_secs(120),
            yield_delay: StdDuration::from_secs(5),
            no_progress_slices: 3,
            max_failure_streak: 3,
            hard_cycle_cap: 100,
            starvation_warn: StdDuration::from_secs(300),
        }
    }
}

enum SliceEnd {
    Yielded,
    Done(Option<String>),
    WaitingUser(String),
    Failed(String),
    Paused(String),
    StaleCheckpoint,
}

pub struct SliceExecutor {
    ctx: RuntimeContext,
    bus: Arc<SignalBus>,
    hub: Arc<DeliveryHub>,
    trace: Arc<TraceSink>,
    driver: Arc<dyn SliceDriver>,
    config: SliceExecutorConfig,
    worker_id: String,
}

impl SliceExecutor {
    #[must_use]
    pub fn new(
        ctx: RuntimeContext,
        bus: Arc<SignalBus>,
        hub: Arc<DeliveryHub>,
        trace: Arc<TraceSink>,
        driver: Arc<dyn SliceDriver>,
        config: SliceExecutorConfig,
        worker_id: String,
    ) -> Self {
        Self {
            ctx,
            bus,
            hub,
            trace,
            driver,
            config,
            worker_id,
        }
    }

    /// Worker loop: poll for runnable tasks, react to resume requests from
    /// the bus tap.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        signals: flume::Receiver<Signal>,
    ) {
        let mut ticker = tokio::time::interval(self.config.poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_owner: Option<String> = None;
        let mut last_starvation_warn: Option<DateTime<Utc>> = None;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                signal = signals.recv_async() => {
                    match signal {
                        Ok(signal) if signal.signal_type == types::PDCA_RESUME_REQUESTED => {
                            self.handle_resume(&signal).await;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self
                        .run_once(Utc::now(), &mut last_owner, &mut last_starvation_warn)
                        .await
                    {
                        tracing::warn!(error = %err, "slice executor pass failed");
                    }
                }
            }
        }
        tracing::debug!(worker_id = %self.worker_id, "slice executor stopped");
    }

    /// One scheduling pass: pick at most one task, run one slice of it.
    /// Exposed for tests.
    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        last_owner: &mut Option<String>,
        last_starvation_warn: &mut Option<DateTime<Utc>>,
    ) -> Result<usize, SliceError> {
        let mut candidates = self.ctx.store.slices().list_runnable(now, 20).await?;
        self.warn_starving(&candidates, now, last_starvation_warn)
            .await?;

        // Fairness nudge: avoid giving the same owner back-to-back slices
        // when someone else is waiting.
        if let Some(previous) = last_owner.as_deref() {
            if let Some(pos) = candidates.iter().position(|t| t.owner_id != previous) {
                let preferred = candidates.remove(pos);
                candidates.insert(0, preferred);
            }
        }

        for task in candidates {
            let lease = Duration::seconds(self.config.lease.as_secs() as i64);
            let acquired = self
                .ctx
                .store
                .slices()
                .acquire_lease(&task.task_id, &self.worker_id, lease, now)
                .await?;
            if !acquired {
                continue;
            }
            *last_owner = Some(task.owner_id.clone());
            self.run_slice(task).await?;
            return Ok(1);
        }
        Ok(0)
    }

    async fn warn_starving(
        &self,
        candidates: &[SliceTask],
        now: DateTime<Utc>,
        last_warn: &mut Option<DateTime<Utc>>,
    ) -> Result<(), SliceError> {
        let threshold = Duration::seconds(self.config.starvation_warn.as_secs() as i64);
        if let Some(previous) = *last_warn {
            if now - previous < Duration::seconds(60) {
                return Ok(());
            }
        }
        for task in candidates {
            let waiting_since = task.next_run_at.unwrap_or(task.created_at);
            if now - waiting_since > threshold {
                self.ctx
                    .store
                    .slices()
                    .append_event(
                        &task.task_id,
                        events::STARVATION_WARNING,
                        &json!({ "waiting_since": waiting_since.to_rfc3339() }),
                        None,
                    )
                    .await?;
                *last_warn = Some(now);
            }
        }
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.task_id, owner = %task.owner_id))]
    async fn run_slice(&self, mut task: SliceTask) -> Result<(), SliceError> {
        let repo = self.ctx.store.slices();
        let checkpoint = repo.load_checkpoint(&task.task_id).await?;
        let base_version = checkpoint.as_ref().map(|c| c.version).unwrap_or(0);
        let mut state = checkpoint
            .as_ref()
            .map(|c| c.state.clone())
            .unwrap_or(Value::Null);
        let mut task_state = checkpoint
            .as_ref()
            .map(|c| c.task_state.clone())
            .unwrap_or_else(|| json!({}));

        let correlation_id = task
            .metadata
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| task.task_id.clone());

        repo.append_event(
            &task.task_id,
            events::SLICE_STARTED,
            &json!({ "worker_id": self.worker_id, "checkpoint_version": base_version }),
            Some(&correlation_id),
        )
        .await?;
        self.trace
            .event("slice.started", TraceLevel::Info)
            .correlation_id(Some(&correlation_id))
            .node(&task.task_id)
            .record()
            .await;

        let mut total_cycles = task_state
            .get("total_cycles")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let mut no_progress = task_state
            .get("no_progress_streak")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let hard_cap = task.max_cycles.unwrap_or(self.config.hard_cycle_cap);
        let wall_budget = task
            .max_runtime_seconds
            .map(|s| StdDuration::from_secs(s.max(1) as u64))
            .unwrap_or(self.config.max_runtime);

        let slice_cycles = if task.slice_cycles > 0 {
            task.slice_cycles
        } else {
            self.config.default_cycles
        };
        let started = Instant::now();
        let mut end = SliceEnd::Yielded;
        let mut made_progress = false;

        for cycle in 0..slice_cycles {
            if started.elapsed() > wall_budget {
                break;
            }
            if total_cycles >= hard_cap {
                end = SliceEnd::Failed("cycle_cap_exceeded".to_string());
                break;
            }
            if let Some(budget) = task.token_budget_remaining {
                if budget <= 0 {
                    repo.append_event(
                        &task.task_id,
                        events::BUDGET_EXHAUSTED,
                        &json!({ "reason": "token_budget" }),
                        Some(&correlation_id),
                    )
                    .await?;
                    end = SliceEnd::Paused("token_budget_exhausted".to_string());
                    break;
                }
            }

            let report = match self
                .driver
                .cycle(&task, &mut state, total_cycles, &self.ctx)
                .await
            {
                Ok(report) => report,
                Err(err) => {
                    end = SliceEnd::Failed(err.to_string());
                    break;
                }
            };
            total_cycles += 1;
            if let Some(budget) = task.token_budget_remaining {
                task.token_budget_remaining = Some(budget - report.tokens_spent.max(0));
            }
            if report.progressed {
                made_progress = true;
            }
            self.trace
                .event("slice.cycle", TraceLevel::Debug)
                .correlation_id(Some(&correlation_id))
                .node(&task.task_id)
                .cycle(cycle)
                .record()
                .await;

            match report.outcome {
                CycleOutcome::Continue => continue,
                CycleOutcome::Done(message) => {
                    end = SliceEnd::Done(message);
                    break;
                }
                CycleOutcome::WaitingUser(question) => {
                    end = SliceEnd::WaitingUser(question);
                    break;
                }
                CycleOutcome::Failed(message) => {
                    end = SliceEnd::Failed(message);
                    break;
                }
            }
        }

        // Progress gate: a full slice with no net progress counts against
        // the task; enough of them in a row and the task is failed rather
        // than left spinning.
        if matches!(end, SliceEnd::Yielded) {
            no_progress = if made_progress { 0 } else { no_progress + 1 };
            if no_progress >= self.config.no_progress_slices {
                end = SliceEnd::Failed("no_progress".to_string());
            }
        }

        task_state = json!({
            "total_cycles": total_cycles,
            "no_progress_streak": no_progress,
        });

        // Persist the checkpoint before any status change so a crash after
        // this point resumes from the slice we just ran.
        if !matches!(end, SliceEnd::StaleCheckpoint) {
            let saved = repo
                .save_checkpoint(&task.task_id, &state, &task_state, Some(base_version))
                .await?;
            if saved.is_none() {
                end = SliceEnd::StaleCheckpoint;
            }
        }

        let now = Utc::now();
        match end {
            SliceEnd::Yielded => {
                task.status = SliceStatus::Queued;
                task.next_run_at =
                    Some(now + Duration::seconds(self.config.yield_delay.as_secs() as i64));
                task.failure_streak = 0;
                repo.upsert_task(&task).await?;
                repo.append_event(
                    &task.task_id,
                    events::SLICE_PERSISTED,
                    &json!({ "total_cycles": total_cycles }),
                    Some(&correlation_id),
                )
                .await?;
                self.trace
                    .event("slice.persisted", TraceLevel::Info)
                    .correlation_id(Some(&correlation_id))
                    .node(&task.task_id)
                    .record()
                    .await;
            }
            SliceEnd::Done(message) => {
                repo.set_status(&task.task_id, SliceStatus::Done, None).await?;
                repo.append_event(
                    &task.task_id,
                    events::SLICE_COMPLETED,
                    &json!({ "total_cycles": total_cycles }),
                    Some(&correlation_id),
                )
                .await?;
                self.trace
                    .event("slice.completed", TraceLevel::Info)
                    .correlation_id(Some(&correlation_id))
                    .node(&task.task_id)
                    .status("done")
                    .record()
                    .await;
                if let Some(message) = message {
                    self.deliver_to_conversation(&task, &correlation_id, message)
                        .await;
                }
                let completion = Signal::new(
                    types::ACTION_SUCCEEDED,
                    "slice_executor",
                    json!({ "task_id": &task.task_id, "owner_id": &task.owner_id }),
                )
                .with_correlation_id(correlation_id.clone());
                if let Err(err) = self.bus.publish(completion).await {
                    tracing::debug!(error = %err, "completion signal not published");
                }
            }
            SliceEnd::WaitingUser(question) => {
                repo.set_status(&task.task_id, SliceStatus::WaitingUser, None)
                    .await?;
                repo.append_event(
                    &task.task_id,
                    events::SLICE_WAITING_USER,
                    &json!({ "question": question }),
                    Some(&correlation_id),
                )
                .await?;
                self.deliver_to_conversation(&task, &correlation_id, question)
                    .await;
            }
            SliceEnd::Failed(reason) => {
                task.failure_streak += 1;
                let terminal = task.failure_streak >= self.config.max_failure_streak
                    || reason == "cycle_cap_exceeded"
                    || reason == "no_progress";
                let status = if terminal {
                    SliceStatus::Failed
                } else {
                    SliceStatus::Paused
                };
                task.status = status;
                task.last_error = Some(reason.clone());
                // Backoff scales with the failure streak.
                task.next_run_at = Some(
                    now + Duration::seconds(
                        self.config.yield_delay.as_secs() as i64 * task.failure_streak.max(1),
                    ),
                );
                repo.upsert_task(&task).await?;
                repo.append_event(
                    &task.task_id,
                    events::SLICE_FAILED,
                    &json!({ "reason": reason, "failure_streak": task.failure_streak }),
                    Some(&correlation_id),
                )
                .await?;
                self.trace
                    .event("slice.failed", TraceLevel::Error)
                    .correlation_id(Some(&correlation_id))
                    .node(&task.task_id)
                    .error_code(&reason)
                    .record()
                    .await;
            }
            SliceEnd::Paused(reason) => {
                repo.set_status(&task.task_id, SliceStatus::Paused, Some(&reason))
                    .await?;
            }
            SliceEnd::StaleCheckpoint => {
                tracing::warn!(
                    task_id = %task.task_id,
                    "checkpoint version moved underneath this worker; slice discarded"
                );
            }
        }

        repo.release_lease(&task.task_id, &self.worker_id).await?;
        Ok(())
    }

    /// Resume requests carry the checkpoint version the requester saw. A
    /// stored checkpoint newer than that makes the request stale.
    pub async fn handle_resume(&self, signal: &Signal) {
        let Some(task_id) = signal
            .payload
            .get("task_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
        else {
            return;
        };
        let seen_version = signal
            .payload
            .get("checkpoint_version")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let repo = self.ctx.store.slices();
        let stored = match repo.load_checkpoint(&task_id).await {
            Ok(checkpoint) => checkpoint.map(|c| c.version).unwrap_or(0),
            Err(err) => {
                tracing::warn!(error = %err, "resume lookup failed");
                return;
            }
        };
        if stored > seen_version {
            self.trace
                .event("slice.stale_resume", TraceLevel::Warning)
                .correlation_id(Some(&signal.correlation_id))
                .node(&task_id)
                .detail(json!({ "stored_version": stored, "seen_version": seen_version }))
                .record()
                .await;
            return;
        }

        let task = match repo.get_task(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "resume task lookup failed");
                return;
            }
        };
        if task.status.is_terminal() {
            return;
        }
        let mut task = task;
        task.status = SliceStatus::Queued;
        task.next_run_at = Some(Utc::now());
        if let Err(err) = repo.upsert_task(&task).await {
            tracing::warn!(error = %err, "requeueing resumed task failed");
        }
    }

    async fn deliver_to_conversation(
        &self,
        task: &SliceTask,
        correlation_id: &str,
        message: String,
    ) {
        let (channel_type, channel_target) = task
            .conversation_key
            .split_once(':')
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .unwrap_or_else(|| ("cli".to_string(), task.conversation_key.clone()));
        self.hub
            .deliver(NormalizedOutboundMessage::new(
                message,
                channel_type,
                channel_target,
                Audience::user(task.owner_id.clone()),
                correlation_id,
            ))
            .await;
    }
}
