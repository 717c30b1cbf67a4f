/*!
Timed-signal scheduler.

Actions write `timed_signals` rows; the single ticker wakes on a short
interval, claims every due `pending` row via conditional update, and
publishes a durable `timed_signal.fired` signal per claim. Dispatch is
at-least-once; executors dedupe on the payload's idempotency key.

Catch-up policy: the acceptable lag baseline is 30 minutes; recurring rows
widen it to `max(30m, 5% × period)`. A one-shot row beyond the window fails
with `missed_dispatch_window`; a recurring occurrence beyond it is skipped
and the cursor moves to the next future occurrence.
*/

pub mod recurrence;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::watch;
use tracing::instrument;

pub use recurrence::{Freq, Recurrence, RecurrenceError};

use crate::bus::SignalBus;
use crate::observability::{TraceLevel, TraceSink};
use crate::signal::{types, Signal};
use crate::store::timed::{TimedRepo, TimedSignalRow};
use crate::store::NerveStore;

fn baseline_dispatch_window() -> Duration {
    Duration::minutes(30)
}

pub struct TimedScheduler {
    repo: TimedRepo,
    bus: Arc<SignalBus>,
    trace: Arc<TraceSink>,
    tick: StdDuration,
    lease: Duration,
    worker_id: String,
}

impl TimedScheduler {
    #[must_use]
    pub fn new(
        store: &NerveStore,
        bus: Arc<SignalBus>,
        trace: Arc<TraceSink>,
        tick: StdDuration,
        lease: StdDuration,
    ) -> Self {
        Self {
            repo: store.timed(),
            bus,
            trace,
            tick,
            lease: Duration::seconds(lease.as_secs() as i64),
            worker_id: format!("timed-scheduler-{}", std::process::id()),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick_once(Utc::now()).await {
                        tracing::warn!(error = %err, "timed scheduler tick failed");
                    }
                }
            }
        }
        tracing::debug!("timed scheduler stopped");
    }

    /// One scheduler pass. Exposed for tests.
    #[instrument(skip(self), err)]
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<usize, crate::store::StoreError> {
        let reclaimed = self.repo.reclaim_stale(self.lease).await?;
        if reclaimed > 0 {
            tracing::info!(reclaimed, "reclaimed stale timed claims");
        }

        let claimed = self.repo.claim_due(now, &self.worker_id).await?;
        let mut dispatched = 0usize;
        for row in claimed {
            if self.handle_claimed(&row, now).await? {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    async fn handle_claimed(
        &self,
        row: &TimedSignalRow,
        now: DateTime<Utc>,
    ) -> Result<bool, crate::store::StoreError> {
        let due_at = row.due_at();
        let lag = now - due_at;
        let recurrence = row
            .rrule
            .as_deref()
            .and_then(|raw| Recurrence::parse(raw).ok());
        let window = recurrence
            .as_ref()
            .map(|rule| {
                let five_percent = rule.period() / 20;
                baseline_dispatch_window().max(five_percent)
            })
            .unwrap_or_else(baseline_dispatch_window);

        if lag > window {
            return self.handle_missed(row, recurrence.as_ref(), now).await;
        }

        self.dispatch(row, due_at).await;
        self.repo.mark_fired(&row.id, now).await?;

        if let Some(rule) = &recurrence {
            let tz = recurrence::resolve_timezone(row.timezone.as_deref());
            match rule.next_occurrence(due_at, tz) {
                Some(next) => self.repo.reschedule(&row.id, next).await?,
                None => {
                    tracing::warn!(timed_id = %row.id, "recurrence yields no further occurrences");
                }
            }
        }
        Ok(true)
    }

    async fn handle_missed(
        &self,
        row: &TimedSignalRow,
        recurrence: Option<&Recurrence>,
        now: DateTime<Utc>,
    ) -> Result<bool, crate::store::StoreError> {
        match recurrence {
            Some(rule) => {
                let tz = recurrence::resolve_timezone(row.timezone.as_deref());
                let next = rule.next_occurrence(now, tz);
                self.repo.mark_skipped(&row.id, next).await?;
                self.trace
                    .event("timed.skipped", TraceLevel::Warning)
                    .correlation_id(row.correlation_id.as_deref())
                    .status("skipped")
                    .detail(json!({
                        "timed_signal_id": row.id,
                        "due_at": row.due_at().to_rfc3339(),
                        "next_trigger_at": next.map(|dt| dt.to_rfc3339()),
                    }))
                    .record()
                    .await;
            }
            None => {
                self.repo
                    .mark_failed(&row.id, "missed_dispatch_window")
                    .await?;
                self.trace
                    .event("timed.missed", TraceLevel::Error)
                    .correlation_id(row.correlation_id.as_deref())
                    .status("failed")
                    .error_code("missed_dispatch_window")
                    .detail(json!({
                        "timed_signal_id": row.id,
                        "due_at": row.due_at().to_rfc3339(),
                    }))
                    .record()
                    .await;
            }
        }
        Ok(false)
    }

    async fn dispatch(&self, row: &TimedSignalRow, due_at: DateTime<Utc>) {
        let correlation_id = row
            .correlation_id
            .clone()
            .unwrap_or_else(|| row.id.clone());
        let signal = Signal::new(
            types::TIMED_SIGNAL_FIRED,
            "timed_scheduler",
            json!({
                "timed_signal_id": row.id,
                "signal_type": row.signal_type,
                "payload": row.payload,
                "target": row.target,
                "origin": row.origin,
                "correlation_id": correlation_id,
                "trigger_at": due_at.to_rfc3339(),
            }),
        )
        .with_correlation_id(correlation_id.clone())
        .durable();

        if let Err(err) = self.bus.publish(signal).await {
            tracing::warn!(timed_id = %row.id, error = %err, "publishing timed dispatch failed");
        }

        self.trace
            .event("timed.dispatched", TraceLevel::Info)
            .correlation_id(Some(&correlation_id))
            .status("dispatched")
            .detail(json!({
                "timed_signal_id": row.id,
                "signal_type": row.signal_type,
                "attempts": row.attempts,
            }))
            .record()
            .await;
    }
}
