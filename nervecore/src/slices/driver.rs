//! Slice drivers: the unit of domain work inside a slice cycle.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::SliceError;
use crate::runtime::RuntimeContext;
use crate::store::slices::SliceTask;

/// What one plan/decide/act/check cycle concluded.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// More work remains; run another cycle if the slice budget allows.
    Continue,
    /// The task finished. Carries the final user-facing message, if any.
    Done(Option<String>),
    /// The task needs user input. Carries the question to deliver.
    WaitingUser(String),
    /// The cycle hit an unrecoverable condition.
    Failed(String),
}

/// Cycle result plus the bookkeeping the executor's safety gates need.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Tokens consumed this cycle, charged against the task budget.
    pub tokens_spent: i64,
    /// Whether the cycle made net progress. The progress gate fails tasks
    /// that spin without it.
    pub progressed: bool,
}

impl CycleReport {
    #[must_use]
    pub fn progressed(outcome: CycleOutcome, tokens_spent: i64) -> Self {
        Self {
            outcome,
            tokens_spent,
            progressed: true,
        }
    }
}

#[async_trait]
pub trait SliceDriver: Send + Sync {
    /// Run one cycle, mutating `state` in place. `state` is rehydrated from
    /// the latest checkpoint before the slice and persisted after it.
    async fn cycle(
        &self,
        task: &SliceTask,
        state: &mut Value,
        cycle_index: i64,
        ctx: &RuntimeContext,
    ) -> Result<CycleReport, SliceError>;
}

/// Deterministic driver: walks a step list carried in the task metadata.
///
/// Task metadata shape: `{"goal": "...", "steps": ["...", ...]}`. A missing
/// step list degrades to the goal as a single step. Each cycle consumes one
/// step; the state records a cursor and a log of completed steps.
pub struct StepListDriver;

impl StepListDriver {
    fn steps_for(task: &SliceTask) -> Vec<String> {
        let from_metadata = task
            .metadata
            .get("steps")
            .and_then(Value::as_array)
            .map(|steps| {
                steps
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        if !from_metadata.is_empty() {
            return from_metadata;
        }
        task.metadata
            .get("goal")
            .and_then(Value::as_str)
            .map(|goal| vec![goal.to_string()])
            .unwrap_or_default()
    }
}

#[async_trait]
impl SliceDriver for StepListDriver {
    async fn cycle(
        &self,
        task: &SliceTask,
        state: &mut Value,
        _cycle_index: i64,
        _ctx: &RuntimeContext,
    ) -> Result<CycleReport, SliceError> {
        let steps = Self::steps_for(task);
        if steps.is_empty() {
            return Ok(CycleReport {
                outcome: CycleOutcome::Failed("task has no goal or steps".to_string()),
                tokens_spent: 0,
                progressed: false,
            });
        }

        let cursor = state.get("cursor").and_then(Value::as_i64).unwrap_or(0);
        if cursor as usize >= steps.len() {
            let summary = format!("Finished: {}", steps.join(", "));
            return Ok(CycleReport::progressed(
                CycleOutcome::Done(Some(summary)),
                0,
            ));
        }

        let step = &steps[cursor as usize];
        let mut log: Vec<Value> = state
            .get("log")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        log.push(json!({ "step": step, "cycle": cursor }));

        *state = json!({
            "cursor": cursor + 1,
            "log": log,
        });

        let outcome = if (cursor + 1) as usize >= steps.len() {
            CycleOutcome::Done(Some(format!("Finished: {}", steps.join(", "))))
        } else {
            CycleOutcome::Continue
        };
        Ok(CycleReport::progressed(outcome, 10))
    }
}
