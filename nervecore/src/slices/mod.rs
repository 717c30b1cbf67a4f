/*!
Cooperative slice executor.

Long-running plans run as `pdca_tasks`: bounded slices of work interleaved
across owners so no conversation monopolizes the kernel. A slice is capped
by cycle count, wall clock, token budget, and failure streak; between
slices the task state lives in a compare-and-swap versioned checkpoint.
Suspension happens only at slice boundaries and resumption is always
explicit; a resume request older than the stored checkpoint is stale and
ignored.
*/

mod driver;
mod executor;

use miette::Diagnostic;
use thiserror::Error;

pub use driver::{CycleOutcome, CycleReport, SliceDriver, StepListDriver};
pub use executor::{SliceExecutor, SliceExecutorConfig};

use crate::store::StoreError;

#[derive(Debug, Error, Diagnostic)]
pub enum SliceError {
    #[error("slice driver failed: {message}")]
    #[diagnostic(code(nervecore::slices::driver))]
    Driver { message: String },

    #[error("checkpoint version conflict for task {task_id}")]
    #[diagnostic(
        code(nervecore::slices::checkpoint_conflict),
        help("Another worker advanced the task; this slice's work is discarded.")
    )]
    CheckpointConflict { task_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Audit event types written to `pdca_events`.
pub mod events {
    pub const TASK_ENQUEUED: &str = "task.enqueued";
    pub const SLICE_STARTED: &str = "slice.started";
    pub const SLICE_PERSISTED: &str = "slice.persisted";
    pub const SLICE_COMPLETED: &str = "slice.completed";
    pub const SLICE_FAILED: &str = "slice.failed";
    pub const SLICE_WAITING_USER: &str = "slice.waiting_user";
    pub const BUDGET_EXHAUSTED: &str = "slice.blocked.budget_exhausted";
    pub const STARVATION_WARNING: &str = "queue.starvation_warning";
}
