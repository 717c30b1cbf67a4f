//! ```text
//! Senses ──► SignalBus ──► FsmEngine ─► ActionRegistry ─► ActionResult
//!              │               │                             │
//!              │               └─► one transaction: state marker,
//!              │                   fsm_trace, side effects, completion
//!              │
//!              ├─► PlanWorker ──► PlanRegistry ─► executors
//!              ├─► SliceExecutor ─► leases / CAS checkpoints
//!              └─► TimedScheduler ─► timed_signals (catch-up policy)
//!
//! ActionResult ─► DeliveryHub ─► Extremities (cli / sse)
//! Everything durable lives in one SQLite store; every event carries a
//! correlation id into the observability trace.
//! ```
//!
//! nervecore is the persistent kernel of a local-first domestic agent:
//! normalized events in, a data-defined FSM in the middle, durable queues
//! and cooperative long-running work around it.

pub mod actions;
pub mod bus;
pub mod catalog;
pub mod engine;
pub mod extremities;
pub mod gateway;
pub mod heart;
pub mod observability;
pub mod plans;
pub mod runtime;
pub mod senses;
pub mod signal;
pub mod slices;
pub mod store;
pub mod timed;
