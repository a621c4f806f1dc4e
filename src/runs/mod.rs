// src/runs/mod.rs

//! Run tracking: the lifecycle of every dispatched invocation.
//!
//! - [`record`]: `RunRecord` and its `queued -> running -> succeeded|failed`
//!   state machine.
//! - [`store`]: one JSON file per attempt.
//! - [`tracker`]: dispatch, transitions and staleness reconciliation.

pub mod record;
pub mod store;
pub mod tracker;

pub use record::{FailureReason, RunKey, RunRecord, RunStatus};
pub use store::RunStore;
pub use tracker::{DispatchOutcome, RunTracker, StaleRunWarning};
