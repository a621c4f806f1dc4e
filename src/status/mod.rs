// src/status/mod.rs

//! The status tracker: joins the manifest with the dataset index into one
//! row of stage flags per unit.
//!
//! - [`table`]: `StatusRecord`, `StatusTable` and their TSV form.
//! - [`compute`]: the pure, short-circuiting stage evaluation and
//!   regression detection.
//! - [`store`]: atomic persistence of the table.
//! - [`tracker`]: a full pass over the dataset.

pub mod compute;
pub mod store;
pub mod table;
pub mod tracker;

pub use compute::{compute, detect_regressions, PipelineColumn, Regression};
pub use store::StatusStore;
pub use table::{Stage, StatusRecord, StatusTable};
pub use tracker::{Inconsistency, PassReport, StatusTracker};
