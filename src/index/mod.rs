// src/index/mod.rs

//! Dataset index: which units have files at each dataset layer.
//!
//! - [`scan`] walks one layer and produces a [`DatasetIndex`].
//! - [`snapshot`] bundles the manifest and every layer's index into the
//!   explicit [`DatasetSnapshot`] a tracker pass is computed from.

pub mod scan;
pub mod snapshot;

pub use scan::{bids_suffix, scan, DatasetIndex, ScanOptions, UnitFacts};
pub use snapshot::DatasetSnapshot;
