// src/index/snapshot.rs

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::DatasetLayout;
use crate::errors::Result;
use crate::fs::FileSystem;
use crate::index::scan::{scan, DatasetIndex, ScanOptions};
use crate::manifest::Manifest;
use crate::types::{Layer, PipelineKey, UnitId};

/// Everything a status pass is computed from, captured at one point in time.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    pub manifest: Manifest,
    pub source: DatasetIndex,
    pub bids: DatasetIndex,
    pub derivatives: BTreeMap<PipelineKey, DatasetIndex>,
}

impl DatasetSnapshot {
    /// Scan every layer of the dataset described by `layout`.
    pub fn capture(
        fs: &dyn FileSystem,
        layout: &DatasetLayout,
        options: &ScanOptions,
        manifest: Manifest,
        pipelines: &[PipelineKey],
    ) -> Result<Self> {
        let source = scan(fs, &layout.raw, Layer::Source, options)?;
        let bids = scan(fs, &layout.bids, Layer::Bids, options)?;

        let mut derivatives = BTreeMap::new();
        for key in pipelines {
            let root = layout.output_dir(key);
            debug!(pipeline = %key, root = %root.display(), "scanning derivatives");
            let index = scan(fs, &root, Layer::Derivative(key.clone()), options)?;
            derivatives.insert(key.clone(), index);
        }

        Ok(Self {
            manifest,
            source,
            bids,
            derivatives,
        })
    }

    pub fn derivative(&self, key: &PipelineKey) -> Option<&DatasetIndex> {
        self.derivatives.get(key)
    }

    /// True if any pipeline has derivative data for the unit.
    pub fn has_derivatives(&self, unit: &UnitId) -> bool {
        self.derivatives.values().any(|d| d.has_data(unit))
    }
}
