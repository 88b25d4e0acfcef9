//! Layer descriptors and tiling configurations.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Mapping from dimension name to positive extent. Insertion order is
/// preserved so heuristics can break ties by original key order;
/// equality and fingerprinting ignore it.
pub type DimMap = IndexMap<String, u64>;

/// Mapping from dimension name to a chosen split factor. Every split
/// must divide the corresponding extent, and the key set must equal the
/// layer's dimension key set exactly.
pub type TilingConfig = IndexMap<String, u64>;

/// One computational operation instance in the compiled model graph.
/// Immutable once extracted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Layer name as it appears in the compiled output.
    pub name: String,
    /// Operation type, e.g. `conv` or `gemm`.
    pub operation: String,
    /// Instance counter within the operation type.
    pub instance_id: u64,
    /// The layer's iteration space.
    pub dimensions: DimMap,
    /// Tile splits the compiler chose by default; used as a search hint.
    #[serde(default)]
    pub current_tile_splits: DimMap,
}

impl LayerDescriptor {
    pub fn new(
        name: impl Into<String>,
        operation: impl Into<String>,
        instance_id: u64,
        dimensions: DimMap,
    ) -> Self {
        Self {
            name: name.into(),
            operation: operation.into(),
            instance_id,
            dimensions,
            current_tile_splits: DimMap::new(),
        }
    }

    pub fn with_current_splits(mut self, splits: DimMap) -> Self {
        self.current_tile_splits = splits;
        self
    }

    /// Stable identifier addressing this layer's tiling assignment in
    /// the final configuration.
    pub fn tiling_key(&self) -> String {
        format!("{}_{}", self.operation, self.instance_id)
    }
}

/// Outcome of a layer's search. Absent fields mean no candidate ever
/// produced a usable metric; downstream consumers keep the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub best_config: Option<TilingConfig>,
    pub best_metric: Option<f64>,
    pub tiling_key: String,
}

impl OptimizationResult {
    /// An empty result for a layer whose search has not produced (or
    /// never produces) a usable metric.
    pub fn exhausted(tiling_key: impl Into<String>) -> Self {
        Self {
            best_config: None,
            best_metric: None,
            tiling_key: tiling_key.into(),
        }
    }

    pub fn found(tiling_key: impl Into<String>, config: TilingConfig, metric: f64) -> Self {
        Self {
            best_config: Some(config),
            best_metric: Some(metric),
            tiling_key: tiling_key.into(),
        }
    }

    /// Strict improvement: replaces the current best only on a strictly
    /// lower metric, so ties keep the first result found.
    pub fn improves_on(&self, metric: f64) -> bool {
        match self.best_metric {
            Some(best) => metric < best,
            None => true,
        }
    }
}
