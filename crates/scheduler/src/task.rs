//! Trial tasks: one (layer, candidate) pair awaiting evaluation.

use std::sync::Arc;
use tilescout_model::{LayerDescriptor, TilingConfig};

/// Ephemeral unit of work; created and consumed within one run, never
/// persisted.
#[derive(Debug, Clone)]
pub struct TrialTask {
    pub layer_name: String,
    pub layer: Arc<LayerDescriptor>,
    pub config: TilingConfig,
    /// Position of this candidate within its layer's candidate list;
    /// also makes the experiment name unique per candidate.
    pub sequence_index: usize,
    pub total_for_layer: usize,
    /// Sum of the split factors. Cheap trials sort first so partial
    /// results arrive early under a tight time budget.
    pub complexity: u64,
}

impl TrialTask {
    pub fn new(
        layer: Arc<LayerDescriptor>,
        config: TilingConfig,
        sequence_index: usize,
        total_for_layer: usize,
    ) -> Self {
        let complexity = config.values().sum();
        Self {
            layer_name: layer.name.clone(),
            layer,
            config,
            sequence_index,
            total_for_layer,
            complexity,
        }
    }

    /// Unique experiment name for this trial's compile artifacts.
    pub fn experiment_name(&self) -> String {
        format!("{}_trial_{}", self.layer_name, self.sequence_index)
    }
}
