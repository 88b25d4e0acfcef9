//! The external collaborator seam for trial evaluation.

use std::path::{Path, PathBuf};
use tilescout_model::{LayerDescriptor, TilingConfig};

/// Compiles and measures one candidate tiling.
///
/// Implementations wrap the external model compiler and cycle
/// simulator. Retry and backoff policy belongs behind this trait; the
/// scheduler never retries a trial, it only skips failures.
pub trait TrialRunner: Send + Sync {
    /// Compile `layer` with `config` under a unique experiment name and
    /// return the artifact location. Artifacts must never be reused
    /// across different candidates.
    fn compile_trial(
        &self,
        layer: &LayerDescriptor,
        config: &TilingConfig,
        experiment: &str,
    ) -> anyhow::Result<PathBuf>;

    /// Measure the compiled artifact and return the scalar metric for
    /// `layer_name`, or `None` when the artifact is unmeasurable.
    fn measure_trial(&self, artifact_dir: &Path, layer_name: &str) -> anyhow::Result<Option<f64>>;
}

/// Completed-trial outcome flowing from workers to the aggregation
/// stage. A `None` metric records a dropped trial.
#[derive(Debug)]
pub struct TrialOutcome {
    pub layer_name: String,
    pub config: TilingConfig,
    pub metric: Option<f64>,
}
