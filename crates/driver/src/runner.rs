//! `TrialRunner` over the external compiler and simulator.

use crate::simulate::Simulator;
use crate::toolchain::Toolchain;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tilescout_model::{LayerDescriptor, TilingConfig};
use tilescout_scheduler::TrialRunner;

/// Evaluates trials by invoking the real toolchain: compile the model
/// with the candidate tiling pinned, then simulate the artifact and
/// pull the requested metric out of the results.
pub struct ProcessTrialRunner {
    toolchain: Toolchain,
    simulator: Simulator,
    metric: String,
}

impl ProcessTrialRunner {
    pub fn new(toolchain: Toolchain, simulator: Simulator, metric: impl Into<String>) -> Self {
        Self {
            toolchain,
            simulator,
            metric: metric.into(),
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }
}

impl TrialRunner for ProcessTrialRunner {
    fn compile_trial(
        &self,
        layer: &LayerDescriptor,
        config: &TilingConfig,
        experiment: &str,
    ) -> Result<PathBuf> {
        let tiling = Toolchain::trial_tiling(layer, config);
        self.toolchain.compile(experiment, Some(&tiling))?;
        Ok(self.toolchain.artifact_dir(experiment))
    }

    fn measure_trial(&self, artifact_dir: &Path, layer_name: &str) -> Result<Option<f64>> {
        let Some(metrics) = self.simulator.run(artifact_dir, layer_name)? else {
            return Ok(None);
        };
        Ok(metrics.get(&self.metric).copied())
    }
}
