//! End-to-end optimization session.
//!
//! The session drives the whole run: compile the model once with
//! default tiling, enumerate and filter its layers, hand them to the
//! scheduler against the real toolchain, then emit the result tables
//! and recompile with the winning tiling assignment.

use crate::extract;
use crate::runner::ProcessTrialRunner;
use crate::simulate::Simulator;
use crate::toolchain::Toolchain;
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tilescout_model::OptimizationResult;
use tilescout_scheduler::{Scheduler, SchedulerOptions};
use tilescout_state::{CheckpointStore, SimilarityCache};
use tracing::{error, info, warn};

const DEFAULT_EXPERIMENT: &str = "default";
const OPTIMIZED_EXPERIMENT: &str = "optimized_tiling";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model_path: PathBuf,
    pub config_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub sim_path: PathBuf,
    /// Metric column to minimize, e.g. `totCycles` or `totTime(us)`.
    pub metric: String,
    /// Optional layer-name substrings restricting the run.
    pub layer_patterns: Vec<String>,
    /// Optional operation types restricting the run.
    pub operation_types: Vec<String>,
    pub max_configs_per_layer: i64,
    pub compile_retries: u32,
    pub sim_retries: u32,
    pub max_workers: Option<usize>,
    pub admission_limit: usize,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_interval: Duration,
    pub enable_caching: bool,
    pub cache_dir: PathBuf,
    pub clear_cache: bool,
}

pub struct OptimizeSession {
    options: SessionOptions,
    toolchain: Toolchain,
}

impl OptimizeSession {
    pub fn new(options: SessionOptions) -> Self {
        let mut toolchain = Toolchain::new(&options.model_path, &options.output_dir);
        toolchain.config_path = options.config_path.clone();
        toolchain.max_retries = options.compile_retries;
        Self { options, toolchain }
    }

    pub fn run(&self) -> Result<()> {
        let started = Instant::now();
        let model_name = self.toolchain.model_name();
        info!(model = %model_name, "starting optimization");

        if self.options.max_configs_per_layer < 0 {
            info!("running in exhaustive mode; all possible tiling configurations will be tried");
        } else {
            info!(
                max_configs = self.options.max_configs_per_layer,
                "running with bounded configurations per layer"
            );
        }

        let mut cache = if self.options.enable_caching {
            info!(cache_dir = %self.options.cache_dir.display(), "layer similarity caching enabled");
            let mut cache = SimilarityCache::open(model_name.as_str(), &self.options.cache_dir);
            if self.options.clear_cache {
                cache.clear();
                info!("cleared existing layer cache");
            }
            Some(cache)
        } else {
            info!("layer similarity caching disabled");
            None
        };

        info!("step 1: preparing and compiling model with default settings");
        self.toolchain.prepare()?;
        self.toolchain
            .compile(DEFAULT_EXPERIMENT, None)
            .context("initial compilation failed")?;

        info!("step 2: identifying layers to optimize");
        let default_dir = self.toolchain.artifact_dir(DEFAULT_EXPERIMENT);
        let all = extract::all_layers(&default_dir)?;
        let named = extract::filter_by_patterns(all, &self.options.layer_patterns);

        info!("step 3: extracting layer information");
        let mut layers = extract::extract_all(&default_dir, &named);
        if !self.options.operation_types.is_empty() {
            layers.retain(|layer| self.options.operation_types.contains(&layer.operation));
        }
        info!(layers = layers.len(), "layers selected for optimization");

        info!("step 4: optimizing layers");
        let mut simulator = Simulator::new(&self.options.sim_path);
        simulator.max_retries = self.options.sim_retries;
        let runner = Arc::new(ProcessTrialRunner::new(
            self.toolchain.clone(),
            simulator,
            self.options.metric.clone(),
        ));
        let mut checkpoint = CheckpointStore::new(model_name.as_str(), &self.options.checkpoint_dir)
            .with_save_interval(self.options.checkpoint_interval);
        let scheduler = Scheduler::new(SchedulerOptions {
            max_configs_per_layer: self.options.max_configs_per_layer,
            workers: self.options.max_workers,
            admission_limit: self.options.admission_limit,
            ..SchedulerOptions::default()
        });
        let results = scheduler.run(&layers, runner, cache.as_mut(), &mut checkpoint)?;

        info!("step 5: building final tiling configuration");
        let final_tiling = build_final_tiling_config(&results);

        info!("step 6: saving optimization results");
        let results_path = format!("{model_name}_tiling_optimization_results.json");
        if let Err(err) = fs::write(&results_path, serde_json::to_string_pretty(&results)?) {
            warn!(path = %results_path, error = %err, "failed to write results file");
        }
        let tiling_path = format!("{model_name}_optimal_tiling.json");
        if let Err(err) = fs::write(&tiling_path, serde_json::to_string_pretty(&final_tiling)?) {
            warn!(path = %tiling_path, error = %err, "failed to write tiling file");
        }

        info!("step 7: compiling model with optimal tiling configuration");
        match self.toolchain.compile(OPTIMIZED_EXPERIMENT, Some(&final_tiling)) {
            Ok(()) => info!(
                output = %self.toolchain.artifact_dir(OPTIMIZED_EXPERIMENT).display(),
                "compiled model with optimized tiling"
            ),
            Err(err) => {
                error!(error = %err, "failed to compile model with optimized tiling")
            }
        }

        info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            "optimization finished"
        );
        Ok(())
    }
}

/// Final tiling assignment covering every layer that improved:
/// `{tiling_key: {"1": best_config}}`.
pub fn build_final_tiling_config(
    results: &HashMap<String, OptimizationResult>,
) -> serde_json::Value {
    let mut final_config = serde_json::Map::new();
    for result in results.values() {
        if let Some(config) = &result.best_config {
            final_config.insert(result.tiling_key.clone(), json!({ "1": config }));
        }
    }
    serde_json::Value::Object(final_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilescout_model::DimMap;

    fn dims(pairs: &[(&str, u64)]) -> DimMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_final_tiling_skips_exhausted_layers() {
        let results = HashMap::from([
            (
                "conv1".to_string(),
                OptimizationResult::found("conv_1", dims(&[("OC", 8)]), 100.0),
            ),
            (
                "conv2".to_string(),
                OptimizationResult::exhausted("conv_2"),
            ),
        ]);
        let tiling = build_final_tiling_config(&results);
        assert_eq!(tiling["conv_1"]["1"]["OC"], 8);
        assert!(tiling.get("conv_2").is_none());
    }
}
