//! End-to-end scheduler behavior against a stub trial runner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tilescout_model::{DimMap, LayerDescriptor, TilingConfig};
use tilescout_scheduler::{Scheduler, SchedulerOptions, TrialRunner};
use tilescout_state::{CheckpointStore, SimilarityCache};

fn dims(pairs: &[(&str, u64)]) -> DimMap {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Deterministic stand-in for the compiler + simulator: the metric is a
/// fixed quadratic distance from a per-layer target split, so the
/// expected winner is known exactly.
struct StubRunner {
    targets: HashMap<String, DimMap>,
    fail_layers: Vec<String>,
    compiles: Mutex<HashMap<String, usize>>,
    artifacts: Mutex<HashMap<PathBuf, TilingConfig>>,
}

impl StubRunner {
    fn new(targets: HashMap<String, DimMap>) -> Self {
        Self {
            targets,
            fail_layers: Vec::new(),
            compiles: Mutex::new(HashMap::new()),
            artifacts: Mutex::new(HashMap::new()),
        }
    }

    fn failing(mut self, layer: &str) -> Self {
        self.fail_layers.push(layer.to_string());
        self
    }

    fn compile_count(&self, layer: &str) -> usize {
        self.compiles.lock().unwrap().get(layer).copied().unwrap_or(0)
    }
}

impl TrialRunner for StubRunner {
    fn compile_trial(
        &self,
        layer: &LayerDescriptor,
        config: &TilingConfig,
        experiment: &str,
    ) -> anyhow::Result<PathBuf> {
        *self
            .compiles
            .lock()
            .unwrap()
            .entry(layer.name.clone())
            .or_insert(0) += 1;
        if self.fail_layers.contains(&layer.name) {
            anyhow::bail!("toolchain rejected {experiment}");
        }
        let artifact = PathBuf::from("artifacts").join(experiment);
        self.artifacts
            .lock()
            .unwrap()
            .insert(artifact.clone(), config.clone());
        Ok(artifact)
    }

    fn measure_trial(&self, artifact_dir: &Path, layer_name: &str) -> anyhow::Result<Option<f64>> {
        let config = self
            .artifacts
            .lock()
            .unwrap()
            .get(artifact_dir)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown artifact {}", artifact_dir.display()))?;
        let Some(target) = self.targets.get(layer_name) else {
            return Ok(None);
        };
        let metric = config
            .iter()
            .map(|(dim, &split)| {
                let want = target.get(dim).copied().unwrap_or(1) as f64;
                (split as f64 - want).powi(2) * 10.0
            })
            .sum::<f64>()
            + 100.0;
        Ok(Some(metric))
    }
}

fn conv1() -> LayerDescriptor {
    LayerDescriptor::new("conv1", "conv", 1, dims(&[("H", 4), ("W", 2)]))
}

fn gemm1() -> LayerDescriptor {
    LayerDescriptor::new("gemm1", "gemm", 1, dims(&[("C", 8)]))
}

fn stub_targets() -> HashMap<String, DimMap> {
    HashMap::from([
        ("conv1".to_string(), dims(&[("H", 2), ("W", 1)])),
        ("gemm1".to_string(), dims(&[("C", 8)])),
    ])
}

fn exhaustive_options() -> SchedulerOptions {
    SchedulerOptions {
        max_configs_per_layer: -1,
        workers: Some(2),
        admission_limit: 2,
        ..SchedulerOptions::default()
    }
}

#[test]
fn end_to_end_selects_minimum_metric() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner::new(stub_targets()));
    let mut checkpoint = CheckpointStore::new("tinynet", dir.path());

    let layers = vec![conv1(), gemm1()];
    let results = Scheduler::new(exhaustive_options())
        .run(&layers, runner.clone(), None, &mut checkpoint)
        .unwrap();

    assert_eq!(results.len(), 2);
    let best_conv = &results["conv1"];
    assert_eq!(best_conv.best_config, Some(dims(&[("H", 2), ("W", 1)])));
    assert_eq!(best_conv.best_metric, Some(100.0));
    assert_eq!(best_conv.tiling_key, "conv_1");

    let best_gemm = &results["gemm1"];
    assert_eq!(best_gemm.best_config, Some(dims(&[("C", 8)])));
    assert_eq!(best_gemm.best_metric, Some(100.0));

    // Every candidate was actually tried: 3 * 2 for conv1, 4 for gemm1.
    assert_eq!(runner.compile_count("conv1"), 6);
    assert_eq!(runner.compile_count("gemm1"), 4);

    // The checkpoint on disk reflects both completions.
    let mut fresh = CheckpointStore::new("tinynet", dir.path());
    let persisted = fresh.load();
    assert_eq!(persisted.get("conv1"), Some(best_conv));
    assert_eq!(persisted.get("gemm1"), Some(best_gemm));
}

#[test]
fn failed_layer_is_present_with_absent_best() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner::new(stub_targets()).failing("conv1"));
    let mut checkpoint = CheckpointStore::new("tinynet", dir.path());

    let layers = vec![conv1(), gemm1()];
    let results = Scheduler::new(exhaustive_options())
        .run(&layers, runner, None, &mut checkpoint)
        .unwrap();

    let exhausted = &results["conv1"];
    assert!(exhausted.best_config.is_none());
    assert!(exhausted.best_metric.is_none());
    assert_eq!(exhausted.tiling_key, "conv_1");

    // The healthy layer still completed.
    assert!(results["gemm1"].best_config.is_some());
}

#[test]
fn resume_skips_completed_layers() {
    let dir = TempDir::new().unwrap();

    // First run covers conv1 only, then the host "goes down".
    let first = Arc::new(StubRunner::new(stub_targets()));
    let mut checkpoint = CheckpointStore::new("tinynet", dir.path());
    Scheduler::new(exhaustive_options())
        .run(&[conv1()], first, None, &mut checkpoint)
        .unwrap();

    // The restarted run sees both layers but must not re-enqueue
    // conv1's trials.
    let second = Arc::new(StubRunner::new(stub_targets()));
    let mut checkpoint = CheckpointStore::new("tinynet", dir.path());
    let resumed = Scheduler::new(exhaustive_options())
        .run(&[conv1(), gemm1()], second.clone(), None, &mut checkpoint)
        .unwrap();

    assert_eq!(second.compile_count("conv1"), 0);
    assert_eq!(second.compile_count("gemm1"), 4);

    // Identical to an uninterrupted run over both layers.
    let uninterrupted_dir = TempDir::new().unwrap();
    let third = Arc::new(StubRunner::new(stub_targets()));
    let mut checkpoint = CheckpointStore::new("tinynet", uninterrupted_dir.path());
    let uninterrupted = Scheduler::new(exhaustive_options())
        .run(&[conv1(), gemm1()], third, None, &mut checkpoint)
        .unwrap();
    assert_eq!(resumed, uninterrupted);
}

#[test]
fn structurally_identical_layer_reuses_cache() {
    let dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner::new(HashMap::from([(
        "conv1".to_string(),
        dims(&[("H", 2), ("W", 1)]),
    )])));

    let mut cache = SimilarityCache::open("tinynet", cache_dir.path());
    let mut checkpoint = CheckpointStore::new("tinynet", dir.path());
    Scheduler::new(exhaustive_options())
        .run(&[conv1()], runner.clone(), Some(&mut cache), &mut checkpoint)
        .unwrap();
    assert_eq!(runner.compile_count("conv1"), 6);

    // Same operation and dimensions under a different name and
    // instance id; the cached result short-circuits the whole search.
    let sibling = LayerDescriptor::new("conv9", "conv", 9, dims(&[("H", 4), ("W", 2)]));
    let sibling_dir = TempDir::new().unwrap();
    let mut checkpoint = CheckpointStore::new("tinynet", sibling_dir.path());
    let results = Scheduler::new(exhaustive_options())
        .run(
            std::slice::from_ref(&sibling),
            runner.clone(),
            Some(&mut cache),
            &mut checkpoint,
        )
        .unwrap();

    assert_eq!(runner.compile_count("conv9"), 0);
    let adopted = &results["conv9"];
    assert_eq!(adopted.best_config, Some(dims(&[("H", 2), ("W", 1)])));
    assert_eq!(adopted.best_metric, Some(100.0));
    // The tiling key addresses the new instance, not the cached one.
    assert_eq!(adopted.tiling_key, "conv_9");
}

#[test]
fn empty_layer_list_completes_with_empty_results() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner::new(HashMap::new()));
    let mut checkpoint = CheckpointStore::new("tinynet", dir.path());
    let results = Scheduler::new(SchedulerOptions::default())
        .run(&[], runner, None, &mut checkpoint)
        .unwrap();
    assert!(results.is_empty());
}
