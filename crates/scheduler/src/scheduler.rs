//! The optimization run: task expansion, dispatch, and aggregation.
//!
//! Workers share a task queue and push outcomes over a channel to a
//! single aggregation stage, the only place the best-results table,
//! checkpoint, and cache are mutated. Within a layer the best result is
//! the minimum observed metric regardless of completion order; the
//! complexity-ascending global task order is a scheduling heuristic,
//! not a correctness requirement.

use crate::semaphore::Semaphore;
use crate::task::TrialTask;
use crate::trial::{TrialOutcome, TrialRunner};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tilescout_model::{LayerDescriptor, OptimizationResult, Result};
use tilescout_search::{estimate_trial_count, generate_bounded};
use tilescout_state::{CheckpointStore, SimilarityCache};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Candidate budget per layer; negative runs the exhaustive search.
    pub max_configs_per_layer: i64,
    /// Worker-pool size; `None` derives it from the host CPU count.
    pub workers: Option<usize>,
    /// Global cap on concurrently in-flight compile/measure
    /// invocations, independent of worker-pool size.
    pub admission_limit: usize,
    /// Aggregation timer tick driving interval-limited checkpoint
    /// saves while long trials are in flight.
    pub checkpoint_tick: Duration,
    /// Force a checkpoint write on every improvement rather than
    /// rate-limiting it to the save interval.
    pub force_checkpoint_on_improvement: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_configs_per_layer: 10,
            workers: None,
            admission_limit: 4,
            checkpoint_tick: Duration::from_secs(30),
            force_checkpoint_on_improvement: true,
        }
    }
}

pub struct Scheduler {
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self { options }
    }

    /// Drive every layer's search to completion and return a result for
    /// each one. Layers for which no candidate produced a usable metric
    /// are present with absent best fields, never omitted.
    pub fn run(
        &self,
        layers: &[LayerDescriptor],
        runner: Arc<dyn TrialRunner>,
        mut cache: Option<&mut SimilarityCache>,
        checkpoint: &mut CheckpointStore,
    ) -> Result<HashMap<String, OptimizationResult>> {
        let completed = checkpoint.load();

        let mut results: HashMap<String, OptimizationResult> = HashMap::new();
        let mut pending: Vec<&LayerDescriptor> = Vec::new();
        for layer in layers {
            match completed.get(&layer.name) {
                Some(result) => {
                    debug!(layer = %layer.name, "already completed in checkpoint; skipping");
                    results.insert(layer.name.clone(), result.clone());
                }
                None => {
                    results.insert(
                        layer.name.clone(),
                        OptimizationResult::exhausted(layer.tiling_key()),
                    );
                    pending.push(layer);
                }
            }
        }
        info!(
            total = layers.len(),
            resumed = layers.len() - pending.len(),
            "optimization run starting"
        );

        // Structurally identical layers reuse earlier results without a
        // single compile or simulation.
        if let Some(cache) = cache.as_mut() {
            pending.retain(|layer| {
                let Some(hit) = cache.lookup(layer) else {
                    return true;
                };
                let usable = hit
                    .best_config
                    .as_ref()
                    .is_some_and(|config| SimilarityCache::validate_for(config, layer));
                if !usable {
                    info!(
                        layer = %layer.name,
                        "cached configuration is not valid for this layer; searching"
                    );
                    return true;
                }
                info!(layer = %layer.name, "reusing cached result from a similar layer");
                let adopted = OptimizationResult {
                    best_config: hit.best_config.clone(),
                    best_metric: hit.best_metric,
                    tiling_key: layer.tiling_key(),
                };
                checkpoint.record_result(
                    &layer.name,
                    adopted.clone(),
                    self.options.force_checkpoint_on_improvement,
                );
                results.insert(layer.name.clone(), adopted);
                false
            });
        }

        let tasks = self.expand_tasks(&pending)?;
        info!(tasks = tasks.len(), layers = pending.len(), "trial queue built");

        if !tasks.is_empty() {
            self.dispatch(tasks, Arc::clone(&runner), &mut results, checkpoint);
        }

        // The run always ends with a durable checkpoint, even when every
        // trial failed.
        checkpoint.save(true);

        if let Some(cache) = cache.as_mut() {
            let by_name: HashMap<&str, &LayerDescriptor> =
                layers.iter().map(|l| (l.name.as_str(), l)).collect();
            for (name, result) in &results {
                if result.best_config.is_some() {
                    if let Some(layer) = by_name.get(name.as_str()) {
                        cache.store(layer, result.clone());
                    }
                }
            }
        }

        Ok(results)
    }

    /// Candidate expansion: group layers by operation, schedule the
    /// largest estimated group first, then order every task ascending
    /// by complexity so inexpensive trials land early regardless of
    /// layer. Ties keep group order (stable sort).
    fn expand_tasks(&self, pending: &[&LayerDescriptor]) -> Result<Vec<TrialTask>> {
        let max_configs = self.options.max_configs_per_layer;

        let mut group_order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<&LayerDescriptor>> = HashMap::new();
        for layer in pending {
            if !groups.contains_key(layer.operation.as_str()) {
                group_order.push(&layer.operation);
            }
            groups.entry(&layer.operation).or_default().push(layer);
        }

        let mut estimates: HashMap<&str, u64> = HashMap::new();
        for (&op, members) in &groups {
            let estimate = members
                .iter()
                .map(|layer| estimate_trial_count(layer, max_configs))
                .sum();
            estimates.insert(op, estimate);
        }
        group_order.sort_by_key(|op| std::cmp::Reverse(estimates[op]));

        let approx_total: u64 = estimates.values().sum();
        info!(approx_total, "total configurations to test (approximate)");

        let mut tasks = Vec::new();
        for op in &group_order {
            debug!(
                operation = %op,
                estimated_trials = estimates[op],
                "expanding operation group"
            );
            for layer in &groups[op] {
                let candidates = generate_bounded(layer, max_configs)?;
                info!(
                    layer = %layer.name,
                    candidates = candidates.len(),
                    "testing tiling configurations"
                );
                let shared = Arc::new((*layer).clone());
                let total = candidates.len();
                for (index, config) in candidates.into_iter().enumerate() {
                    tasks.push(TrialTask::new(Arc::clone(&shared), config, index, total));
                }
            }
        }
        tasks.sort_by_key(|task| task.complexity);
        Ok(tasks)
    }

    /// Worker pool plus the single aggregation stage. Returns once the
    /// task queue is drained and every outcome has been consumed.
    fn dispatch(
        &self,
        tasks: Vec<TrialTask>,
        runner: Arc<dyn TrialRunner>,
        results: &mut HashMap<String, OptimizationResult>,
        checkpoint: &mut CheckpointStore,
    ) {
        let worker_count = self
            .options
            .workers
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .min(tasks.len())
            .max(1);
        info!(workers = worker_count, "dispatching trial tasks");

        let queue = Mutex::new(VecDeque::from(tasks));
        let admission = Semaphore::new(self.options.admission_limit);
        let (tx, rx) = mpsc::channel::<TrialOutcome>();

        thread::scope(|scope| {
            for _ in 0..worker_count {
                let tx = tx.clone();
                let queue = &queue;
                let admission = &admission;
                let runner = runner.as_ref();
                scope.spawn(move || worker_loop(queue, admission, runner, tx));
            }
            // Workers hold the only remaining senders; their exit
            // disconnects the channel and ends aggregation.
            drop(tx);

            loop {
                match rx.recv_timeout(self.options.checkpoint_tick) {
                    Ok(outcome) => {
                        self.aggregate(outcome, results, checkpoint);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        // Bound checkpoint staleness under long trials.
                        checkpoint.save(false);
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
    }

    /// Keep the strictly lower metric per layer; ties keep the first
    /// result found. Replaying outcomes in any order converges to the
    /// same table.
    fn aggregate(
        &self,
        outcome: TrialOutcome,
        results: &mut HashMap<String, OptimizationResult>,
        checkpoint: &mut CheckpointStore,
    ) {
        let Some(metric) = outcome.metric else {
            return;
        };
        let Some(entry) = results.get_mut(&outcome.layer_name) else {
            warn!(layer = %outcome.layer_name, "outcome for unknown layer dropped");
            return;
        };
        if !entry.improves_on(metric) {
            return;
        }
        entry.best_config = Some(outcome.config);
        entry.best_metric = Some(metric);
        info!(
            layer = %outcome.layer_name,
            metric,
            "new best configuration"
        );
        checkpoint.record_result(
            &outcome.layer_name,
            entry.clone(),
            self.options.force_checkpoint_on_improvement,
        );
    }
}

/// One worker: pull tasks until the queue is empty, evaluate each under
/// an admission permit, and report the outcome. A send failure means
/// the aggregation stage is gone and the worker stops.
fn worker_loop(
    queue: &Mutex<VecDeque<TrialTask>>,
    admission: &Semaphore,
    runner: &dyn TrialRunner,
    tx: Sender<TrialOutcome>,
) {
    loop {
        let task = queue.lock().unwrap().pop_front();
        let Some(task) = task else {
            return;
        };
        let metric = {
            let _permit = admission.acquire();
            evaluate(runner, &task)
        };
        let outcome = TrialOutcome {
            layer_name: task.layer_name,
            config: task.config,
            metric,
        };
        if tx.send(outcome).is_err() {
            return;
        }
    }
}

/// Evaluate one trial. Any compile or measure failure is logged and the
/// trial dropped; never retried here, never fatal to the run.
fn evaluate(runner: &dyn TrialRunner, task: &TrialTask) -> Option<f64> {
    let experiment = task.experiment_name();
    info!(
        layer = %task.layer_name,
        trial = task.sequence_index + 1,
        total = task.total_for_layer,
        config = ?task.config,
        "testing configuration"
    );

    let artifact_dir = match runner.compile_trial(&task.layer, &task.config, &experiment) {
        Ok(dir) => dir,
        Err(err) => {
            warn!(
                layer = %task.layer_name,
                experiment = %experiment,
                error = %err,
                "compilation failed; dropping trial"
            );
            return None;
        }
    };

    match runner.measure_trial(&artifact_dir, &task.layer_name) {
        Ok(Some(metric)) => Some(metric),
        Ok(None) => {
            warn!(
                layer = %task.layer_name,
                experiment = %experiment,
                "no usable metric; dropping trial"
            );
            None
        }
        Err(err) => {
            warn!(
                layer = %task.layer_name,
                experiment = %experiment,
                error = %err,
                "measurement failed; dropping trial"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilescout_model::DimMap;

    fn dims(pairs: &[(&str, u64)]) -> DimMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_tasks_sorted_by_complexity_then_group_size() {
        // Two conv layers and one gemm layer, all over a single
        // two-extent dimension, so every layer contributes tasks with
        // complexities 1 and 2. The conv group has the larger trial
        // estimate and must come first among equal complexities.
        let conv_a = LayerDescriptor::new("conv_a", "conv", 1, dims(&[("A", 2)]));
        let conv_b = LayerDescriptor::new("conv_b", "conv", 2, dims(&[("A", 2)]));
        let gemm_a = LayerDescriptor::new("gemm_a", "gemm", 1, dims(&[("B", 2)]));

        let scheduler = Scheduler::new(SchedulerOptions {
            max_configs_per_layer: -1,
            ..SchedulerOptions::default()
        });
        let pending = vec![&gemm_a, &conv_a, &conv_b];
        let tasks = scheduler.expand_tasks(&pending).unwrap();

        let order: Vec<(&str, u64)> = tasks
            .iter()
            .map(|task| (task.layer_name.as_str(), task.complexity))
            .collect();
        assert_eq!(
            order,
            vec![
                ("conv_a", 1),
                ("conv_b", 1),
                ("gemm_a", 1),
                ("conv_a", 2),
                ("conv_b", 2),
                ("gemm_a", 2),
            ]
        );
    }

    #[test]
    fn test_invalid_extent_escalates() {
        let broken = LayerDescriptor::new("broken", "conv", 1, dims(&[("A", 0)]));
        let scheduler = Scheduler::new(SchedulerOptions::default());
        let pending = vec![&broken];
        assert!(scheduler.expand_tasks(&pending).is_err());
    }
}
