//! Cycle-simulator subprocess adapter.
//!
//! The simulator runs out of its own installation directory, reads a
//! compiled artifact directory, and appends per-layer performance rows
//! to a results CSV. The compiler may still be flushing artifacts when
//! a trial reaches this point, so measurement first waits for the
//! artifact directory with a capped exponential backoff; running out
//! the timeout is a normal failure of that one trial, not of the run.

use crate::toolchain::format_command;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_SIM_CMD: &str = "cycle-sim";

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Simulator {
    pub sim_cmd: String,
    /// Simulator installation directory; used as the working directory
    /// and the location of the results file.
    pub sim_path: PathBuf,
    pub max_retries: u32,
}

impl Simulator {
    pub fn new(sim_path: impl Into<PathBuf>) -> Self {
        Self {
            sim_cmd: DEFAULT_SIM_CMD.into(),
            sim_path: sim_path.into(),
            max_retries: 2,
        }
    }

    /// Simulate `artifact_dir` and return the metrics row for
    /// `layer_name`, or `None` when simulation or parsing fails after
    /// all retries.
    pub fn run(&self, artifact_dir: &Path, layer_name: &str) -> Result<Option<HashMap<String, f64>>> {
        if !self.sim_path.exists() {
            bail!("simulator path does not exist: {}", self.sim_path.display());
        }
        if !wait_for_dir(artifact_dir, READY_TIMEOUT) {
            warn!(
                artifact_dir = %artifact_dir.display(),
                "artifact directory never appeared; dropping trial"
            );
            return Ok(None);
        }

        let dir_name = artifact_dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("artifact");
        let results_file = format!("{dir_name}_simulation_results.csv");

        let attempts = self.max_retries.max(1);
        for attempt in 1..=attempts {
            let mut cmd = Command::new(&self.sim_cmd);
            cmd.arg("configs/")
                .arg(artifact_dir)
                .args(["--mode", "perf", "--log_path", &results_file])
                .current_dir(&self.sim_path);
            info!(
                attempt,
                max_attempts = attempts,
                command = %format_command(&cmd),
                "running simulator"
            );

            let output = match cmd.output() {
                Ok(output) => output,
                Err(err) => {
                    error!(error = %err, "failed to spawn simulator");
                    continue;
                }
            };
            if !output.status.success() {
                error!(
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "simulator exited with error"
                );
                continue;
            }

            let results_path = self.sim_path.join(&results_file);
            let content = match std::fs::read_to_string(&results_path) {
                Ok(content) => content,
                Err(err) => {
                    error!(
                        path = %results_path.display(),
                        error = %err,
                        "simulation results file not readable"
                    );
                    continue;
                }
            };

            if let Some(metrics) = parse_results(&content, layer_name) {
                info!(layer = %layer_name, metrics = ?metrics, "found metrics for layer");
                return Ok(Some(metrics));
            }
            error!(layer = %layer_name, "failed to parse metrics for layer");
        }

        warn!(
            layer = %layer_name,
            attempts,
            "simulation produced no usable metrics"
        );
        Ok(None)
    }
}

/// Wait for a directory to exist, sleeping with a capped exponential
/// backoff. Returns whether the directory appeared within `timeout`.
pub fn wait_for_dir(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut backoff = BACKOFF_START;
    loop {
        if path.is_dir() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        debug!(path = %path.display(), backoff_ms = backoff.as_millis() as u64, "waiting for artifact directory");
        thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

/// Parse the metrics row for `layer_name` out of the simulator CSV.
///
/// Newer simulator builds emit a header row; older ones emit bare rows
/// of the form `Layer1,Conv,<6 fields>,totCycles,totTime`. Only
/// numeric columns are kept.
fn parse_results(content: &str, layer_name: &str) -> Option<HashMap<String, f64>> {
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let first = lines.next()?;

    let first_fields: Vec<&str> = first.split(',').map(str::trim).collect();
    let has_header =
        !first.trim_start().starts_with('#') && first_fields[0].parse::<f64>().is_err() && {
            // A header names the layer column; a legacy data row starts
            // with the layer id itself.
            matches!(
                first_fields[0],
                "Layer" | "LayerName" | "Name"
            ) || first_fields.iter().any(|f| *f == "totCycles")
        };

    if has_header {
        let headers = first_fields;
        for line in lines {
            let values: Vec<&str> = line.split(',').map(str::trim).collect();
            if values.len() != headers.len() {
                continue;
            }
            let row: HashMap<&str, &str> = headers.iter().copied().zip(values).collect();
            let layer_id = row
                .get("Layer")
                .or_else(|| row.get("LayerName"))
                .or_else(|| row.get("Name"));
            let Some(layer_id) = layer_id else { continue };
            if !layer_id.contains(layer_name) {
                continue;
            }
            let metrics: HashMap<String, f64> = row
                .iter()
                .filter_map(|(key, value)| {
                    value.parse::<f64>().ok().map(|v| (key.to_string(), v))
                })
                .collect();
            return Some(metrics);
        }
        return None;
    }

    // Legacy headerless format: match the layer row and take the last
    // two numeric fields as cycles and time.
    for line in std::iter::once(first).chain(lines) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            continue;
        }
        let id = fields[0];
        let matches_layer = id.contains(layer_name)
            || (id.starts_with("Layer") && id[5..].chars().all(|c| c.is_ascii_digit()));
        if !matches_layer {
            continue;
        }
        let numeric: Vec<f64> = fields[2..]
            .iter()
            .filter_map(|f| f.parse::<f64>().ok())
            .collect();
        if numeric.len() < 2 {
            continue;
        }
        let mut metrics = HashMap::new();
        metrics.insert("totCycles".to_string(), numeric[numeric.len() - 2]);
        metrics.insert("totTime(us)".to_string(), numeric[numeric.len() - 1]);
        return Some(metrics);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_header_format() {
        let csv = "\
Layer,Operation,totCycles,totTime(us)
conv1_layer,Conv,1848.0,1.848
gemm1_layer,Gemm,902.0,0.902
";
        let metrics = parse_results(csv, "gemm1").unwrap();
        assert_eq!(metrics.get("totCycles"), Some(&902.0));
        assert_eq!(metrics.get("totTime(us)"), Some(&0.902));
    }

    #[test]
    fn test_parse_legacy_format() {
        let csv = "Layer1,Conv,28.0,28.0,12.0,6.0,6.0,12.0,1848.0,1.848\n";
        let metrics = parse_results(csv, "conv1").unwrap();
        assert_eq!(metrics.get("totCycles"), Some(&1848.0));
        assert_eq!(metrics.get("totTime(us)"), Some(&1.848));
    }

    #[test]
    fn test_missing_layer_row_is_none() {
        let csv = "\
Layer,Operation,totCycles,totTime(us)
conv1_layer,Conv,1848.0,1.848
";
        assert!(parse_results(csv, "pool7").is_none());
    }

    #[test]
    fn test_empty_results_is_none() {
        assert!(parse_results("", "conv1").is_none());
        assert!(parse_results("\n\n", "conv1").is_none());
    }

    #[test]
    fn test_wait_for_dir_immediate_and_timeout() {
        let dir = TempDir::new().unwrap();
        assert!(wait_for_dir(dir.path(), Duration::from_millis(10)));
        assert!(!wait_for_dir(
            &dir.path().join("never"),
            Duration::from_millis(50)
        ));
    }
}
