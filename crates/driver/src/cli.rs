//! CLI wiring for the tilescout optimizer.

use crate::session::{OptimizeSession, SessionOptions};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "tilescout",
    about = "Optimize tiling splits for a neural-network model"
)]
pub struct Cli {
    /// Path to the model file.
    #[arg(long)]
    pub model_path: PathBuf,

    /// Performance metric to optimize (e.g. totCycles or totTime(us)).
    #[arg(long, default_value = "totCycles")]
    pub metric: String,

    /// Output directory for compilation results.
    #[arg(long, default_value = "compiler_output")]
    pub output_dir: PathBuf,

    /// Optional hardware configuration passed to the compiler.
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Path to the simulator installation.
    #[arg(long)]
    pub sim_path: PathBuf,

    /// Specific layers to optimize, matched by substring.
    #[arg(long, num_args = 0..)]
    pub layers: Vec<String>,

    /// Maximum configurations to test per layer (-1 for exhaustive).
    #[arg(long, default_value_t = 10)]
    pub max_configs_per_layer: i64,

    /// Try all possible tiling configurations
    /// (same as --max-configs-per-layer -1).
    #[arg(long, default_value_t = false)]
    pub exhaustive: bool,

    /// Operation types to optimize.
    #[arg(long, num_args = 0..)]
    pub operation_types: Vec<String>,

    /// Compilation retry attempts for transient errors.
    #[arg(long, default_value_t = 3)]
    pub compile_retries: u32,

    /// Simulator retry attempts for transient errors.
    #[arg(long, default_value_t = 2)]
    pub sim_retries: u32,

    /// Worker threads (default: host CPU count).
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Cap on concurrently running compiler/simulator processes.
    #[arg(long, default_value_t = 4)]
    pub max_parallel_tools: usize,

    /// Directory for checkpoint files.
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Seconds between unforced checkpoint saves.
    #[arg(long, default_value_t = 300)]
    pub checkpoint_interval: u64,

    /// Disable result reuse across structurally identical layers.
    #[arg(long, default_value_t = false)]
    pub disable_caching: bool,

    /// Directory for layer cache files.
    #[arg(long, default_value = "layer_cache")]
    pub cache_dir: PathBuf,

    /// Clear the layer cache before starting.
    #[arg(long, default_value_t = false)]
    pub clear_cache: bool,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn into_session_options(self) -> SessionOptions {
        let max_configs = if self.exhaustive {
            -1
        } else {
            self.max_configs_per_layer
        };
        SessionOptions {
            model_path: self.model_path,
            config_path: self.config_path,
            output_dir: self.output_dir,
            sim_path: self.sim_path,
            metric: self.metric,
            layer_patterns: self.layers,
            operation_types: self.operation_types,
            max_configs_per_layer: max_configs,
            compile_retries: self.compile_retries,
            sim_retries: self.sim_retries,
            max_workers: self.max_workers,
            admission_limit: self.max_parallel_tools,
            checkpoint_dir: self.checkpoint_dir,
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval),
            enable_caching: !self.disable_caching,
            cache_dir: self.cache_dir,
            clear_cache: self.clear_cache,
        }
    }
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let session = OptimizeSession::new(cli.into_session_options());
    session.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustive_flag_overrides_budget() {
        let cli = Cli::parse_from([
            "tilescout",
            "--model-path",
            "m.onnx",
            "--sim-path",
            "/sim",
            "--exhaustive",
        ]);
        let options = cli.into_session_options();
        assert_eq!(options.max_configs_per_layer, -1);
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["tilescout", "--model-path", "m.onnx", "--sim-path", "/sim"]);
        assert_eq!(cli.metric, "totCycles");
        assert_eq!(cli.max_configs_per_layer, 10);
        assert!(!cli.disable_caching);
        let options = cli.into_session_options();
        assert!(options.enable_caching);
        assert_eq!(options.checkpoint_interval, Duration::from_secs(300));
    }
}
