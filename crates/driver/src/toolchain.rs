//! Model-compiler subprocess adapter.
//!
//! The compiler is an opaque external tool: given a model, an
//! experiment name, and an optional tiling assignment file, it leaves
//! per-layer artifacts under `<output_dir>/<model>_<experiment>/`.
//! Transient failures are retried here; the scheduler above never
//! retries.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tilescout_model::{LayerDescriptor, TilingConfig};
use tracing::{error, info};

pub const DEFAULT_PREPARE_CMD: &str = "prepare-model";
pub const DEFAULT_COMPILE_CMD: &str = "compile-model";

#[derive(Debug, Clone)]
pub struct Toolchain {
    pub prepare_cmd: String,
    pub compile_cmd: String,
    pub model_path: PathBuf,
    pub config_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Where per-experiment tiling assignment files are written.
    pub tiling_dir: PathBuf,
    pub max_retries: u32,
}

impl Toolchain {
    pub fn new(model_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            prepare_cmd: DEFAULT_PREPARE_CMD.into(),
            compile_cmd: DEFAULT_COMPILE_CMD.into(),
            model_path: model_path.into(),
            config_path: None,
            output_dir: output_dir.into(),
            tiling_dir: PathBuf::from("tiling_config"),
            max_retries: 3,
        }
    }

    pub fn model_name(&self) -> String {
        self.model_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("model")
            .to_string()
    }

    /// Where the compiler leaves this experiment's artifacts.
    pub fn artifact_dir(&self, experiment: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}", self.model_name(), experiment))
    }

    /// One-time model preparation before the first compile.
    pub fn prepare(&self) -> Result<()> {
        if !self.model_path.exists() {
            bail!("model path does not exist: {}", self.model_path.display());
        }
        let mut cmd = Command::new(&self.prepare_cmd);
        cmd.arg("-m").arg(&self.model_path);
        self.run_with_retries(cmd, "preparing the model")
    }

    /// Compile the model under `experiment`, optionally pinning a
    /// tiling assignment.
    pub fn compile(&self, experiment: &str, tiling: Option<&serde_json::Value>) -> Result<()> {
        if !self.model_path.exists() {
            bail!("model path does not exist: {}", self.model_path.display());
        }

        let mut cmd = Command::new(&self.compile_cmd);
        cmd.arg("-m").arg(&self.model_path);
        if let Some(config) = &self.config_path {
            cmd.arg("-c").arg(config);
        }
        cmd.arg("-e").arg(experiment);

        if let Some(tiling) = tiling {
            let tiling_file = self.write_tiling_file(experiment, tiling)?;
            cmd.arg("-t").arg(tiling_file);
        }

        self.run_with_retries(cmd, "compiling the model")
    }

    /// The per-layer wire format the compiler expects:
    /// `{tiling_key: {"1": {dim: split}}}`.
    pub fn trial_tiling(layer: &LayerDescriptor, config: &TilingConfig) -> serde_json::Value {
        json!({ layer.tiling_key(): { "1": config } })
    }

    fn write_tiling_file(&self, experiment: &str, tiling: &serde_json::Value) -> Result<PathBuf> {
        fs::create_dir_all(&self.tiling_dir)
            .with_context(|| format!("failed to create {}", self.tiling_dir.display()))?;
        let path = self.tiling_dir.join(format!("tiling_{experiment}.json"));
        fs::write(&path, serde_json::to_string_pretty(tiling)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    fn run_with_retries(&self, mut cmd: Command, what: &str) -> Result<()> {
        let attempts = self.max_retries.max(1);
        for attempt in 1..=attempts {
            info!(
                attempt,
                max_attempts = attempts,
                command = %format_command(&cmd),
                "{what}"
            );
            let output = cmd
                .output()
                .with_context(|| format!("failed to spawn {:?}", cmd.get_program()))?;
            if output.status.success() {
                return Ok(());
            }
            error!(
                attempt,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "{what} failed"
            );
        }
        bail!("{what} failed after {attempts} attempts");
    }
}

pub(crate) fn format_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tilescout_model::DimMap;

    fn dims(pairs: &[(&str, u64)]) -> DimMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_artifact_dir_layout() {
        let toolchain = Toolchain::new("/models/resnet18.onnx", "/tmp/out");
        assert_eq!(
            toolchain.artifact_dir("conv1_trial_0"),
            PathBuf::from("/tmp/out/resnet18_conv1_trial_0")
        );
    }

    #[test]
    fn test_trial_tiling_wire_format() {
        let layer = LayerDescriptor::new("conv1", "conv", 3, dims(&[("OC", 64)]));
        let tiling = Toolchain::trial_tiling(&layer, &dims(&[("OC", 8)]));
        assert_eq!(tiling["conv_3"]["1"]["OC"], 8);
    }

    #[test]
    fn test_missing_model_is_error() {
        let dir = TempDir::new().unwrap();
        let toolchain = Toolchain::new(dir.path().join("absent.onnx"), dir.path());
        assert!(toolchain.prepare().is_err());
        assert!(toolchain.compile("default", None).is_err());
    }

    #[test]
    fn test_tiling_file_written() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("m.onnx");
        fs::write(&model, "stub").unwrap();
        let mut toolchain = Toolchain::new(model, dir.path().join("out"));
        toolchain.tiling_dir = dir.path().join("tiling_config");
        // `true` exists everywhere and ignores its arguments.
        toolchain.compile_cmd = "true".into();
        toolchain.max_retries = 1;

        let layer = LayerDescriptor::new("conv1", "conv", 1, dims(&[("OC", 64)]));
        let tiling = Toolchain::trial_tiling(&layer, &dims(&[("OC", 8)]));
        toolchain.compile("conv1_trial_0", Some(&tiling)).unwrap();

        let written = dir
            .path()
            .join("tiling_config")
            .join("tiling_conv1_trial_0.json");
        let blob = fs::read_to_string(written).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed["conv_1"]["1"]["OC"], 8);
    }
}
