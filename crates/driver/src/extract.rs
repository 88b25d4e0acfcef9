//! Layer enumeration from compiled model output.
//!
//! A default compilation leaves one directory per layer, each holding a
//! `*_json.json` program description. The first program op carrying an
//! operation name and iterable dimensions describes the layer's
//! iteration space.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tilescout_model::{DimMap, LayerDescriptor};
use tracing::warn;

#[derive(Debug, Deserialize)]
struct ProgramFile {
    #[serde(default)]
    program: Vec<ProgramOp>,
}

#[derive(Debug, Deserialize)]
struct ProgramOp {
    operation: Option<String>,
    instance_id: Option<u64>,
    iterable_dimensions: Option<DimMap>,
    #[serde(default)]
    tile_splits: DimMap,
}

/// Names of all layer directories under the compiled output.
pub fn all_layers(output_dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(output_dir)
        .with_context(|| format!("output directory does not exist: {}", output_dir.display()))?;
    let mut layers: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    layers.sort();
    Ok(layers)
}

/// Keep layers whose name contains any of the given substrings. An
/// empty pattern list keeps everything.
pub fn filter_by_patterns(layers: Vec<String>, patterns: &[String]) -> Vec<String> {
    if patterns.is_empty() {
        return layers;
    }
    layers
        .into_iter()
        .filter(|layer| patterns.iter().any(|pattern| layer.contains(pattern)))
        .collect()
}

/// Build a [`LayerDescriptor`] from the layer's program description.
pub fn extract_layer(output_dir: &Path, layer_name: &str) -> Result<LayerDescriptor> {
    let layer_dir = output_dir.join(layer_name);
    let json_file = find_program_json(&layer_dir)?;
    let blob = fs::read_to_string(&json_file)
        .with_context(|| format!("failed to read {}", json_file.display()))?;
    let parsed: ProgramFile = serde_json::from_str(&blob)
        .with_context(|| format!("failed to decode {}", json_file.display()))?;

    for op in parsed.program {
        let (Some(operation), Some(dimensions)) = (op.operation, op.iterable_dimensions) else {
            continue;
        };
        return Ok(LayerDescriptor::new(
            layer_name,
            operation,
            op.instance_id.unwrap_or(1),
            dimensions,
        )
        .with_current_splits(op.tile_splits));
    }
    bail!(
        "no op with operation and iterable_dimensions in {}",
        json_file.display()
    );
}

/// Extract descriptors for every layer, skipping (and logging) the ones
/// whose program description cannot be read.
pub fn extract_all(output_dir: &Path, layers: &[String]) -> Vec<LayerDescriptor> {
    let mut descriptors = Vec::with_capacity(layers.len());
    for layer in layers {
        match extract_layer(output_dir, layer) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(err) => {
                warn!(layer = %layer, error = %err, "skipping layer; couldn't extract info");
            }
        }
    }
    descriptors
}

fn find_program_json(layer_dir: &Path) -> Result<std::path::PathBuf> {
    let entries = fs::read_dir(layer_dir)
        .with_context(|| format!("layer directory does not exist: {}", layer_dir.display()))?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with("_json.json"))
        })
        .with_context(|| format!("no JSON file found in {}", layer_dir.display()))
}
