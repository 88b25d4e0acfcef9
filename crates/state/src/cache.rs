//! Cross-layer similarity cache.
//!
//! Modern models repeat structurally identical layers under different
//! names; once one instance is optimized, its siblings can reuse the
//! result without touching the compiler or simulator. Similarity is a
//! structural fingerprint over operation type and dimension extents;
//! the instance id is excluded by design so repeated blocks collapse to
//! one entry.

use crate::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tilescout_model::{LayerDescriptor, OptimizationResult, TilingConfig};
use tracing::{debug, error, info, warn};

/// Fingerprint-keyed table of optimization results, persisted per model.
pub struct SimilarityCache {
    model_name: String,
    cache_file: PathBuf,
    entries: HashMap<String, OptimizationResult>,
}

/// Canonical form hashed into the fingerprint. Dimensions are re-keyed
/// through a `BTreeMap` so insertion order cannot leak into the hash.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    operation: &'a str,
    dimensions: BTreeMap<&'a str, u64>,
}

impl SimilarityCache {
    /// Open (or create) the cache for `model_name` under `cache_dir`,
    /// loading any existing table. A missing or corrupt file starts
    /// empty; it is never fatal.
    pub fn open(model_name: impl Into<String>, cache_dir: impl AsRef<Path>) -> Self {
        let model_name = model_name.into();
        let cache_file = cache_dir
            .as_ref()
            .join(format!("{model_name}_layer_cache.json"));

        let entries = match fs::read_to_string(&cache_file) {
            Ok(blob) => match serde_json::from_str::<HashMap<String, OptimizationResult>>(&blob) {
                Ok(entries) => {
                    info!(entries = entries.len(), "loaded layer cache");
                    entries
                }
                Err(err) => {
                    warn!(error = %err, "layer cache is corrupt; starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            model_name,
            cache_file,
            entries,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Structural fingerprint over `{operation, dimensions}`. Stable
    /// across dimension insertion orders and across layer names and
    /// instance ids.
    pub fn fingerprint(layer: &LayerDescriptor) -> String {
        let input = FingerprintInput {
            operation: &layer.operation,
            dimensions: layer
                .dimensions
                .iter()
                .map(|(name, &size)| (name.as_str(), size))
                .collect(),
        };
        let canonical =
            serde_json::to_string(&input).expect("fingerprint input always serializes");
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Cached result for a structurally identical layer, if any.
    pub fn lookup(&self, layer: &LayerDescriptor) -> Option<&OptimizationResult> {
        let fingerprint = Self::fingerprint(layer);
        match self.entries.get(&fingerprint) {
            Some(entry) => {
                info!(layer = %layer.name, fingerprint = %fingerprint, "cache hit");
                Some(entry)
            }
            None => {
                debug!(layer = %layer.name, fingerprint = %fingerprint, "cache miss");
                None
            }
        }
    }

    /// Whether a cached configuration is usable for `layer`: every
    /// cached dimension must exist there and no split may exceed its
    /// extent. The fingerprint already encodes exact extents, so this is
    /// a safety net against collisions or stale entries, not a primary
    /// mechanism.
    pub fn validate_for(config: &TilingConfig, layer: &LayerDescriptor) -> bool {
        config.iter().all(|(dim, &split)| {
            layer
                .dimensions
                .get(dim.as_str())
                .is_some_and(|&size| split <= size)
        })
    }

    /// Insert or overwrite the entry for `layer`, then durably persist
    /// the whole table. A failed write is logged and the in-memory
    /// entry kept.
    pub fn store(&mut self, layer: &LayerDescriptor, result: OptimizationResult) {
        self.entries.insert(Self::fingerprint(layer), result);
        if let Err(err) = write_json_atomic(&self.cache_file, &self.entries) {
            error!(error = %err, path = %self.cache_file.display(), "failed to save layer cache");
        } else {
            debug!(entries = self.entries.len(), "layer cache saved");
        }
    }

    /// Empty the table and remove the persisted file. Idempotent when
    /// no file exists.
    pub fn clear(&mut self) {
        self.entries.clear();
        match fs::remove_file(&self.cache_file) {
            Ok(()) => info!("layer cache file cleared"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => error!(error = %err, "failed to delete layer cache file"),
        }
    }
}
