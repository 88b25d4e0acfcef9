//! Durable state for the tilescout optimizer: the cross-layer
//! similarity cache and the checkpoint store.

pub mod cache;
pub mod checkpoint;

pub use cache::SimilarityCache;
pub use checkpoint::CheckpointStore;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tilescout_model::Result;

/// Serialize `value` to `path` atomically: write a sibling `.tmp` file,
/// flush it, then rename over the destination. A reader never observes
/// a half-written table.
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    file.flush()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
