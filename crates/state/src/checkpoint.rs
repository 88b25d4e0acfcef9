//! Durable checkpointing of per-layer optimization results.
//!
//! Layer completions are rare, expensive events; losing one to a crash
//! means redoing minutes of compile and simulation work. Results are
//! therefore saved immediately on improvement and the full table is
//! rewritten atomically so an interrupted write can never corrupt the
//! previous checkpoint.

use crate::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tilescout_model::OptimizationResult;
use tracing::{error, info, warn};

const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(60);
const ROTATE_EVERY: u64 = 10;
const MAX_BACKUPS: usize = 5;

/// On-disk checkpoint record; the authoritative resumable state of an
/// in-flight optimization run.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointRecord {
    model_name: String,
    timestamp: u64,
    date: String,
    completed_layers: usize,
    layer_results: HashMap<String, OptimizationResult>,
}

pub struct CheckpointStore {
    model_name: String,
    checkpoint_dir: PathBuf,
    checkpoint_file: PathBuf,
    backup_dir: PathBuf,
    layer_results: HashMap<String, OptimizationResult>,
    save_interval: Duration,
    last_save: Instant,
    saves: u64,
}

impl CheckpointStore {
    pub fn new(model_name: impl Into<String>, checkpoint_dir: impl AsRef<Path>) -> Self {
        let model_name = model_name.into();
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        let checkpoint_file = checkpoint_dir.join(format!("{model_name}_checkpoint.json"));
        let backup_dir = checkpoint_dir.join("backup");
        Self {
            model_name,
            checkpoint_dir,
            checkpoint_file,
            backup_dir,
            layer_results: HashMap::new(),
            save_interval: DEFAULT_SAVE_INTERVAL,
            last_save: Instant::now(),
            saves: 0,
        }
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.set_save_interval(interval);
        self
    }

    pub fn set_save_interval(&mut self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "checkpoint save interval set");
        self.save_interval = interval;
    }

    pub fn checkpoint_file(&self) -> &Path {
        &self.checkpoint_file
    }

    pub fn results(&self) -> &HashMap<String, OptimizationResult> {
        &self.layer_results
    }

    /// Load the latest checkpoint, adopting its layer results. A
    /// missing or unreadable file means "start fresh" and is never
    /// fatal.
    pub fn load(&mut self) -> HashMap<String, OptimizationResult> {
        let blob = match fs::read_to_string(&self.checkpoint_file) {
            Ok(blob) => blob,
            Err(_) => {
                info!("no checkpoint file found; starting fresh");
                return HashMap::new();
            }
        };

        match serde_json::from_str::<CheckpointRecord>(&blob) {
            Ok(record) => {
                info!(
                    completed_layers = record.layer_results.len(),
                    date = %record.date,
                    "loaded checkpoint"
                );
                self.layer_results = record.layer_results.clone();
                record.layer_results
            }
            Err(err) => {
                warn!(error = %err, "checkpoint file is corrupt; starting fresh");
                HashMap::new()
            }
        }
    }

    /// Record a completed layer and save immediately when `force` is
    /// set. Completions are too expensive to lose to an interval gate.
    pub fn record_result(&mut self, layer_name: &str, result: OptimizationResult, force: bool) {
        self.layer_results.insert(layer_name.to_string(), result);
        self.save(force);
    }

    /// Write the full table if forced or the save interval has elapsed.
    /// Cheap to call often; returns whether the on-disk state is
    /// current.
    pub fn save(&mut self, force: bool) -> bool {
        if self.layer_results.is_empty() && !force {
            return true;
        }
        if !force && self.last_save.elapsed() < self.save_interval {
            return true;
        }

        if self.saves % ROTATE_EVERY == 0 {
            self.rotate_backups();
        }

        let now = SystemTime::now();
        let record = CheckpointRecord {
            model_name: self.model_name.clone(),
            timestamp: now
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            date: humantime_date(now),
            completed_layers: self.layer_results.len(),
            layer_results: self.layer_results.clone(),
        };

        match write_json_atomic(&self.checkpoint_file, &record) {
            Ok(()) => {
                self.last_save = Instant::now();
                self.saves += 1;
                info!(
                    completed_layers = self.layer_results.len(),
                    "progress checkpoint saved"
                );
                true
            }
            Err(err) => {
                error!(error = %err, "failed to save checkpoint");
                false
            }
        }
    }

    /// Remove the checkpoint file. Idempotent when no file exists.
    pub fn clear(&mut self) {
        self.layer_results.clear();
        match fs::remove_file(&self.checkpoint_file) {
            Ok(()) => info!("checkpoint file cleared"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => error!(error = %err, "failed to delete checkpoint file"),
        }
    }

    /// Copy the current checkpoint into the backup directory with a
    /// timestamp suffix, pruning all but the most recent few.
    fn rotate_backups(&self) {
        if !self.checkpoint_file.exists() {
            return;
        }
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let backup_file = self
            .backup_dir
            .join(format!("{}_checkpoint_{stamp}.json", self.model_name));

        let rotate = || -> std::io::Result<()> {
            fs::create_dir_all(&self.backup_dir)?;
            fs::copy(&self.checkpoint_file, &backup_file)?;

            let prefix = format!("{}_checkpoint_", self.model_name);
            let mut backups: Vec<PathBuf> = fs::read_dir(&self.backup_dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
                })
                .collect();
            backups.sort();
            while backups.len() > MAX_BACKUPS {
                fs::remove_file(backups.remove(0))?;
            }
            Ok(())
        };
        if let Err(err) = rotate() {
            warn!(error = %err, "failed to rotate checkpoint backups");
        }
    }

}

/// `YYYY-MM-DD HH:MM:SS` from a system time, without a calendar crate.
/// Civil-date conversion per Howard Hinnant's algorithm.
fn humantime_date(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (hh, mm, ss) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02} {hh:02}:{mm:02}:{ss:02}")
}
