//! Checkpoint manager with bounded retention.
//!
//! Each checkpoint is a pair of files in the checkpoint directory:
//!
//! ```text
//! ckpt-N.ot     model weights (tch VarStore format)
//! ckpt-N.json   CheckpointState sidecar
//! ```
//!
//! `N` increases monotonically across restarts: existing checkpoints are
//! discovered when the manager is created. Once more than `max_to_keep`
//! checkpoints exist the oldest are deleted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Method;
use crate::error::{TrainError, TrainResult};
use crate::model::CdanModel;

const PREFIX: &str = "ckpt-";

/// Training state stored next to the weights.
///
/// Adam moment estimates are not persisted; a restored run starts with fresh
/// optimizer moments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Checkpoint number `N`.
    pub index: u64,
    /// Epochs completed when the checkpoint was written.
    pub epoch: usize,
    /// Optimizer steps taken.
    pub global_step: u64,
    /// Learning rate of the last step.
    pub learning_rate: f64,
    /// Margin of the last epoch.
    pub m_anneal: f64,
    /// Reversal coefficient of the last epoch.
    pub hp_lambda: f64,
    /// Method the weights were trained with.
    pub method: Method,
}

/// Writes, lists and prunes checkpoints in one directory.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
    next_index: u64,
}

impl CheckpointManager {
    /// Create the directory if needed and continue numbering after any
    /// checkpoint already present.
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> TrainResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| TrainError::io(&dir, e))?;
        let existing = list_indices(&dir)?;
        let next_index = existing.last().map_or(1, |&n| n + 1);
        if !existing.is_empty() {
            info!("Found {} checkpoint(s) in {}, continuing at {next_index}", existing.len(), dir.display());
        }
        Ok(CheckpointManager { dir, max_to_keep: max_to_keep.max(1), next_index })
    }

    /// Directory holding the checkpoints.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `model` and `state` (its `index` is overwritten) as the next
    /// checkpoint, then prune. Returns the weights path.
    pub fn save(&mut self, model: &CdanModel, mut state: CheckpointState) -> TrainResult<PathBuf> {
        let index = self.next_index;
        state.index = index;
        let weights = self.weights_path(index);
        model
            .save(&weights)
            .map_err(|e| TrainError::checkpoint(format!("saving weights: {e}"), &weights))?;

        let sidecar = self.state_path(index);
        let json = serde_json::to_string_pretty(&state)?;
        std::fs::write(&sidecar, json).map_err(|e| TrainError::io(&sidecar, e))?;

        self.next_index += 1;
        self.prune()?;
        debug!("Saved checkpoint {index} at {}", weights.display());
        Ok(weights)
    }

    /// Checkpoint numbers present on disk, oldest first.
    pub fn list(&self) -> TrainResult<Vec<u64>> {
        list_indices(&self.dir)
    }

    /// Weights path of the newest checkpoint.
    pub fn latest(&self) -> TrainResult<Option<PathBuf>> {
        Ok(self.list()?.last().map(|&n| self.weights_path(n)))
    }

    /// Load weights from `weights` into `model` and return its sidecar state.
    pub fn restore(&self, model: &mut CdanModel, weights: &Path) -> TrainResult<CheckpointState> {
        model
            .load(weights)
            .map_err(|e| TrainError::checkpoint(format!("loading weights: {e}"), weights))?;
        let sidecar = weights.with_extension("json");
        let contents = std::fs::read_to_string(&sidecar).map_err(|e| TrainError::io(&sidecar, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn weights_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{index}.ot"))
    }

    fn state_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{index}.json"))
    }

    fn prune(&self) -> TrainResult<()> {
        let indices = self.list()?;
        let excess = indices.len().saturating_sub(self.max_to_keep);
        for &old in &indices[..excess] {
            for path in [self.weights_path(old), self.state_path(old)] {
                if path.exists() {
                    std::fs::remove_file(&path).map_err(|e| TrainError::io(&path, e))?;
                }
            }
            debug!("Removed checkpoint {old}");
        }
        Ok(())
    }
}

/// Sorted numbers of every `ckpt-N.ot` in `dir`.
fn list_indices(dir: &Path) -> TrainResult<Vec<u64>> {
    let entries = std::fs::read_dir(dir).map_err(|e| TrainError::io(dir, e))?;
    let mut indices = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TrainError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(n) = name
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_suffix(".ot"))
            .and_then(|num| num.parse::<u64>().ok())
        {
            indices.push(n);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn list_ignores_unrelated_files() {
        let tmp = tempdir().unwrap();
        for name in ["ckpt-3.ot", "ckpt-10.ot", "ckpt-3.json", "ckpt-x.ot", "other.ot"] {
            std::fs::write(tmp.path().join(name), b"").unwrap();
        }
        assert_eq!(list_indices(tmp.path()).unwrap(), vec![3, 10]);
    }

    #[test]
    fn numbering_continues_after_existing() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("ckpt-4.ot"), b"").unwrap();
        let mgr = CheckpointManager::new(tmp.path(), 5).unwrap();
        assert_eq!(mgr.next_index, 5);
    }

    #[test]
    fn fresh_directory_starts_at_one() {
        let tmp = tempdir().unwrap();
        let mgr = CheckpointManager::new(tmp.path().join("ckpts"), 5).unwrap();
        assert_eq!(mgr.next_index, 1);
        assert!(mgr.dir().is_dir());
        assert_eq!(mgr.latest().unwrap(), None);
    }
}
