// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores the canonical parameter set of the model,
// whether or not it currently runs behind the replication wrapper.
//
// What gets saved:
//   1. Parameters (.mpk.gz)  — one snapshot per epoch, plus "best"
//   2. train_config.json     — every hyper-parameter of the run
//
// Why always go through ModelHandle::canonical()?
//   A replicated model holds the same parameters as an unwrapped
//   one. Saving and loading through the canonical accessor means a
//   snapshot taken with 4 replicas loads into a single-copy model
//   and the other way round, without probing for a wrapper.
//
// Why no optimizer state?
//   Snapshots carry parameters only. After a load the optimizer
//   starts fresh and the iteration counter restarts at zero.
//
// File naming convention (the recorder appends .mpk.gz):
//   checkpoints/
//     checkpoint_epoch_1.mpk.gz   ← written after every epoch
//     checkpoint_epoch_2.mpk.gz
//     ...
//     checkpoint_best.mpk.gz      ← overwritten on every held-out improvement
//     train_config.json           ← hyper-parameters of the run
//
// Writes are synchronous and not atomic: a reader opening a file
// mid-write sees undefined content. Failures are fatal and are
// never retried.
//
// Reference: Burn Book §5 (Records and Checkpointing)
//            Rust Book §9 (Error Handling)

use anyhow::{Context, Result};
use std::{fs, path::PathBuf};

use crate::application::train_use_case::TrainConfig;
use crate::domain::replication::ModelHandle;
use crate::domain::traits::ParameterSnapshot;

/// Unqualified name of the best-so-far snapshot.
pub const BEST_CHECKPOINT: &str = "checkpoint_best";

/// Manages saving and loading of parameter snapshots.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Create a manager rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    /// Path (without extension) of an epoch-tagged or the best snapshot.
    pub fn path_for(&self, id: Option<usize>) -> PathBuf {
        match id {
            Some(epoch) => self.dir.join(format!("checkpoint_epoch_{epoch}")),
            None        => self.dir.join(BEST_CHECKPOINT),
        }
    }

    /// Save the canonical parameters, tagged with `id` or as the best snapshot.
    pub fn save<M: ParameterSnapshot>(&self, model: &ModelHandle<M>, id: Option<usize>) -> Result<()> {
        let path = self.path_for(id);
        tracing::info!("Saving checkpoint '{}'", path.display());
        model
            .canonical()
            .save_parameters(&path)
            .with_context(|| format!("Checkpoint write failed for '{}'", path.display()))
    }

    /// Load snapshot `name` (e.g. "checkpoint_best") into the canonical model.
    pub fn load<M: ParameterSnapshot>(&self, model: &mut ModelHandle<M>, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        tracing::info!("Loading checkpoint '{}'", path.display());
        model
            .canonical_mut()
            .load_parameters(&path)
            .with_context(|| format!("Checkpoint read failed for '{}'", path.display()))
    }

    /// Save the training configuration next to the snapshots.
    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        let path = self.dir.join("train_config.json");
        let json = serde_json::to_string_pretty(cfg)?;
        fs::write(&path, json)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }
}
