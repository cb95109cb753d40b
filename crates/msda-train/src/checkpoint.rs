//! Step checkpoints: one weight file per model plus a JSON manifest.
//!
//! ```text
//! <dir>/
//!   manifest.json          { "paradigm": "dann", "iteration": 120, "models": [...] }
//!   backbone.ot
//!   top.ot
//!   discriminator.ot
//! ```
//!
//! Models are matched by name, so a test step restores exactly the subset of
//! a train step's models it owns (e.g. the self-ensembling teacher).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::Paradigm;
use crate::error::{TrainError, TrainResult};
use crate::model::Model;
use crate::steps::{TestStep, TrainStep};

/// File name of the manifest inside a checkpoint directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Paradigm of the step that wrote the checkpoint.
    pub paradigm: Paradigm,
    /// Iteration counter at save time.
    pub iteration: i64,
    /// Names of the saved models.
    pub models: Vec<String>,
}

/// Path of the weight file for model `name`.
pub fn model_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.ot"))
}

/// Save every model of `step` and its iteration counter into `dir`.
///
/// # Errors
///
/// [`TrainError::Checkpoint`] when the directory cannot be created or a file
/// cannot be written.
pub fn save_train_step(step: &dyn TrainStep, dir: &Path) -> TrainResult<CheckpointManifest> {
    std::fs::create_dir_all(dir)
        .map_err(|e| TrainError::checkpoint(format!("cannot create directory: {e}"), dir))?;
    let models = step.models();
    for model in &models {
        let path = model_path(dir, model.name());
        model
            .save(&path)
            .map_err(|e| TrainError::checkpoint(e.to_string(), &path))?;
    }
    let manifest = CheckpointManifest {
        paradigm: step.paradigm(),
        iteration: step.iteration(),
        models: models.iter().map(|m| m.name().to_string()).collect(),
    };
    let path = dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(&path, json).map_err(|e| TrainError::checkpoint(e.to_string(), &path))?;
    info!(dir = %dir.display(), iteration = manifest.iteration, "checkpoint saved");
    Ok(manifest)
}

/// Read `manifest.json` from `dir`.
pub fn read_manifest(dir: &Path) -> TrainResult<CheckpointManifest> {
    let path = dir.join(MANIFEST_FILE);
    let json = std::fs::read_to_string(&path)
        .map_err(|e| TrainError::checkpoint(e.to_string(), &path))?;
    Ok(serde_json::from_str(&json)?)
}

/// Restore the models and iteration of a train step saved with
/// [`save_train_step`].
///
/// # Errors
///
/// [`TrainError::Checkpoint`] when the manifest names a different paradigm or
/// lacks one of the step's models. Nothing is loaded in that case.
pub fn restore_train_step(step: &mut dyn TrainStep, dir: &Path) -> TrainResult<CheckpointManifest> {
    let manifest = read_manifest(dir)?;
    if manifest.paradigm != step.paradigm() {
        return Err(TrainError::checkpoint(
            format!("checkpoint holds a {} step, not {}", manifest.paradigm, step.paradigm()),
            dir,
        ));
    }
    load_models(step.models_mut(), &manifest, dir)?;
    step.set_iteration(manifest.iteration);
    Ok(manifest)
}

/// Load the models of a test step by name. The test step keeps its own
/// iteration counter.
pub fn restore_test_step(step: &mut dyn TestStep, dir: &Path) -> TrainResult<CheckpointManifest> {
    let manifest = read_manifest(dir)?;
    load_models(step.models_mut(), &manifest, dir)?;
    Ok(manifest)
}

fn load_models(models: Vec<&mut Model>, manifest: &CheckpointManifest, dir: &Path) -> TrainResult<()> {
    for model in &models {
        if !manifest.models.iter().any(|n| n == model.name()) {
            return Err(TrainError::checkpoint(
                format!("model `{}` is not in the checkpoint", model.name()),
                dir,
            ));
        }
        let path = model_path(dir, model.name());
        if !path.is_file() {
            return Err(TrainError::checkpoint("weight file missing", path));
        }
    }
    for model in models {
        let path = model_path(dir, model.name());
        model
            .load(&path)
            .map_err(|e| TrainError::checkpoint(e.to_string(), &path))?;
    }
    Ok(())
}
