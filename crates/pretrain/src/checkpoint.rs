use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    model::LanguageModel,
    optimizer::{GradientScaler, GradientScalerState, OptimizerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const LATEST_DIR: &str = "epoch_latest";
const EPOCH_PREFIX: &str = "epoch_";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TrainingProgress {
    /// Epochs fully trained; a resumed run starts at this epoch index.
    pub completed_epochs: usize,
    pub global_step: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scaler: Option<FileRecord>,
    pub progress: TrainingProgress,
}

pub struct SaveRequest<'a, M> {
    pub base_dir: &'a Path,
    pub dir_name: String,
    pub config: &'a TrainingConfig,
    pub model: &'a M,
    /// Complete optimizer state; in sharded runs gathered from the owners.
    pub optimizer: &'a OptimizerState,
    pub scaler: Option<&'a GradientScaler>,
    pub progress: TrainingProgress,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub scaler_state: Option<GradientScalerState>,
    pub model_weights_path: PathBuf,
}

/// Directory name for the checkpoint written after `completed_epochs` epochs.
pub fn epoch_dir_name(completed_epochs: usize) -> String {
    format!("{}{}", EPOCH_PREFIX, completed_epochs)
}

pub fn save_checkpoint<M: LanguageModel>(
    request: SaveRequest<'_, M>,
) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.base_dir.display()
        ))
    })?;

    let checkpoint_dir = request.base_dir.join(&request.dir_name);
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to replace checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir)?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;
    let model_record = file_record(&model_path)?;

    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, request.optimizer)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let scaler_record = match request.scaler.and_then(GradientScaler::state) {
        Some(state) => {
            let scaler_path = checkpoint_dir.join(SCALER_FILENAME);
            write_json(&scaler_path, &state)?;
            Some(file_record(&scaler_path)?)
        }
        None => None,
    };

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        model: model_record,
        optimizer: optimizer_record,
        scaler: scaler_record,
        progress: request.progress,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// Highest-numbered epoch checkpoint, or `epoch_latest` when no numbered
/// checkpoint exists.
pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let newest = epoch_directories(base_dir)?
        .into_iter()
        .max_by_key(|(epoch, _)| *epoch)
        .map(|(_, path)| path);
    let path = match newest {
        Some(path) => path,
        None => {
            let latest = base_dir.join(LATEST_DIR);
            if !latest.join(MANIFEST_FILENAME).is_file() {
                return Ok(None);
            }
            latest
        }
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    let scaler_state = match manifest.scaler.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(read_json(&path)?)
        }
        None => None,
    };

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        scaler_state,
        model_weights_path: model_path,
    })
}

pub fn apply_model_weights<M: LanguageModel>(
    model: &M,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let tensors = load_safetensors(weights_path, model.device())?;
    let mut by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in model.parameters() {
        let tensor = by_name
            .remove(&name)
            .ok_or_else(|| TrainingError::runtime(format!("checkpoint missing parameter {name}")))?;
        let tensor = tensor.to_dtype(var.as_tensor().dtype())?;
        var.set(&tensor)?;
    }

    if !by_name.is_empty() {
        let mut extra: Vec<_> = by_name.into_keys().collect();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

pub fn delete_checkpoint(directory: &Path) -> Result<(), TrainingError> {
    if directory.exists() {
        fs::remove_dir_all(directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to delete checkpoint {}: {err}",
                directory.display()
            ))
        })?;
    }
    Ok(())
}

fn save_model_weights<M: LanguageModel>(model: &M, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, _> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes: path.metadata()?.len(),
    })
}

fn epoch_directories(base: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let epoch = name
            .to_str()
            .and_then(|name| name.strip_prefix(EPOCH_PREFIX))
            .and_then(|suffix| suffix.parse::<usize>().ok());
        if let Some(epoch) = epoch {
            dirs.push((epoch, entry.path()));
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    if sha256_file(path)? != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    let mut file = File::create(path)?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_directories_sort_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["epoch_2", "epoch_10", "epoch_latest", "notes"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        let mut epochs: Vec<usize> = epoch_directories(dir.path())
            .unwrap()
            .into_iter()
            .map(|(epoch, _)| epoch)
            .collect();
        epochs.sort_unstable();
        assert_eq!(epochs, vec![2, 10]);
    }

    #[test]
    fn missing_base_has_no_latest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"weights").unwrap();
        let record = file_record(&path).unwrap();
        assert!(validate_file(&path, &record.sha256).is_ok());
        fs::write(&path, b"tampered").unwrap();
        assert!(validate_file(&path, &record.sha256).is_err());
    }
}
