//! Checkpoint loading and hot refresh
//!
//! The trainer is the only writer of the checkpoint file; the live policy polls
//! its modification time and swaps in a new network only after it has been
//! fully validated. Any failure keeps the previously active model.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{info, warn};

use super::q_network::{layer_index, parse_layers, QNetwork};
use crate::config::ModelConfig;
use crate::types::Signal;

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("checkpoint not found: {0}")]
    Missing(PathBuf),
    #[error("reading checkpoint: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid checkpoint: {0}")]
    Format(String),
    #[error("checkpoint has no 2-D weight tensor")]
    NoInputLayer,
    #[error("input dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("unsupported architecture: {0}")]
    Architecture(String),
    #[error("model backend: {0}")]
    Backend(String),
}

/// Input width of the first layer: the first 2-D tensor by layer order,
/// with shape `[out, in]`.
pub fn infer_input_dim(bytes: &[u8]) -> Result<usize, ModelLoadError> {
    let tensors = safetensors::SafeTensors::deserialize(bytes)
        .map_err(|e| ModelLoadError::Format(e.to_string()))?;

    let mut names: Vec<&String> = tensors.names();
    names.sort_by_key(|name| (layer_index(name, "weight").unwrap_or(usize::MAX), name.to_string()));

    for name in names {
        let view = tensors
            .tensor(name)
            .map_err(|e| ModelLoadError::Format(e.to_string()))?;
        if let [_, input] = view.shape() {
            return Ok(*input);
        }
    }
    Err(ModelLoadError::NoInputLayer)
}

/// Hex SHA-256 of the checkpoint bytes
pub fn model_version(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// A validated network together with where it came from
#[derive(Debug)]
pub struct LoadedModel {
    pub network: QNetwork,
    pub version: String,
    pub mtime: Option<SystemTime>,
}

pub struct ModelLoader {
    path: PathBuf,
    expected_input_dim: Option<usize>,
    refresh_interval: Duration,
    active: Option<LoadedModel>,
    /// mtime of the last file we attempted, successful or not
    last_seen_mtime: Option<SystemTime>,
    last_check: Option<Instant>,
}

impl ModelLoader {
    pub fn new(config: &ModelConfig, expected_input_dim: Option<usize>) -> Self {
        Self {
            path: config.path.clone(),
            expected_input_dim,
            refresh_interval: Duration::from_secs(config.refresh_interval_secs),
            active: None,
            last_seen_mtime: None,
            last_check: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model(&self) -> Option<&QNetwork> {
        self.active.as_ref().map(|m| &m.network)
    }

    /// Checkpoint hash of the active model, or "fallback" when none is loaded
    pub fn version(&self) -> String {
        self.active
            .as_ref()
            .map(|m| m.version.clone())
            .unwrap_or_else(|| "fallback".to_string())
    }

    /// Read and validate the checkpoint without touching the active model
    pub fn load(&self) -> Result<LoadedModel, ModelLoadError> {
        read_checkpoint(&self.path, self.expected_input_dim)
    }

    /// Load and swap in on success; on failure the previous model stays active.
    /// Returns whether a new model was installed.
    pub fn try_load(&mut self) -> bool {
        let mtime = file_mtime(&self.path);
        self.last_seen_mtime = mtime.or(self.last_seen_mtime);

        match self.load() {
            Ok(loaded) => {
                info!(
                    "[MODEL] Loaded {} (input_dim={}, version={})",
                    self.path.display(),
                    loaded.network.input_dim(),
                    &loaded.version[..12.min(loaded.version.len())]
                );
                self.active = Some(loaded);
                true
            }
            Err(ModelLoadError::Missing(path)) => {
                warn!("[MODEL] No checkpoint at {}, keeping current model", path.display());
                false
            }
            Err(e) => {
                warn!("[MODEL] Rejected checkpoint {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Reload when the refresh interval has elapsed and the file's mtime is
    /// strictly newer than the last one seen.
    pub fn maybe_refresh(&mut self) -> bool {
        if let Some(last) = self.last_check {
            if last.elapsed() < self.refresh_interval {
                return false;
            }
        }
        self.last_check = Some(Instant::now());

        match (file_mtime(&self.path), self.last_seen_mtime) {
            (Some(current), Some(seen)) if current <= seen => false,
            (Some(_), _) => self.try_load(),
            (None, _) => false,
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_checkpoint(path: &Path, expected_input_dim: Option<usize>) -> Result<LoadedModel, ModelLoadError> {
    if !path.exists() {
        return Err(ModelLoadError::Missing(path.to_path_buf()));
    }
    let mtime = file_mtime(path);
    let bytes = fs::read(path)?;

    let found = infer_input_dim(&bytes)?;
    if let Some(expected) = expected_input_dim {
        if expected != found {
            return Err(ModelLoadError::DimensionMismatch { expected, found });
        }
    }

    let layers = parse_layers(&bytes)?;
    let outputs = layers.last().map(|l| l.out_dim).unwrap_or(0);
    if outputs != Signal::ACTION_SPACE.len() {
        return Err(ModelLoadError::Architecture(format!(
            "expected {} outputs, found {}",
            Signal::ACTION_SPACE.len(),
            outputs
        )));
    }
    let network = QNetwork::from_layers(&layers)?;

    Ok(LoadedModel {
        network,
        version: model_version(&bytes),
        mtime,
    })
}

/// Resume from the checkpoint when it matches `input_dim`, otherwise start a
/// freshly initialised network. Fails only when no network can be built.
pub fn load_or_fresh(config: &ModelConfig, input_dim: usize, seed: u64) -> Result<QNetwork> {
    match read_checkpoint(&config.path, Some(input_dim)) {
        Ok(loaded) => {
            info!("[MODEL] Resuming from {}", config.path.display());
            return Ok(loaded.network);
        }
        Err(ModelLoadError::Missing(_)) => {
            info!("[MODEL] No checkpoint yet, starting fresh (input_dim={})", input_dim);
        }
        Err(e) => {
            warn!("[MODEL] Ignoring checkpoint {}: {}; starting fresh", config.path.display(), e);
        }
    }
    QNetwork::seeded(input_dim, &config.hidden_layers, Signal::ACTION_SPACE.len(), seed)
}

/// Index of the largest value; None for empty input or any NaN
pub fn argmax(values: &[f32]) -> Option<usize> {
    if values.iter().any(|v| v.is_nan()) {
        return None;
    }
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::q_network::{checkpoint_bytes, test_layers, write_checkpoint};

    fn config(path: PathBuf) -> ModelConfig {
        ModelConfig {
            path,
            hidden_layers: vec![64, 64],
            refresh_interval_secs: 0,
        }
    }

    #[test]
    fn test_infers_input_dim_from_first_layer() {
        let bytes = checkpoint_bytes(&test_layers(&[7, 64, 3], 1)).unwrap();
        assert_eq!(infer_input_dim(&bytes).unwrap(), 7);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        // first 2-D weight is [64, 7]
        write_checkpoint(&path, &test_layers(&[7, 64, 3], 1)).unwrap();

        let mut loader = ModelLoader::new(&config(path), Some(8));
        assert!(matches!(
            loader.load(),
            Err(ModelLoadError::DimensionMismatch { expected: 8, found: 7 })
        ));
        assert!(!loader.try_load());
        assert!(loader.model().is_none());
        assert_eq!(loader.version(), "fallback");
    }

    #[test]
    fn test_wrong_action_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_checkpoint(&path, &test_layers(&[12, 16, 4], 1)).unwrap();
        let loader = ModelLoader::new(&config(path), Some(12));
        assert!(matches!(loader.load(), Err(ModelLoadError::Architecture(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ModelLoader::new(&config(dir.path().join("none.safetensors")), None);
        assert!(matches!(loader.load(), Err(ModelLoadError::Missing(_))));
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.9, 0.3]), Some(1));
        assert_eq!(argmax(&[0.1, f32::NAN, 0.3]), None);
        assert_eq!(argmax(&[]), None);
    }

    #[cfg(not(feature = "rl"))]
    #[test]
    fn test_valid_checkpoint_without_backend_keeps_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_checkpoint(&path, &test_layers(&[12, 16, 3], 1)).unwrap();

        let mut loader = ModelLoader::new(&config(path.clone()), Some(12));
        assert!(matches!(loader.load(), Err(ModelLoadError::Backend(_))));
        assert!(!loader.try_load());
        assert_eq!(loader.version(), "fallback");
        assert!(load_or_fresh(&config(path), 12, 1).is_err());
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_mismatched_checkpoint_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_checkpoint(&path, &test_layers(&[7, 64, 3], 1)).unwrap();
        let fresh = load_or_fresh(&config(path), 8, 3).unwrap();
        assert_eq!(fresh.input_dim(), 8);
        assert_eq!(fresh.hidden_dims(), vec![64, 64]);
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_loaded_model_matches_checkpoint_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let layers = test_layers(&[12, 16, 3], 4);
        write_checkpoint(&path, &layers).unwrap();

        let loaded = ModelLoader::new(&config(path), Some(12)).load().unwrap();
        assert_eq!(loaded.network.layers().unwrap(), layers);
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_failed_reload_keeps_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_checkpoint(&path, &test_layers(&[12, 16, 3], 1)).unwrap();

        let mut loader = ModelLoader::new(&config(path.clone()), Some(12));
        assert!(loader.try_load());
        let version = loader.version();
        assert_eq!(version.len(), 64);

        fs::write(&path, b"corrupt").unwrap();
        assert!(!loader.try_load());
        assert_eq!(loader.version(), version);
        assert!(loader.model().is_some());
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_refresh_only_on_newer_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        write_checkpoint(&path, &test_layers(&[12, 16, 3], 1)).unwrap();

        let mut loader = ModelLoader::new(&config(path.clone()), Some(12));
        assert!(loader.maybe_refresh());
        assert!(!loader.maybe_refresh());

        let first = loader.version();
        let later = SystemTime::now() + Duration::from_secs(5);
        write_checkpoint(&path, &test_layers(&[12, 16, 3], 2)).unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(loader.maybe_refresh());
        assert_ne!(loader.version(), first);
    }
}
