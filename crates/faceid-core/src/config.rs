//! Pipeline configuration.
//!
//! Defaults live in code; an optional TOML file (`FACEID_CONFIG`) may set
//! any subset of fields, and `FACEID_*` environment variables override both.

use crate::detector::DetectionParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete configuration, passed explicitly to every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    pub dataset: DatasetConfig,
    pub training: TrainingConfig,
    pub verification: VerificationConfig,
}

/// On-disk layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root under which `uploads/`, `faces/` and `models/` live.
    pub data_dir: PathBuf,
    /// Directory name (under `faces/`) of the shared negative class.
    pub unknown_class: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            unknown_class: "unknown".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.data_dir.join("faces")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    /// Shared negative-class directory (`faces/unknown`).
    pub fn unknown_dir(&self) -> PathBuf {
        self.faces_dir().join(&self.unknown_class)
    }

    /// A user's enrollment crops (`faces/{user}`).
    pub fn user_faces_dir(&self, user: &str) -> PathBuf {
        self.faces_dir().join(user)
    }

    /// Scratch directory for a user's probe crop (`faces/probes/{user}`).
    pub fn probe_dir(&self, user: &str) -> PathBuf {
        self.faces_dir().join("probes").join(user)
    }
}

/// Face extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Haar cascade XML used by the OpenCV detector.
    pub cascade_path: PathBuf,
    /// Target frames per second of source time to run detection on.
    pub sampling_rate: f64,
    /// Cap on faces saved from one video.
    pub max_faces: usize,
    /// Enrollment is rejected when a video yields fewer faces than this.
    pub min_enroll_faces: usize,
    /// Detector parameters for batch extraction from video.
    pub video_detection: DetectionParams,
    /// Detector parameters for single-image extraction.
    pub image_detection: DetectionParams,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            cascade_path: PathBuf::from(
                "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml",
            ),
            sampling_rate: 10.0,
            max_faces: 250,
            min_enroll_faces: 249,
            video_detection: DetectionParams::VIDEO,
            image_detection: DetectionParams::IMAGE,
        }
    }
}

/// Dataset loading and splitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Side length of the square grayscale raster fed to the classifier.
    pub image_size: u32,
    pub validation_fraction: f32,
    /// Fraction held out as a test partition; 0 disables it.
    pub test_fraction: f32,
    /// Seed for the stratified split.
    pub split_seed: u64,
    /// Augment training batches.
    pub augment: bool,
    pub batch_size: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            image_size: 64,
            validation_fraction: 0.2,
            test_fraction: 0.0,
            split_seed: 42,
            augment: true,
            batch_size: 32,
        }
    }
}

/// Classifier architecture and optimisation budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Optimiser weight decay: adds `λ·w` to the gradient of every
    /// parameter, biases and batch-norm included. Not equivalent to a
    /// kernel-only `l2(λ)` loss term, which adds `2λ·w` to conv and dense
    /// kernels alone.
    pub weight_decay: f64,
    /// Epochs without validation-loss improvement before stopping.
    pub early_stopping_patience: usize,
    /// Epochs without improvement before the learning rate is reduced.
    pub lr_patience: usize,
    pub lr_factor: f64,
    pub min_learning_rate: f64,
    pub kernel_size: usize,
    pub dense_units: usize,
    pub conv_dropout: f64,
    pub dense_dropout: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            learning_rate: 1e-3,
            weight_decay: 1e-3,
            early_stopping_patience: 10,
            lr_patience: 5,
            lr_factor: 0.2,
            min_learning_rate: 1e-4,
            kernel_size: 3,
            dense_units: 256,
            conv_dropout: 0.25,
            dense_dropout: 0.5,
        }
    }
}

/// Confidence gates. The two thresholds are deliberately distinct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Below this the model reports an uncertain prediction.
    pub model_threshold: f32,
    /// The enrollment boundary accepts only strictly above this.
    pub accept_threshold: f32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            model_threshold: 0.80,
            accept_threshold: 0.90,
        }
    }
}

impl Config {
    /// Load from `FACEID_CONFIG` (if set) and `FACEID_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEID_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("FACEID_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("FACEID_CASCADE_PATH") {
            self.extraction.cascade_path = PathBuf::from(path);
        }

        let ex = &mut self.extraction;
        ex.sampling_rate = env_or("FACEID_SAMPLING_RATE", ex.sampling_rate);
        ex.max_faces = env_or("FACEID_MAX_FACES", ex.max_faces);
        ex.min_enroll_faces = env_or("FACEID_MIN_ENROLL_FACES", ex.min_enroll_faces);

        let ds = &mut self.dataset;
        ds.split_seed = env_or("FACEID_SPLIT_SEED", ds.split_seed);
        ds.augment = env_or("FACEID_AUGMENT", ds.augment);

        let tr = &mut self.training;
        tr.epochs = env_or("FACEID_EPOCHS", tr.epochs);
        tr.early_stopping_patience = env_or("FACEID_EARLY_STOPPING_PATIENCE", tr.early_stopping_patience);
        tr.lr_patience = env_or("FACEID_LR_PATIENCE", tr.lr_patience);

        let ver = &mut self.verification;
        ver.model_threshold = env_or("FACEID_MODEL_THRESHOLD", ver.model_threshold);
        ver.accept_threshold = env_or("FACEID_ACCEPT_THRESHOLD", ver.accept_threshold);
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let ex = &self.extraction;
        if !(ex.sampling_rate > 0.0) {
            return invalid(format!("sampling_rate must be positive, got {}", ex.sampling_rate));
        }
        if ex.max_faces == 0 {
            return invalid("max_faces must be at least 1".into());
        }
        if ex.min_enroll_faces > ex.max_faces {
            return invalid(format!(
                "min_enroll_faces ({}) exceeds max_faces ({})",
                ex.min_enroll_faces, ex.max_faces
            ));
        }
        for params in [&ex.video_detection, &ex.image_detection] {
            if !(params.scale_factor > 1.0) {
                return invalid(format!("scale_factor must exceed 1.0, got {}", params.scale_factor));
            }
        }

        let ds = &self.dataset;
        if ds.image_size < 8 || ds.image_size % 8 != 0 {
            return invalid(format!("image_size must be a multiple of 8, got {}", ds.image_size));
        }
        if !(ds.validation_fraction > 0.0 && ds.validation_fraction < 1.0) {
            return invalid(format!(
                "validation_fraction must be in (0, 1), got {}",
                ds.validation_fraction
            ));
        }
        if !(ds.test_fraction >= 0.0 && ds.validation_fraction + ds.test_fraction < 1.0) {
            return invalid(format!(
                "test_fraction must be >= 0 and leave room for training, got {}",
                ds.test_fraction
            ));
        }
        if ds.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }

        let tr = &self.training;
        if tr.epochs == 0 {
            return invalid("epochs must be at least 1".into());
        }
        if tr.kernel_size % 2 == 0 {
            return invalid(format!("kernel_size must be odd, got {}", tr.kernel_size));
        }
        if !(tr.lr_factor > 0.0 && tr.lr_factor < 1.0) {
            return invalid(format!("lr_factor must be in (0, 1), got {}", tr.lr_factor));
        }

        let ver = &self.verification;
        for (name, value) in [
            ("model_threshold", ver.model_threshold),
            ("accept_threshold", ver.accept_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be in [0, 1], got {value}"));
            }
        }

        if self.storage.unknown_class.is_empty() {
            return invalid("unknown_class must not be empty".into());
        }

        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, current: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(current)
}
