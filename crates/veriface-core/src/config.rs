//! Pipeline configuration.
//!
//! A single [`Config`] value is built once (TOML file, then environment
//! overrides in the daemon) and handed to each component's entry point.
//! Nothing in the core reads process-wide state.

use crate::preprocess::Normalization;
use crate::types::InputShape;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub split: SplitConfig,
    pub augment: AugmentConfig,
    pub training: TrainingConfig,
    pub verification: VerificationConfig,
}

/// Filesystem roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root holding `train/`, `validation/` and `test/` split directories.
    pub data_dir: PathBuf,
    /// Root holding one artifact directory per user.
    pub models_dir: PathBuf,
    /// Root the upload handler saves raw enrollment images under.
    pub upload_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            models_dir: PathBuf::from("models"),
            upload_dir: PathBuf::from("uploads"),
        }
    }
}

/// Per-user train/validation/test split.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub train_ratio: f64,
    pub validation_ratio: f64,
    /// Shuffle seed. `None` draws a fresh split on every run.
    pub seed: Option<u64>,
    /// Lower-case file extensions accepted as images.
    pub allowed_extensions: Vec<String>,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_ratio: 0.8,
            validation_ratio: 0.15,
            seed: None,
            allowed_extensions: vec!["png".into(), "jpg".into(), "jpeg".into()],
        }
    }
}

impl SplitConfig {
    pub fn test_ratio(&self) -> f64 {
        1.0 - self.train_ratio - self.validation_ratio
    }
}

/// Offline augmentation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Probability that an eligible original gets one augmented copy.
    pub probability: f64,
    pub seed: Option<u64>,
    /// Glare blend intensity range.
    pub glare_intensity: (f32, f32),
    /// Glare ellipse semi-axis range, as a fraction of the image dimension.
    pub glare_axis_fraction: (f32, f32),
    /// Shadow blend intensity range.
    pub shadow_intensity: (f32, f32),
    /// Rotation angle range in degrees.
    pub rotation_degrees: (f32, f32),
    /// Number of spots drawn per image (inclusive).
    pub spot_count: (u32, u32),
    /// Spot radius in pixels (inclusive).
    pub spot_radius: (u32, u32),
    /// Upper bound for each RGB channel of a spot colour.
    pub spot_max_channel: u8,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            probability: 0.4,
            seed: None,
            glare_intensity: (0.3, 0.7),
            glare_axis_fraction: (0.1, 0.3),
            shadow_intensity: (0.3, 0.6),
            rotation_degrees: (-15.0, 15.0),
            spot_count: (3, 10),
            spot_radius: (2, 6),
            spot_max_channel: 60,
        }
    }
}

/// Two-phase training parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub input_shape: InputShape,
    pub normalization: Normalization,
    pub batch_size: usize,
    pub initial_epochs: usize,
    pub fine_tune_epochs: usize,
    pub learning_rate_initial: f64,
    pub learning_rate_finetune: f64,
    pub l2_regularization: f32,
    pub dropout: f32,
    /// Epochs without validation-loss improvement before stopping a phase.
    pub early_stopping_patience: usize,
    /// Epochs of validation-loss plateau before the learning rate is reduced.
    pub plateau_patience: usize,
    pub plateau_factor: f64,
    pub plateau_min_delta: f32,
    pub min_learning_rate: f64,
    /// Flip and brightness/contrast jitter on the train stream.
    pub online_augmentation: bool,
    pub seed: Option<u64>,
    pub final_model_filename: String,
    pub history_filename: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            input_shape: InputShape::new(224, 224),
            normalization: Normalization::VggFace,
            batch_size: 16,
            initial_epochs: 20,
            fine_tune_epochs: 20,
            learning_rate_initial: 1e-3,
            learning_rate_finetune: 5e-5,
            l2_regularization: 5e-4,
            dropout: 0.5,
            early_stopping_patience: 5,
            plateau_patience: 3,
            plateau_factor: 0.2,
            plateau_min_delta: 1e-4,
            min_learning_rate: 1e-7,
            online_augmentation: true,
            seed: None,
            final_model_filename: "full_model.json".into(),
            history_filename: "training_history.json".into(),
        }
    }
}

/// Verification decision parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Probability at or above which a probe is a match.
    pub threshold: f32,
    /// Checkpoint written whenever validation accuracy improves.
    pub best_model_filename: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            best_model_filename: "best_model.json".into(),
        }
    }
}

impl Config {
    /// Parse a TOML document; missing sections and keys take their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.split;
        if !(0.0..=1.0).contains(&s.train_ratio) || !(0.0..=1.0).contains(&s.validation_ratio) {
            return Err(ConfigError::Invalid(
                "split ratios must each lie in [0, 1]".into(),
            ));
        }
        if s.train_ratio + s.validation_ratio > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "train_ratio + validation_ratio = {} exceeds 1.0",
                s.train_ratio + s.validation_ratio
            )));
        }
        if s.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid("allowed_extensions is empty".into()));
        }

        let a = &self.augment;
        if !(0.0..=1.0).contains(&a.probability) {
            return Err(ConfigError::Invalid(format!(
                "augment.probability {} outside [0, 1]",
                a.probability
            )));
        }
        check_range("augment.glare_intensity", a.glare_intensity)?;
        check_range("augment.glare_axis_fraction", a.glare_axis_fraction)?;
        check_range("augment.shadow_intensity", a.shadow_intensity)?;
        check_range("augment.rotation_degrees", a.rotation_degrees)?;
        if a.spot_count.0 > a.spot_count.1 || a.spot_radius.0 > a.spot_radius.1 {
            return Err(ConfigError::Invalid("augment spot ranges are inverted".into()));
        }

        let t = &self.training;
        if t.input_shape.height == 0 || t.input_shape.width == 0 {
            return Err(ConfigError::Invalid("training.input_shape has a zero dimension".into()));
        }
        if t.batch_size == 0 {
            return Err(ConfigError::Invalid("training.batch_size must be > 0".into()));
        }
        if !(0.0..1.0).contains(&t.dropout) {
            return Err(ConfigError::Invalid(format!(
                "training.dropout {} outside [0, 1)",
                t.dropout
            )));
        }
        if t.learning_rate_initial <= 0.0 || t.learning_rate_finetune <= 0.0 {
            return Err(ConfigError::Invalid("learning rates must be > 0".into()));
        }
        if !(0.0..1.0).contains(&t.plateau_factor) || t.plateau_factor == 0.0 {
            return Err(ConfigError::Invalid(format!(
                "training.plateau_factor {} outside (0, 1)",
                t.plateau_factor
            )));
        }

        let v = &self.verification;
        if !(0.0..=1.0).contains(&v.threshold) {
            return Err(ConfigError::Invalid(format!(
                "verification.threshold {} outside [0, 1]",
                v.threshold
            )));
        }
        Ok(())
    }

    /// `{models_dir}/{user_id}`.
    pub fn user_models_dir(&self, user_id: &str) -> PathBuf {
        self.paths.models_dir.join(user_id)
    }

    /// Best-validation checkpoint for a user.
    pub fn best_model_path(&self, user_id: &str) -> PathBuf {
        self.user_models_dir(user_id)
            .join(&self.verification.best_model_filename)
    }

    /// End-of-run artifact for a user.
    pub fn final_model_path(&self, user_id: &str) -> PathBuf {
        self.user_models_dir(user_id)
            .join(&self.training.final_model_filename)
    }
}

fn check_range(name: &str, (lo, hi): (f32, f32)) -> Result<(), ConfigError> {
    if !lo.is_finite() || !hi.is_finite() || lo > hi {
        return Err(ConfigError::Invalid(format!("{name} range ({lo}, {hi}) is invalid")));
    }
    Ok(())
}
