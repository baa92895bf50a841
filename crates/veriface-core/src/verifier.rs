//! Single-image verification against a user's trained classifier.
//!
//! [`verify`] never fails: every error becomes a non-match with probability
//! 0.0 and the error attached for callers that want to distinguish causes.

use crate::classifier::{self, ClassifierBackend, ClassifierError};
use crate::config::Config;
use crate::preprocess;
use crate::types::is_valid_user_id;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("no trained model for user {user_id}")]
    ModelNotFound { user_id: String },
    #[error("failed to load model {path}: {source}")]
    ModelLoad {
        path: PathBuf,
        source: ClassifierError,
    },
    #[error("could not decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("inference failed: {0}")]
    Inference(#[source] ClassifierError),
}

impl VerifyError {
    /// Stable machine-readable name for logs and the D-Bus reply.
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::ModelNotFound { .. } => "model_not_found",
            VerifyError::ModelLoad { .. } => "model_load",
            VerifyError::Decode(_) => "decode",
            VerifyError::Inference(_) => "inference",
        }
    }
}

#[derive(Debug)]
pub struct Verification {
    pub user_id: String,
    pub is_match: bool,
    /// Raw classifier output in `[0, 1]`; 0.0 on failure.
    pub probability: f32,
    pub threshold: f32,
    pub message: String,
    pub model_path: Option<PathBuf>,
    pub error: Option<VerifyError>,
}

/// `probability ≥ threshold`.
pub fn decide(probability: f32, threshold: f32) -> bool {
    probability >= threshold
}

/// Artifact to verify against: the best checkpoint, else the final model.
/// Ids that could not have been enrolled resolve to nothing.
pub fn resolve_model(config: &Config, user_id: &str) -> Option<PathBuf> {
    if !is_valid_user_id(user_id) {
        return None;
    }
    [config.best_model_path(user_id), config.final_model_path(user_id)]
        .into_iter()
        .find(|p| p.is_file())
}

/// Score `image_bytes` against `user_id`'s model.
pub fn verify(
    user_id: &str,
    image_bytes: &[u8],
    config: &Config,
    backend: &dyn ClassifierBackend,
) -> Verification {
    let threshold = config.verification.threshold;
    let model_path = resolve_model(config, user_id);

    match score(user_id, image_bytes, config, backend, model_path.clone()) {
        Ok(probability) => {
            let is_match = decide(probability, threshold);
            let verdict = if is_match { "VERIFIED" } else { "NOT VERIFIED" };
            let message = format!(
                "User {user_id} {verdict}. Probability: {probability:.4} (Threshold: {threshold})"
            );
            tracing::info!(user_id, probability, threshold, is_match, "verification decided");
            Verification {
                user_id: user_id.to_string(),
                is_match,
                probability,
                threshold,
                message,
                model_path,
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!(user_id, kind = e.kind(), error = %e, "verification failed");
            Verification {
                user_id: user_id.to_string(),
                is_match: false,
                probability: 0.0,
                threshold,
                message: format!("Verification failed: {e}"),
                model_path,
                error: Some(e),
            }
        }
    }
}

fn score(
    user_id: &str,
    image_bytes: &[u8],
    config: &Config,
    backend: &dyn ClassifierBackend,
    model_path: Option<PathBuf>,
) -> Result<f32, VerifyError> {
    let path = model_path.ok_or_else(|| VerifyError::ModelNotFound {
        user_id: user_id.to_string(),
    })?;
    let t = &config.training;
    let mut scorer = classifier::load_scorer(&path, backend, t.input_shape, t.normalization)
        .map_err(|source| VerifyError::ModelLoad {
            path: path.clone(),
            source,
        })?;

    // Shape and normalization come from the model, not from this config.
    let img = preprocess::decode(image_bytes).map_err(VerifyError::Decode)?;
    let input = preprocess::to_tensor(&img, scorer.input_shape(), scorer.normalization());

    let probabilities = scorer.predict(input.view()).map_err(VerifyError::Inference)?;
    match probabilities.first() {
        Some(&p) if (0.0..=1.0).contains(&p) => Ok(p),
        Some(&p) => Err(VerifyError::Inference(ClassifierError::Inference(format!(
            "probability {p} outside [0, 1]"
        )))),
        None => Err(VerifyError::Inference(ClassifierError::Inference(
            "model returned no output".into(),
        ))),
    }
}
