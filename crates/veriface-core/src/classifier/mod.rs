//! Trainable binary classifier contract.
//!
//! The training orchestrator and the verifier only talk to these traits; the
//! network behind them is a backend concern. [`probe`] is the built-in
//! backend, and `.onnx` artifacts are served by [`crate::onnx`].

pub mod probe;

use crate::preprocess::Normalization;
use crate::types::{ClassWeights, InputShape, Label};
use ndarray::{Array4, ArrayView4};
use std::path::Path;
use thiserror::Error;

// Matches the clamp Keras applies before taking logs in binary cross-entropy.
const BCE_EPSILON: f32 = 1e-7;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model build failed: {0}")]
    Build(String),
    #[error("input shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("malformed model artifact: {0}")]
    Format(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("model artifact not found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Hyperparameters of the classification head.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadConfig {
    pub dropout: f32,
    pub l2: f32,
}

/// Optimizer selected at compile time. Compiling resets optimizer state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Optimizer {
    Adam { learning_rate: f64 },
    Sgd { learning_rate: f64 },
}

impl Optimizer {
    pub fn learning_rate(&self) -> f64 {
        match *self {
            Optimizer::Adam { learning_rate } | Optimizer::Sgd { learning_rate } => learning_rate,
        }
    }
}

/// A preprocessed mini-batch: `(N, 3, H, W)` inputs and their labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array4<f32>,
    pub labels: Vec<Label>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Loss and accuracy accumulated over one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchMetrics {
    /// Sum of per-example (weighted) losses.
    pub loss_sum: f64,
    pub correct: usize,
    pub count: usize,
}

impl BatchMetrics {
    pub fn merge(&mut self, other: BatchMetrics) {
        self.loss_sum += other.loss_sum;
        self.correct += other.correct;
        self.count += other.count;
    }

    pub fn loss(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.loss_sum / self.count as f64) as f32
        }
    }

    pub fn accuracy(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            self.correct as f32 / self.count as f32
        }
    }

    /// Unweighted metrics of `probabilities` against `labels`.
    pub fn score(probabilities: &[f32], labels: &[Label]) -> Self {
        let mut metrics = BatchMetrics::default();
        for (&p, &label) in probabilities.iter().zip(labels) {
            metrics.loss_sum += binary_cross_entropy(p, label.target()) as f64;
            metrics.correct += usize::from((p >= 0.5) == (label == Label::User));
            metrics.count += 1;
        }
        metrics
    }
}

/// Binary cross-entropy of a single probability against a 0/1 target.
pub fn binary_cross_entropy(p: f32, target: f32) -> f32 {
    let p = p.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON);
    -(target * p.ln() + (1.0 - target) * (1.0 - p).ln())
}

/// Check a batch against the `(N, 3, H, W)` layout a model expects.
pub fn check_input(inputs: &ArrayView4<f32>, shape: InputShape) -> Result<(), ClassifierError> {
    let actual = inputs.shape();
    let expected = [
        actual[0],
        InputShape::CHANNELS,
        shape.height as usize,
        shape.width as usize,
    ];
    if actual != expected {
        return Err(ClassifierError::Shape {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

/// Inference side of a model: one sigmoid probability per input.
pub trait Scorer: Send {
    fn input_shape(&self) -> InputShape;

    /// Pixel normalization inputs must be prepared with.
    fn normalization(&self) -> Normalization;

    /// Probability of the `user` class for each example in the batch.
    fn predict(&mut self, inputs: ArrayView4<f32>) -> Result<Vec<f32>, ClassifierError>;
}

/// Training side of a model: a frozen-able backbone under a small head,
/// trained with binary cross-entropy.
pub trait TrainableClassifier: Scorer {
    /// Freeze (`false`) or unfreeze (`true`) the backbone parameters.
    fn set_backbone_trainable(&mut self, trainable: bool);

    fn backbone_trainable(&self) -> bool;

    /// Select the optimizer, resetting its state.
    fn compile(&mut self, optimizer: Optimizer);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);

    /// One optimizer step over `batch`. Returned loss is class-weighted.
    fn train_batch(
        &mut self,
        batch: &Batch,
        class_weights: Option<&ClassWeights>,
    ) -> Result<BatchMetrics, ClassifierError>;

    /// Serialize weights in the backend's artifact format.
    fn to_bytes(&self) -> Result<Vec<u8>, ClassifierError>;

    /// Replace weights with a previous [`to_bytes`](Self::to_bytes) snapshot.
    fn restore_bytes(&mut self, bytes: &[u8]) -> Result<(), ClassifierError>;
}

/// Factory for a family of classifiers.
pub trait ClassifierBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Build a fresh model with its backbone frozen.
    fn build(
        &self,
        shape: InputShape,
        normalization: Normalization,
        head: &HeadConfig,
        seed: Option<u64>,
    ) -> Result<Box<dyn TrainableClassifier>, ClassifierError>;

    /// Load a persisted artifact for inference.
    fn load(&self, path: &Path) -> Result<Box<dyn Scorer>, ClassifierError>;
}

/// Load an artifact, routing `.onnx` files to ONNX Runtime and everything
/// else to `backend`. ONNX graphs carry no preprocessing metadata, so they
/// take `onnx_shape` and `onnx_normalization` from configuration.
pub fn load_scorer(
    path: &Path,
    backend: &dyn ClassifierBackend,
    onnx_shape: InputShape,
    onnx_normalization: Normalization,
) -> Result<Box<dyn Scorer>, ClassifierError> {
    let is_onnx = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("onnx"))
        .unwrap_or(false);
    if is_onnx {
        Ok(Box::new(crate::onnx::OnnxScorer::load(
            path,
            onnx_shape,
            onnx_normalization,
        )?))
    } else {
        backend.load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_bce_perfect_and_wrong() {
        assert!(binary_cross_entropy(1.0, 1.0) < 1e-5);
        assert!(binary_cross_entropy(0.0, 0.0) < 1e-5);
        assert!(binary_cross_entropy(0.0, 1.0) > 15.0);
        assert!((binary_cross_entropy(0.5, 1.0) - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_score_counts_threshold_inclusive() {
        let labels = [Label::User, Label::NotUser, Label::NotUser];
        let m = BatchMetrics::score(&[0.5, 0.2, 0.9], &labels);
        assert_eq!(m.count, 3);
        assert_eq!(m.correct, 2);
        assert!((m.accuracy() - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_metrics_merge() {
        let mut a = BatchMetrics { loss_sum: 1.0, correct: 1, count: 2 };
        a.merge(BatchMetrics { loss_sum: 2.0, correct: 2, count: 2 });
        assert_eq!(a.count, 4);
        assert!((a.loss() - 0.75).abs() < 1e-6);
        assert!((a.accuracy() - 0.75).abs() < 1e-6);
        assert_eq!(BatchMetrics::default().loss(), 0.0);
    }

    #[test]
    fn test_check_input() {
        let ok = Array4::<f32>::zeros((2, 3, 8, 6));
        assert!(check_input(&ok.view(), InputShape::new(8, 6)).is_ok());
        let swapped = Array4::<f32>::zeros((2, 3, 6, 8));
        assert!(matches!(
            check_input(&swapped.view(), InputShape::new(8, 6)),
            Err(ClassifierError::Shape { .. })
        ));
    }
}
