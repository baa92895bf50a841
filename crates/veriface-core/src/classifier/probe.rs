//! Built-in classifier backend: a pooled-feature probe.
//!
//! Backbone: adaptive average pooling of each channel onto a `grid × grid`
//! lattice, per-sample standardization, then one dense ReLU layer. Head:
//! dropout, a single sigmoid unit, L2 on the head kernel. Small enough to
//! train on CPU in the enrollment job, and it exposes the same
//! freeze/unfreeze surface a pretrained backbone would.
//!
//! Artifacts are JSON.

use super::{
    binary_cross_entropy, check_input, Batch, BatchMetrics, ClassifierBackend, ClassifierError,
    HeadConfig, Optimizer, Scorer, TrainableClassifier,
};
use crate::preprocess::Normalization;
use crate::types::{seeded_rng, ClassWeights, InputShape};
use ndarray::{s, Array1, Array2, ArrayView4, Axis};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

const ARTIFACT_FORMAT: &str = "veriface-probe";
const ARTIFACT_VERSION: u32 = 2;

pub const DEFAULT_GRID: usize = 8;
pub const DEFAULT_HIDDEN: usize = 64;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f32 = 1e-7;
const FEATURE_EPSILON: f32 = 1e-6;

/// Builds and loads [`LinearProbe`] models.
#[derive(Debug, Clone, Copy)]
pub struct ProbeBackend {
    pub grid: usize,
    pub hidden: usize,
}

impl Default for ProbeBackend {
    fn default() -> Self {
        Self {
            grid: DEFAULT_GRID,
            hidden: DEFAULT_HIDDEN,
        }
    }
}

impl ClassifierBackend for ProbeBackend {
    fn name(&self) -> &str {
        "probe"
    }

    fn build(
        &self,
        shape: InputShape,
        normalization: Normalization,
        head: &HeadConfig,
        seed: Option<u64>,
    ) -> Result<Box<dyn TrainableClassifier>, ClassifierError> {
        let probe = LinearProbe::new(shape, self.grid, self.hidden, *head, seed)?;
        Ok(Box::new(probe.with_normalization(normalization)))
    }

    fn load(&self, path: &Path) -> Result<Box<dyn Scorer>, ClassifierError> {
        if !path.is_file() {
            return Err(ClassifierError::NotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        Ok(Box::new(LinearProbe::from_bytes(&bytes)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProbeArtifact {
    format: String,
    version: u32,
    input_shape: InputShape,
    normalization: Normalization,
    grid: usize,
    hidden: usize,
    dropout: f32,
    l2: f32,
    backbone_w: Vec<f32>,
    backbone_b: Vec<f32>,
    head_w: Vec<f32>,
    head_b: f32,
}

#[derive(Debug, Clone)]
struct Params {
    /// `(hidden, features)`
    backbone_w: Array2<f32>,
    backbone_b: Array1<f32>,
    head_w: Array1<f32>,
    head_b: f32,
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Moments {
    fn zeros(len: usize) -> Self {
        Self {
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }
}

#[derive(Debug, Clone)]
struct OptimizerState {
    step: u64,
    backbone_w: Moments,
    backbone_b: Moments,
    head_w: Moments,
    head_b: Moments,
}

impl OptimizerState {
    fn new(features: usize, hidden: usize) -> Self {
        Self {
            step: 0,
            backbone_w: Moments::zeros(features * hidden),
            backbone_b: Moments::zeros(hidden),
            head_w: Moments::zeros(hidden),
            head_b: Moments::zeros(1),
        }
    }
}

/// Forward activations kept for the backward pass.
struct Forward {
    features: Array2<f32>,
    pre: Array2<f32>,
    mask: Array2<f32>,
    dropped: Array2<f32>,
    probabilities: Array1<f32>,
}

pub struct LinearProbe {
    shape: InputShape,
    normalization: Normalization,
    grid: usize,
    hidden: usize,
    head: HeadConfig,
    params: Params,
    trainable: bool,
    optimizer: Optimizer,
    state: OptimizerState,
    rng: ChaCha8Rng,
}

impl LinearProbe {
    pub fn new(
        shape: InputShape,
        grid: usize,
        hidden: usize,
        head: HeadConfig,
        seed: Option<u64>,
    ) -> Result<Self, ClassifierError> {
        if shape.height == 0 || shape.width == 0 {
            return Err(ClassifierError::Build(format!(
                "input shape must be non-empty, got {}x{}",
                shape.height, shape.width
            )));
        }
        if grid == 0 || hidden == 0 {
            return Err(ClassifierError::Build("grid and hidden must be positive".into()));
        }
        if !(0.0..1.0).contains(&head.dropout) {
            return Err(ClassifierError::Build(format!(
                "dropout must be in [0, 1), got {}",
                head.dropout
            )));
        }

        let mut rng = seeded_rng(seed);
        let features = feature_len(grid);
        let limit = (6.0 / (features + hidden) as f32).sqrt();
        let backbone_w =
            Array2::from_shape_fn((hidden, features), |_| rng.gen_range(-limit..limit));
        let limit = (6.0 / (hidden + 1) as f32).sqrt();
        let head_w = Array1::from_shape_fn(hidden, |_| rng.gen_range(-limit..limit));

        Ok(Self {
            shape,
            normalization: Normalization::VggFace,
            grid,
            hidden,
            head,
            params: Params {
                backbone_w,
                backbone_b: Array1::zeros(hidden),
                head_w,
                head_b: 0.0,
            },
            trainable: false,
            optimizer: Optimizer::Adam { learning_rate: 1e-3 },
            state: OptimizerState::new(features, hidden),
            rng,
        })
    }

    /// Pixel normalization the model expects; stored with its weights.
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClassifierError> {
        let artifact: ProbeArtifact = serde_json::from_slice(bytes)?;
        if artifact.format != ARTIFACT_FORMAT {
            return Err(ClassifierError::Format(format!(
                "unexpected format {:?}",
                artifact.format
            )));
        }
        if artifact.version != ARTIFACT_VERSION {
            return Err(ClassifierError::Format(format!(
                "unsupported version {}",
                artifact.version
            )));
        }
        let head = HeadConfig {
            dropout: artifact.dropout,
            l2: artifact.l2,
        };
        let mut probe = Self::new(
            artifact.input_shape,
            artifact.grid,
            artifact.hidden,
            head,
            Some(0),
        )?
        .with_normalization(artifact.normalization);
        probe.params = params_from_artifact(artifact)?;
        Ok(probe)
    }

    fn artifact(&self) -> ProbeArtifact {
        ProbeArtifact {
            format: ARTIFACT_FORMAT.to_string(),
            version: ARTIFACT_VERSION,
            input_shape: self.shape,
            normalization: self.normalization,
            grid: self.grid,
            hidden: self.hidden,
            dropout: self.head.dropout,
            l2: self.head.l2,
            backbone_w: self.params.backbone_w.iter().copied().collect(),
            backbone_b: self.params.backbone_b.to_vec(),
            head_w: self.params.head_w.to_vec(),
            head_b: self.params.head_b,
        }
    }

    fn forward(&mut self, inputs: ArrayView4<f32>, training: bool) -> Forward {
        let features = pool_features(inputs, self.grid);
        let mut pre = features.dot(&self.params.backbone_w.t());
        pre += &self.params.backbone_b;
        let act = pre.mapv(|v| v.max(0.0));

        let keep = 1.0 - self.head.dropout;
        let mask = if training && self.head.dropout > 0.0 {
            let rng = &mut self.rng;
            Array2::from_shape_fn(act.dim(), |_| {
                if rng.gen::<f32>() < keep {
                    1.0 / keep
                } else {
                    0.0
                }
            })
        } else {
            Array2::ones(act.dim())
        };
        let dropped = &act * &mask;
        let probabilities = (dropped.dot(&self.params.head_w) + self.params.head_b).mapv(sigmoid);

        Forward {
            features,
            pre,
            mask,
            dropped,
            probabilities,
        }
    }
}

impl Scorer for LinearProbe {
    fn input_shape(&self) -> InputShape {
        self.shape
    }

    fn normalization(&self) -> Normalization {
        self.normalization
    }

    fn predict(&mut self, inputs: ArrayView4<f32>) -> Result<Vec<f32>, ClassifierError> {
        check_input(&inputs, self.shape)?;
        let probabilities = self.forward(inputs, false).probabilities.to_vec();
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(ClassifierError::Inference("non-finite probability".into()));
        }
        Ok(probabilities)
    }
}

impl TrainableClassifier for LinearProbe {
    fn set_backbone_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    fn backbone_trainable(&self) -> bool {
        self.trainable
    }

    fn compile(&mut self, optimizer: Optimizer) {
        self.optimizer = optimizer;
        self.state = OptimizerState::new(feature_len(self.grid), self.hidden);
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.optimizer = match self.optimizer {
            Optimizer::Adam { .. } => Optimizer::Adam { learning_rate },
            Optimizer::Sgd { .. } => Optimizer::Sgd { learning_rate },
        };
    }

    fn train_batch(
        &mut self,
        batch: &Batch,
        class_weights: Option<&ClassWeights>,
    ) -> Result<BatchMetrics, ClassifierError> {
        let n = batch.len();
        if n == 0 {
            return Ok(BatchMetrics::default());
        }
        check_input(&batch.inputs.view(), self.shape)?;
        if batch.inputs.len_of(Axis(0)) != n {
            return Err(ClassifierError::Shape {
                expected: vec![n],
                actual: vec![batch.inputs.len_of(Axis(0))],
            });
        }

        let fwd = self.forward(batch.inputs.view(), true);

        let regularization = self.head.l2 * self.params.head_w.mapv(|w| w * w).sum();
        let mut metrics = BatchMetrics::default();
        let mut dz = Array1::<f32>::zeros(n);
        for (i, &label) in batch.labels.iter().enumerate() {
            let p = fwd.probabilities[i];
            let y = label.target();
            let weight = class_weights.map(|w| w.for_label(label)).unwrap_or(1.0);
            metrics.loss_sum += (weight * binary_cross_entropy(p, y) + regularization) as f64;
            metrics.correct += usize::from((p >= 0.5) == (y >= 0.5));
            metrics.count += 1;
            dz[i] = weight * (p - y) / n as f32;
        }
        if !metrics.loss_sum.is_finite() {
            return Err(ClassifierError::Inference("loss diverged".into()));
        }

        let grad_head_w = fwd.dropped.t().dot(&dz) + &(&self.params.head_w * (2.0 * self.head.l2));
        let grad_head_b = dz.sum();

        let backbone_grads = self.trainable.then(|| {
            let relu_grad = fwd.pre.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
            let d_pre =
                &dz.view().insert_axis(Axis(1)) * &self.params.head_w * &fwd.mask * &relu_grad;
            (d_pre.t().dot(&fwd.features), d_pre.sum_axis(Axis(0)))
        });

        self.state.step += 1;
        let (optimizer, step) = (self.optimizer, self.state.step);
        apply_update(
            self.params.head_w.iter_mut(),
            grad_head_w.iter(),
            &mut self.state.head_w,
            optimizer,
            step,
        );
        apply_update(
            std::iter::once(&mut self.params.head_b),
            std::iter::once(&grad_head_b),
            &mut self.state.head_b,
            optimizer,
            step,
        );
        if let Some((grad_w, grad_b)) = backbone_grads {
            apply_update(
                self.params.backbone_w.iter_mut(),
                grad_w.iter(),
                &mut self.state.backbone_w,
                optimizer,
                step,
            );
            apply_update(
                self.params.backbone_b.iter_mut(),
                grad_b.iter(),
                &mut self.state.backbone_b,
                optimizer,
                step,
            );
        }

        Ok(metrics)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, ClassifierError> {
        Ok(serde_json::to_vec(&self.artifact())?)
    }

    fn restore_bytes(&mut self, bytes: &[u8]) -> Result<(), ClassifierError> {
        let artifact: ProbeArtifact = serde_json::from_slice(bytes)?;
        let same_architecture = artifact.input_shape == self.shape
            && artifact.normalization == self.normalization
            && artifact.grid == self.grid
            && artifact.hidden == self.hidden;
        if !same_architecture {
            return Err(ClassifierError::Format(
                "snapshot does not match model architecture".into(),
            ));
        }
        self.params = params_from_artifact(artifact)?;
        Ok(())
    }
}

fn params_from_artifact(artifact: ProbeArtifact) -> Result<Params, ClassifierError> {
    let features = feature_len(artifact.grid);
    let hidden = artifact.hidden;
    let backbone_w = Array2::from_shape_vec((hidden, features), artifact.backbone_w)
        .map_err(|e| ClassifierError::Format(format!("backbone kernel: {e}")))?;
    if artifact.backbone_b.len() != hidden || artifact.head_w.len() != hidden {
        return Err(ClassifierError::Format(format!(
            "expected {hidden} hidden units, got bias {} / head {}",
            artifact.backbone_b.len(),
            artifact.head_w.len()
        )));
    }
    Ok(Params {
        backbone_w,
        backbone_b: Array1::from(artifact.backbone_b),
        head_w: Array1::from(artifact.head_w),
        head_b: artifact.head_b,
    })
}

fn feature_len(grid: usize) -> usize {
    InputShape::CHANNELS * grid * grid
}

fn apply_update<'p, 'g>(
    params: impl Iterator<Item = &'p mut f32>,
    grads: impl Iterator<Item = &'g f32>,
    moments: &mut Moments,
    optimizer: Optimizer,
    step: u64,
) {
    match optimizer {
        Optimizer::Sgd { learning_rate } => {
            let lr = learning_rate as f32;
            for (p, g) in params.zip(grads) {
                *p -= lr * g;
            }
        }
        Optimizer::Adam { learning_rate } => {
            let t = step.min(i32::MAX as u64) as i32;
            let correction = (1.0 - ADAM_BETA2.powi(t)).sqrt() / (1.0 - ADAM_BETA1.powi(t));
            let lr = (learning_rate * correction) as f32;
            let (b1, b2) = (ADAM_BETA1 as f32, ADAM_BETA2 as f32);
            let slots = moments.m.iter_mut().zip(moments.v.iter_mut());
            for ((p, g), (m, v)) in params.zip(grads).zip(slots) {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *p -= lr * *m / (v.sqrt() + ADAM_EPSILON);
            }
        }
    }
}

/// Row `(i, c·g² + gy·g + gx)` is the mean of channel `c` over cell
/// `(gy, gx)` of example `i`, standardized per example.
fn pool_features(inputs: ArrayView4<f32>, grid: usize) -> Array2<f32> {
    let (n, channels, height, width) = inputs.dim();
    let mut out = Array2::<f32>::zeros((n, channels * grid * grid));
    for i in 0..n {
        for c in 0..channels {
            for gy in 0..grid {
                let (y0, y1) = cell_bounds(gy, grid, height);
                for gx in 0..grid {
                    let (x0, x1) = cell_bounds(gx, grid, width);
                    let cell = inputs.slice(s![i, c, y0..y1, x0..x1]);
                    out[[i, (c * grid + gy) * grid + gx]] = cell.mean().unwrap_or(0.0);
                }
            }
        }
    }
    for mut row in out.rows_mut() {
        let mean = row.mean().unwrap_or(0.0);
        let var = row.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0);
        let std = var.sqrt().max(FEATURE_EPSILON);
        row.mapv_inplace(|v| (v - mean) / std);
    }
    out
}

/// Half-open range of cell `i` out of `cells` over `len` pixels. Never empty.
fn cell_bounds(i: usize, cells: usize, len: usize) -> (usize, usize) {
    let start = i * len / cells;
    let end = ((i + 1) * len).div_ceil(cells).max(start + 1).min(len);
    (start, end)
}

fn sigmoid(z: f32) -> f32 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Label;
    use ndarray::Array4;

    const SHAPE: InputShape = InputShape { height: 8, width: 8 };

    fn head() -> HeadConfig {
        HeadConfig { dropout: 0.0, l2: 0.0 }
    }

    /// Uniform-colour examples: users lean red, impostors lean blue.
    fn color_batch(n_user: usize, n_not: usize) -> Batch {
        let n = n_user + n_not;
        let mut inputs = Array4::<f32>::zeros((n, 3, 8, 8));
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let user = i < n_user;
            let jitter = (i % 5) as f32 * 0.05;
            let (r, g, b) = if user {
                (0.8 - jitter, -0.6, -0.7)
            } else {
                (-0.7, -0.5, 0.8 - jitter)
            };
            // Left half carries a second pattern so features aren't constant.
            for y in 0..8 {
                for x in 0..8 {
                    let edge = if x < 4 { 0.2 } else { -0.2 };
                    inputs[[i, 0, y, x]] = r + edge;
                    inputs[[i, 1, y, x]] = g;
                    inputs[[i, 2, y, x]] = b - edge;
                }
            }
            labels.push(if user { Label::User } else { Label::NotUser });
        }
        Batch { inputs, labels }
    }

    #[test]
    fn test_predict_returns_probability_per_example() {
        let mut model = LinearProbe::new(SHAPE, 4, 16, head(), Some(1)).unwrap();
        let batch = color_batch(3, 2);
        let p = model.predict(batch.inputs.view()).unwrap();
        assert_eq!(p.len(), 5);
        assert!(p.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn test_predict_rejects_wrong_shape() {
        let mut model = LinearProbe::new(SHAPE, 4, 16, head(), Some(1)).unwrap();
        let wrong = Array4::<f32>::zeros((1, 3, 8, 9));
        assert!(matches!(
            model.predict(wrong.view()),
            Err(ClassifierError::Shape { .. })
        ));
    }

    #[test]
    fn test_build_rejects_full_dropout() {
        let head = HeadConfig { dropout: 1.0, l2: 0.0 };
        assert!(matches!(
            LinearProbe::new(SHAPE, 4, 16, head, None),
            Err(ClassifierError::Build(_))
        ));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = LinearProbe::new(SHAPE, 4, 16, head(), Some(9)).unwrap();
        let b = LinearProbe::new(SHAPE, 4, 16, head(), Some(9)).unwrap();
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }

    #[test]
    fn test_frozen_backbone_is_not_updated() {
        let mut model = LinearProbe::new(SHAPE, 4, 16, head(), Some(2)).unwrap();
        model.compile(Optimizer::Adam { learning_rate: 1e-2 });
        let before = model.params.backbone_w.clone();
        let head_before = model.params.head_w.clone();
        model.train_batch(&color_batch(4, 4), None).unwrap();
        assert_eq!(model.params.backbone_w, before);
        assert_ne!(model.params.head_w, head_before);
    }

    #[test]
    fn test_unfrozen_backbone_is_updated() {
        let mut model = LinearProbe::new(SHAPE, 4, 16, head(), Some(2)).unwrap();
        model.set_backbone_trainable(true);
        model.compile(Optimizer::Adam { learning_rate: 1e-2 });
        let before = model.params.backbone_w.clone();
        model.train_batch(&color_batch(4, 4), None).unwrap();
        assert_ne!(model.params.backbone_w, before);
    }

    #[test]
    fn test_training_separates_classes() {
        let head = HeadConfig { dropout: 0.2, l2: 1e-4 };
        let mut model = LinearProbe::new(SHAPE, 4, 32, head, Some(3)).unwrap();
        model.compile(Optimizer::Adam { learning_rate: 5e-2 });
        let batch = color_batch(6, 6);
        let first = model.train_batch(&batch, None).unwrap().loss();
        let mut last = first;
        for _ in 0..150 {
            last = model.train_batch(&batch, None).unwrap().loss();
        }
        assert!(last < first);
        let p = model.predict(batch.inputs.view()).unwrap();
        let metrics = BatchMetrics::score(&p, &batch.labels);
        assert_eq!(metrics.accuracy(), 1.0);
    }

    #[test]
    fn test_class_weights_scale_loss() {
        let batch = color_batch(2, 6);
        let mut a = LinearProbe::new(SHAPE, 4, 16, head(), Some(4)).unwrap();
        let mut b = LinearProbe::new(SHAPE, 4, 16, head(), Some(4)).unwrap();
        let unweighted = a.train_batch(&batch, None).unwrap();
        let weights = ClassWeights { not_user: 2.0, user: 2.0 };
        let weighted = b.train_batch(&batch, Some(&weights)).unwrap();
        assert!((weighted.loss() - 2.0 * unweighted.loss()).abs() < 1e-4);
    }

    #[test]
    fn test_restore_bytes_rewinds_weights() {
        let mut model = LinearProbe::new(SHAPE, 4, 16, head(), Some(5)).unwrap();
        model.compile(Optimizer::Adam { learning_rate: 1e-1 });
        let batch = color_batch(3, 3);
        let snapshot = model.to_bytes().unwrap();
        let before = model.predict(batch.inputs.view()).unwrap();
        for _ in 0..5 {
            model.train_batch(&batch, None).unwrap();
        }
        assert_ne!(model.predict(batch.inputs.view()).unwrap(), before);
        model.restore_bytes(&snapshot).unwrap();
        assert_eq!(model.predict(batch.inputs.view()).unwrap(), before);
    }

    #[test]
    fn test_restore_rejects_other_architecture() {
        let other = LinearProbe::new(SHAPE, 4, 8, head(), Some(5)).unwrap();
        let mut model = LinearProbe::new(SHAPE, 4, 16, head(), Some(5)).unwrap();
        assert!(matches!(
            model.restore_bytes(&other.to_bytes().unwrap()),
            Err(ClassifierError::Format(_))
        ));
    }

    #[test]
    fn test_backend_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_model.json");
        let model = LinearProbe::new(SHAPE, 4, 16, head(), Some(6)).unwrap();
        std::fs::write(&path, model.to_bytes().unwrap()).unwrap();

        let backend = ProbeBackend { grid: 4, hidden: 16 };
        let mut loaded = backend.load(&path).unwrap();
        assert_eq!(loaded.input_shape(), SHAPE);
        let batch = color_batch(1, 1);
        assert_eq!(loaded.predict(batch.inputs.view()).unwrap().len(), 2);

        assert!(matches!(
            backend.load(&dir.path().join("missing.json")),
            Err(ClassifierError::NotFound(_))
        ));
    }

    #[test]
    fn test_normalization_travels_with_artifact() {
        let backend = ProbeBackend { grid: 4, hidden: 16 };
        let model = backend
            .build(SHAPE, Normalization::Symmetric, &head(), Some(7))
            .unwrap();
        assert_eq!(model.normalization(), Normalization::Symmetric);

        let bytes = model.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["normalization"], "symmetric");
        let loaded = LinearProbe::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.normalization(), Normalization::Symmetric);

        let default = LinearProbe::new(SHAPE, 4, 16, head(), Some(7)).unwrap();
        assert_eq!(default.normalization(), Normalization::VggFace);
    }

    #[test]
    fn test_load_rejects_foreign_json() {
        assert!(matches!(
            LinearProbe::from_bytes(br#"{"format":"other"}"#),
            Err(ClassifierError::Json(_))
        ));
    }

    #[test]
    fn test_compile_sets_learning_rate() {
        let mut model = LinearProbe::new(SHAPE, 4, 16, head(), None).unwrap();
        model.compile(Optimizer::Adam { learning_rate: 5e-5 });
        assert_eq!(model.learning_rate(), 5e-5);
        model.set_learning_rate(1e-6);
        assert_eq!(model.learning_rate(), 1e-6);
    }

    #[test]
    fn test_cell_bounds_cover_small_inputs() {
        for i in 0..8 {
            let (a, b) = cell_bounds(i, 8, 4);
            assert!(a < b && b <= 4);
        }
        assert_eq!(cell_bounds(0, 4, 8), (0, 2));
        assert_eq!(cell_bounds(3, 4, 8), (6, 8));
    }

    #[test]
    fn test_sigmoid_is_stable() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid(-100.0) >= 0.0);
        assert!(sigmoid(100.0) <= 1.0);
        assert!(sigmoid(-100.0).is_finite());
    }
}
