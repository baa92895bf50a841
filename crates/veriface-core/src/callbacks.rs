//! Epoch-level halting and quality controls.
//!
//! - [`ModelCheckpoint`]: persist the model when validation accuracy improves
//! - [`EarlyStopping`]: stop when validation loss stalls, restoring the best weights
//! - [`ReduceLrOnPlateau`]: shrink the learning rate when validation loss stalls
//!
//! All three watch validation metrics only; epochs without validation
//! metrics leave them untouched.

use crate::classifier::{ClassifierError, TrainableClassifier};
use crate::files;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] ClassifierError),
    #[error("failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Training phase an epoch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Warmup,
    Finetune,
}

/// Metrics of one finished epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochContext {
    /// Global epoch index, contiguous across phases.
    pub epoch: usize,
    pub phase: Phase,
    pub loss: f32,
    pub accuracy: f32,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

pub trait EpochCallback: Send {
    /// Called at the start of every phase.
    fn on_train_begin(
        &mut self,
        _model: &mut dyn TrainableClassifier,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        ctx: &EpochContext,
        model: &mut dyn TrainableClassifier,
    ) -> Result<CallbackAction, CallbackError>;

    fn name(&self) -> &str;
}

/// Runs callbacks in insertion order. Stops if any callback asks to.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn EpochCallback>>,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<C: EpochCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn on_train_begin(
        &mut self,
        model: &mut dyn TrainableClassifier,
    ) -> Result<(), CallbackError> {
        for cb in &mut self.callbacks {
            cb.on_train_begin(model)?;
        }
        Ok(())
    }

    pub fn on_epoch_end(
        &mut self,
        ctx: &EpochContext,
        model: &mut dyn TrainableClassifier,
    ) -> Result<CallbackAction, CallbackError> {
        let mut action = CallbackAction::Continue;
        for cb in &mut self.callbacks {
            if cb.on_epoch_end(ctx, model)? == CallbackAction::Stop {
                tracing::info!(callback = cb.name(), epoch = ctx.epoch, "stop requested");
                action = CallbackAction::Stop;
            }
        }
        Ok(action)
    }
}

/// Save-best-only checkpoint on validation accuracy (maximize).
///
/// The best value is kept across phases, so a later phase only overwrites
/// the artifact when it beats every earlier epoch.
#[derive(Debug)]
pub struct ModelCheckpoint {
    path: PathBuf,
    best: f32,
    saves: usize,
}

impl ModelCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            best: f32::NEG_INFINITY,
            saves: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best(&self) -> Option<f32> {
        self.best.is_finite().then_some(self.best)
    }

    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl EpochCallback for ModelCheckpoint {
    fn on_epoch_end(
        &mut self,
        ctx: &EpochContext,
        model: &mut dyn TrainableClassifier,
    ) -> Result<CallbackAction, CallbackError> {
        let Some(current) = ctx.val_accuracy else {
            return Ok(CallbackAction::Continue);
        };
        if current > self.best {
            let bytes = model.to_bytes()?;
            files::write_atomic(&self.path, &bytes).map_err(|source| CallbackError::Write {
                path: self.path.clone(),
                source,
            })?;
            tracing::info!(
                epoch = ctx.epoch,
                previous = self.best,
                val_accuracy = current,
                path = %self.path.display(),
                "validation accuracy improved, checkpoint saved"
            );
            self.best = current;
            self.saves += 1;
        }
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &str {
        "ModelCheckpoint"
    }
}

/// Stop when validation loss has not improved by more than `min_delta` for
/// `patience` epochs. State resets at every phase.
#[derive(Debug)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    restore_best: bool,
    best: f32,
    wait: usize,
    best_weights: Option<Vec<u8>>,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            restore_best: false,
            best: f32::INFINITY,
            wait: 0,
            best_weights: None,
            stopped_epoch: None,
        }
    }

    pub fn with_restore_best(mut self) -> Self {
        self.restore_best = true;
        self
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }
}

impl EpochCallback for EarlyStopping {
    fn on_train_begin(
        &mut self,
        _model: &mut dyn TrainableClassifier,
    ) -> Result<(), CallbackError> {
        self.best = f32::INFINITY;
        self.wait = 0;
        self.best_weights = None;
        self.stopped_epoch = None;
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        ctx: &EpochContext,
        model: &mut dyn TrainableClassifier,
    ) -> Result<CallbackAction, CallbackError> {
        let Some(current) = ctx.val_loss else {
            return Ok(CallbackAction::Continue);
        };
        if current < self.best - self.min_delta {
            self.best = current;
            self.wait = 0;
            if self.restore_best {
                self.best_weights = Some(model.to_bytes()?);
            }
            return Ok(CallbackAction::Continue);
        }

        self.wait += 1;
        if self.wait < self.patience {
            return Ok(CallbackAction::Continue);
        }
        self.stopped_epoch = Some(ctx.epoch);
        if let Some(weights) = &self.best_weights {
            model.restore_bytes(weights)?;
            tracing::info!(epoch = ctx.epoch, best_val_loss = self.best, "restored best weights");
        }
        tracing::info!(epoch = ctx.epoch, patience = self.patience, "early stopping");
        Ok(CallbackAction::Stop)
    }

    fn name(&self) -> &str {
        "EarlyStopping"
    }
}

/// Multiply the learning rate by `factor` after `patience` epochs without a
/// validation-loss improvement larger than `min_delta`, never going below
/// `min_lr`. State resets at every phase.
#[derive(Debug)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_delta: f32,
    min_lr: f64,
    best: f32,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize, min_delta: f32, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            min_delta,
            min_lr,
            best: f32::INFINITY,
            wait: 0,
        }
    }
}

impl EpochCallback for ReduceLrOnPlateau {
    fn on_train_begin(
        &mut self,
        _model: &mut dyn TrainableClassifier,
    ) -> Result<(), CallbackError> {
        self.best = f32::INFINITY;
        self.wait = 0;
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        ctx: &EpochContext,
        model: &mut dyn TrainableClassifier,
    ) -> Result<CallbackAction, CallbackError> {
        let Some(current) = ctx.val_loss else {
            return Ok(CallbackAction::Continue);
        };
        if current < self.best - self.min_delta {
            self.best = current;
            self.wait = 0;
            return Ok(CallbackAction::Continue);
        }

        self.wait += 1;
        if self.wait >= self.patience {
            let old = model.learning_rate();
            if old > self.min_lr {
                let new = (old * self.factor).max(self.min_lr);
                model.set_learning_rate(new);
                tracing::info!(
                    epoch = ctx.epoch,
                    old_lr = old,
                    new_lr = new,
                    "reducing learning rate"
                );
            }
            self.wait = 0;
        }
        Ok(CallbackAction::Continue)
    }

    fn name(&self) -> &str {
        "ReduceLrOnPlateau"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::probe::LinearProbe;
    use crate::classifier::{HeadConfig, Optimizer, Scorer};
    use crate::types::InputShape;
    use ndarray::Array4;

    fn model() -> LinearProbe {
        let head = HeadConfig { dropout: 0.0, l2: 0.0 };
        let mut m = LinearProbe::new(InputShape::new(4, 4), 2, 4, head, Some(11)).unwrap();
        m.compile(Optimizer::Adam { learning_rate: 1e-3 });
        m
    }

    fn ctx(epoch: usize, val_loss: Option<f32>, val_accuracy: Option<f32>) -> EpochContext {
        EpochContext {
            epoch,
            phase: Phase::Warmup,
            loss: 0.5,
            accuracy: 0.5,
            val_loss,
            val_accuracy,
            learning_rate: 1e-3,
        }
    }

    #[test]
    fn test_checkpoint_saves_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice").join("best_model.json");
        let mut m = model();
        let mut cb = ModelCheckpoint::new(&path);

        cb.on_epoch_end(&ctx(0, None, Some(0.6)), &mut m).unwrap();
        assert!(path.is_file());
        assert_eq!(cb.saves(), 1);

        cb.on_epoch_end(&ctx(1, None, Some(0.6)), &mut m).unwrap();
        cb.on_epoch_end(&ctx(2, None, Some(0.5)), &mut m).unwrap();
        assert_eq!(cb.saves(), 1);

        cb.on_epoch_end(&ctx(3, None, Some(0.8)), &mut m).unwrap();
        assert_eq!(cb.saves(), 2);
        assert_eq!(cb.best(), Some(0.8));
    }

    #[test]
    fn test_checkpoint_best_survives_new_phase() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let mut cb = ModelCheckpoint::new(dir.path().join("best.json"));
        cb.on_epoch_end(&ctx(0, None, Some(0.9)), &mut m).unwrap();
        cb.on_train_begin(&mut m).unwrap();
        cb.on_epoch_end(&ctx(1, None, Some(0.7)), &mut m).unwrap();
        assert_eq!(cb.saves(), 1);
    }

    #[test]
    fn test_checkpoint_ignores_epochs_without_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best.json");
        let mut m = model();
        let mut cb = ModelCheckpoint::new(&path);
        cb.on_epoch_end(&ctx(0, None, None), &mut m).unwrap();
        assert!(!path.exists());
        assert_eq!(cb.best(), None);
    }

    #[test]
    fn test_early_stopping_waits_for_patience() {
        let mut m = model();
        let mut cb = EarlyStopping::new(2, 0.0);
        let losses = [0.9, 0.8, 0.85, 0.8];
        let mut actions = Vec::new();
        for (epoch, &loss) in losses.iter().enumerate() {
            actions.push(cb.on_epoch_end(&ctx(epoch, Some(loss), None), &mut m).unwrap());
        }
        // 0.8 again is not an improvement over 0.8
        assert_eq!(
            actions,
            vec![
                CallbackAction::Continue,
                CallbackAction::Continue,
                CallbackAction::Continue,
                CallbackAction::Stop
            ]
        );
        assert_eq!(cb.stopped_epoch(), Some(3));
    }

    #[test]
    fn test_early_stopping_restores_best_weights() {
        let mut m = model();
        let sample_input =
            Array4::<f32>::from_shape_fn((1, 3, 4, 4), |(_, c, y, x)| (c + y * x) as f32 * 0.1);
        let mut cb = EarlyStopping::new(1, 0.0).with_restore_best();

        cb.on_epoch_end(&ctx(0, Some(0.3), None), &mut m).unwrap();
        let best_prediction = m.predict(sample_input.view()).unwrap();

        // Move the weights away from the snapshot.
        m.compile(Optimizer::Sgd { learning_rate: 10.0 });
        let batch = crate::classifier::Batch {
            inputs: sample_input.clone(),
            labels: vec![crate::types::Label::User],
        };
        m.train_batch(&batch, None).unwrap();
        assert_ne!(m.predict(sample_input.view()).unwrap(), best_prediction);

        let action = cb.on_epoch_end(&ctx(1, Some(0.5), None), &mut m).unwrap();
        assert_eq!(action, CallbackAction::Stop);
        assert_eq!(m.predict(sample_input.view()).unwrap(), best_prediction);
    }

    #[test]
    fn test_early_stopping_resets_per_phase() {
        let mut m = model();
        let mut cb = EarlyStopping::new(2, 0.0);
        cb.on_epoch_end(&ctx(0, Some(0.2), None), &mut m).unwrap();
        cb.on_epoch_end(&ctx(1, Some(0.3), None), &mut m).unwrap();
        cb.on_train_begin(&mut m).unwrap();
        // A worse loss than the previous phase's best counts as a fresh start.
        let action = cb.on_epoch_end(&ctx(2, Some(0.4), None), &mut m).unwrap();
        assert_eq!(action, CallbackAction::Continue);
    }

    #[test]
    fn test_plateau_reduces_learning_rate_to_floor() {
        let mut m = model();
        m.compile(Optimizer::Adam { learning_rate: 1e-3 });
        let mut cb = ReduceLrOnPlateau::new(0.2, 2, 1e-4, 1e-4);

        cb.on_epoch_end(&ctx(0, Some(0.5), None), &mut m).unwrap();
        cb.on_epoch_end(&ctx(1, Some(0.5), None), &mut m).unwrap();
        assert_eq!(m.learning_rate(), 1e-3);
        cb.on_epoch_end(&ctx(2, Some(0.49995), None), &mut m).unwrap();
        assert!((m.learning_rate() - 2e-4).abs() < 1e-12);

        cb.on_epoch_end(&ctx(3, Some(0.5), None), &mut m).unwrap();
        cb.on_epoch_end(&ctx(4, Some(0.5), None), &mut m).unwrap();
        assert!((m.learning_rate() - 1e-4).abs() < 1e-12);

        cb.on_epoch_end(&ctx(5, Some(0.5), None), &mut m).unwrap();
        cb.on_epoch_end(&ctx(6, Some(0.5), None), &mut m).unwrap();
        assert!((m.learning_rate() - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_list_stops_when_any_callback_stops() {
        let mut m = model();
        let mut list = CallbackList::new();
        list.push(ReduceLrOnPlateau::new(0.5, 10, 0.0, 0.0));
        list.push(EarlyStopping::new(1, 0.0));
        assert_eq!(list.len(), 2);
        list.on_train_begin(&mut m).unwrap();
        assert_eq!(
            list.on_epoch_end(&ctx(0, Some(0.4), None), &mut m).unwrap(),
            CallbackAction::Continue
        );
        assert_eq!(
            list.on_epoch_end(&ctx(1, Some(0.4), None), &mut m).unwrap(),
            CallbackAction::Stop
        );
    }
}
