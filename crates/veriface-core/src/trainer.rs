//! Two-phase training of a per-user classifier.
//!
//! ```text
//! Init → BuildSequences → ComputeClassWeights → BuildModel
//!      → PhaseOneWarmup → PhaseTwoFinetune → Persist → Done
//! ```
//!
//! Phase one trains the head over a frozen backbone; phase two unfreezes the
//! backbone and continues at a lower learning rate, with epoch numbering
//! carried over from phase one. Validation-driven controls (checkpoint, early
//! stopping, plateau) are only installed when the validation split has data.

use crate::callbacks::{
    CallbackAction, CallbackError, CallbackList, EarlyStopping, EpochContext, ModelCheckpoint,
    Phase, ReduceLrOnPlateau,
};
use crate::classifier::{
    BatchMetrics, ClassifierBackend, ClassifierError, HeadConfig, Optimizer, TrainableClassifier,
};
use crate::config::Config;
use crate::dataset::{FaceSequence, SequenceOptions};
use crate::files;
use crate::types::{ClassWeights, Label, Split};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no training samples found under {0}")]
    NoTrainingSamples(PathBuf),
    #[error("no training images for user {user_id}")]
    NoPositiveSamples { user_id: String },
    #[error("failed to read {path}: {source}")]
    Dataset {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("model build failed: {0}")]
    ModelBuild(#[source] ClassifierError),
    #[error("{phase:?} phase failed: {source}")]
    Fit {
        phase: Phase,
        source: ClassifierError,
    },
    #[error("{phase:?} phase callback failed: {source}")]
    Callback {
        phase: Phase,
        source: CallbackError,
    },
    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Position in the training state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainStage {
    Init,
    BuildSequences,
    ComputeClassWeights,
    BuildModel,
    PhaseOneWarmup,
    PhaseTwoFinetune,
    Persist,
    Done,
}

impl TrainStage {
    pub fn as_str(self) -> &'static str {
        match self {
            TrainStage::Init => "init",
            TrainStage::BuildSequences => "build_sequences",
            TrainStage::ComputeClassWeights => "compute_class_weights",
            TrainStage::BuildModel => "build_model",
            TrainStage::PhaseOneWarmup => "phase_one_warmup",
            TrainStage::PhaseTwoFinetune => "phase_two_finetune",
            TrainStage::Persist => "persist",
            TrainStage::Done => "done",
        }
    }
}

impl fmt::Display for TrainStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub user_id: String,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub class_weights: Option<ClassWeights>,
    pub history: Vec<EpochContext>,
    pub warmup_stopped_early: bool,
    pub finetune_stopped_early: bool,
    pub best_val_accuracy: Option<f32>,
    /// Present only when a checkpoint was written during this run.
    pub best_model_path: Option<PathBuf>,
    pub final_model_path: PathBuf,
}

impl TrainReport {
    pub fn message(&self) -> String {
        let dir = self
            .final_model_path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        format!(
            "Training completed after {} epochs. Model saved at {dir}",
            self.history.len()
        )
    }
}

#[derive(Serialize)]
struct HistoryFile<'a> {
    user_id: &'a str,
    backend: &'a str,
    completed_at: DateTime<Utc>,
    class_weights: Option<ClassWeights>,
    epochs: &'a [EpochContext],
}

/// Train a classifier for `user_id` from
/// `{base_data_dir}/{train,validation}/{not_user,user_id}` and write its
/// artifacts under `{base_models_dir}/{user_id}`.
///
/// `on_stage` is called on entry to every stage.
pub fn train(
    user_id: &str,
    base_data_dir: &Path,
    base_models_dir: &Path,
    config: &Config,
    backend: &dyn ClassifierBackend,
    on_stage: &mut dyn FnMut(TrainStage),
) -> Result<TrainReport, TrainError> {
    let t = &config.training;
    on_stage(TrainStage::Init);
    tracing::info!(user_id, backend = backend.name(), "training started");

    on_stage(TrainStage::BuildSequences);
    let options = SequenceOptions {
        batch_size: t.batch_size,
        shape: t.input_shape,
        normalization: t.normalization,
        shuffle: true,
        online_augmentation: t.online_augmentation,
        seed: t.seed,
    };
    let train_root = Split::Train.root(base_data_dir);
    let mut train_seq = discover(&train_root, user_id, config, options)?;
    let val_root = Split::Validation.root(base_data_dir);
    let mut val_seq = discover(
        &val_root,
        user_id,
        config,
        SequenceOptions {
            shuffle: false,
            online_augmentation: false,
            seed: t.seed.map(|s| s.wrapping_add(1)),
            ..options
        },
    )?;

    if train_seq.is_empty() {
        return Err(TrainError::NoTrainingSamples(train_root));
    }
    let n_user = train_seq.count(Label::User);
    let n_not_user = train_seq.count(Label::NotUser);
    if n_user == 0 {
        return Err(TrainError::NoPositiveSamples {
            user_id: user_id.to_string(),
        });
    }
    let has_validation = !val_seq.is_empty();
    if !has_validation {
        tracing::warn!(
            user_id,
            dir = %val_root.display(),
            "no validation samples; checkpoint, early stopping and plateau control disabled"
        );
    }
    tracing::info!(
        user_id,
        train_user = n_user,
        train_not_user = n_not_user,
        validation = val_seq.sample_count(),
        "sequences built"
    );

    on_stage(TrainStage::ComputeClassWeights);
    let class_weights = ClassWeights::balanced(n_not_user, n_user);
    match &class_weights {
        Some(w) => tracing::info!(
            user_id,
            not_user = w.not_user,
            user = w.user,
            "using class weights"
        ),
        None => tracing::info!(user_id, "single-class training set; class weights disabled"),
    }

    on_stage(TrainStage::BuildModel);
    let head = HeadConfig {
        dropout: t.dropout,
        l2: t.l2_regularization,
    };
    let mut model = backend
        .build(t.input_shape, t.normalization, &head, t.seed)
        .map_err(TrainError::ModelBuild)?;
    model.set_backbone_trainable(false);

    let models_dir = base_models_dir.join(user_id);
    std::fs::create_dir_all(&models_dir).map_err(|source| TrainError::Persist {
        path: models_dir.clone(),
        source,
    })?;
    let best_path = models_dir.join(&config.verification.best_model_filename);
    let final_path = models_dir.join(&t.final_model_filename);
    // A checkpoint from an earlier run would outrank this run's final model.
    if best_path.exists() {
        if let Err(e) = std::fs::remove_file(&best_path) {
            tracing::warn!(
                path = %best_path.display(),
                error = %e,
                "failed to remove stale checkpoint"
            );
        }
    }

    let mut callbacks = CallbackList::new();
    if has_validation {
        callbacks.push(ModelCheckpoint::new(&best_path));
        callbacks.push(EarlyStopping::new(t.early_stopping_patience, 0.0).with_restore_best());
        callbacks.push(ReduceLrOnPlateau::new(
            t.plateau_factor,
            t.plateau_patience,
            t.plateau_min_delta,
            t.min_learning_rate,
        ));
    }

    let mut history = Vec::new();
    let mut fit_ctx = Fit {
        train: &mut train_seq,
        validation: has_validation.then_some(&mut val_seq),
        class_weights: class_weights.as_ref(),
        callbacks: &mut callbacks,
        history: &mut history,
    };

    on_stage(TrainStage::PhaseOneWarmup);
    tracing::info!(user_id, epochs = t.initial_epochs, "phase one: training head");
    model.compile(Optimizer::Adam {
        learning_rate: t.learning_rate_initial,
    });
    let warmup_stopped_early = fit_ctx.run(model.as_mut(), Phase::Warmup, 0, t.initial_epochs)?;

    on_stage(TrainStage::PhaseTwoFinetune);
    let start_epoch = fit_ctx.history.last().map(|e| e.epoch + 1).unwrap_or(0);
    tracing::info!(user_id, start_epoch, epochs = t.fine_tune_epochs, "phase two: fine-tuning");
    model.set_backbone_trainable(true);
    model.compile(Optimizer::Adam {
        learning_rate: t.learning_rate_finetune,
    });
    let finetune_stopped_early =
        fit_ctx.run(model.as_mut(), Phase::Finetune, start_epoch, t.fine_tune_epochs)?;

    on_stage(TrainStage::Persist);
    let bytes = model.to_bytes().map_err(|e| TrainError::Persist {
        path: final_path.clone(),
        source: std::io::Error::other(e),
    })?;
    files::write_atomic(&final_path, &bytes).map_err(|source| TrainError::Persist {
        path: final_path.clone(),
        source,
    })?;
    tracing::info!(user_id, path = %final_path.display(), "final model saved");

    let history_path = models_dir.join(&t.history_filename);
    let record = HistoryFile {
        user_id,
        backend: backend.name(),
        completed_at: Utc::now(),
        class_weights,
        epochs: &history,
    };
    match serde_json::to_vec_pretty(&record) {
        Ok(json) => {
            if let Err(e) = files::write_atomic(&history_path, &json) {
                tracing::warn!(
                    path = %history_path.display(),
                    error = %e,
                    "failed to write training history"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize training history"),
    }

    let best_model_path = best_path.is_file().then_some(best_path);
    if best_model_path.is_none() {
        tracing::warn!(
            user_id,
            "no best checkpoint written; verification will use the final model"
        );
    }
    let best_val_accuracy = history
        .iter()
        .filter_map(|e| e.val_accuracy)
        .fold(None, |best: Option<f32>, v| Some(best.map_or(v, |b| b.max(v))));

    on_stage(TrainStage::Done);
    let report = TrainReport {
        user_id: user_id.to_string(),
        train_samples: train_seq.sample_count(),
        validation_samples: val_seq.sample_count(),
        class_weights,
        history,
        warmup_stopped_early,
        finetune_stopped_early,
        best_val_accuracy,
        best_model_path,
        final_model_path: final_path,
    };
    tracing::info!(
        user_id,
        epochs = report.history.len(),
        ?best_val_accuracy,
        "training completed"
    );
    Ok(report)
}

fn discover(
    root: &Path,
    user_id: &str,
    config: &Config,
    options: SequenceOptions,
) -> Result<FaceSequence, TrainError> {
    FaceSequence::discover(root, user_id, &config.split.allowed_extensions, options).map_err(
        |source| TrainError::Dataset {
            path: root.to_path_buf(),
            source,
        },
    )
}

/// Mutable state shared by both phases.
struct Fit<'a> {
    train: &'a mut FaceSequence,
    validation: Option<&'a mut FaceSequence>,
    class_weights: Option<&'a ClassWeights>,
    callbacks: &'a mut CallbackList,
    history: &'a mut Vec<EpochContext>,
}

impl Fit<'_> {
    /// Run up to `epochs` epochs numbered from `initial_epoch`. Returns true
    /// if a callback stopped the phase early.
    fn run(
        &mut self,
        model: &mut dyn TrainableClassifier,
        phase: Phase,
        initial_epoch: usize,
        epochs: usize,
    ) -> Result<bool, TrainError> {
        let callback_err = |source| TrainError::Callback { phase, source };
        let fit_err = |source| TrainError::Fit { phase, source };

        self.callbacks.on_train_begin(model).map_err(callback_err)?;
        for epoch in initial_epoch..initial_epoch + epochs {
            let mut metrics = BatchMetrics::default();
            for index in 0..self.train.len() {
                let batch = self.train.batch(index);
                if batch.is_empty() {
                    continue;
                }
                let step = model.train_batch(&batch, self.class_weights).map_err(fit_err)?;
                tracing::debug!(epoch, batch = index, loss = step.loss(), "batch done");
                metrics.merge(step);
            }
            self.train.on_epoch_end();
            if metrics.count == 0 {
                return Err(TrainError::Fit {
                    phase,
                    source: ClassifierError::Inference("no readable training images".into()),
                });
            }

            let validation = match self.validation.as_deref_mut() {
                Some(seq) => Some(evaluate(model, seq).map_err(fit_err)?),
                None => None,
            }
            .filter(|m| m.count > 0);

            let ctx = EpochContext {
                epoch,
                phase,
                loss: metrics.loss(),
                accuracy: metrics.accuracy(),
                val_loss: validation.map(|m| m.loss()),
                val_accuracy: validation.map(|m| m.accuracy()),
                learning_rate: model.learning_rate(),
            };
            tracing::info!(
                epoch,
                ?phase,
                loss = ctx.loss,
                accuracy = ctx.accuracy,
                val_loss = ?ctx.val_loss,
                val_accuracy = ?ctx.val_accuracy,
                lr = ctx.learning_rate,
                "epoch done"
            );
            self.history.push(ctx);

            let action = self.callbacks.on_epoch_end(&ctx, model).map_err(callback_err)?;
            if action == CallbackAction::Stop {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn evaluate(
    model: &mut dyn TrainableClassifier,
    seq: &mut FaceSequence,
) -> Result<BatchMetrics, ClassifierError> {
    let mut metrics = BatchMetrics::default();
    for index in 0..seq.len() {
        let batch = seq.batch(index);
        if batch.is_empty() {
            continue;
        }
        let probabilities = model.predict(batch.inputs.view())?;
        metrics.merge(BatchMetrics::score(&probabilities, &batch.labels));
    }
    Ok(metrics)
}
