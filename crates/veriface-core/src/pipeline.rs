//! Enrollment pipeline: split, augment, then train in the background.

use crate::augment::{self, AugmentReport};
use crate::classifier::ClassifierBackend;
use crate::config::Config;
use crate::jobs::{JobError, JobHandle, JobId, JobQueue, JobRecord};
use crate::partition::{self, PartitionError, SplitOutcome};
use crate::trainer;
pub use crate::types::is_valid_user_id;
use crate::verifier::{self, Verification};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid user id {0:?}")]
    InvalidUserId(String),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Returned once training has been handed to the job queue. The model is
/// not ready yet; poll the job or wait on the handle.
pub struct Initiated {
    pub job_id: JobId,
    pub handle: JobHandle,
    pub split: SplitOutcome,
    /// `None` when augmentation failed; training runs on the plain split.
    pub augmentation: Option<AugmentReport>,
    pub message: String,
}

/// Clone-safe pipeline bound to one configuration and backend.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    backend: Arc<dyn ClassifierBackend>,
    jobs: JobQueue,
}

impl Pipeline {
    pub fn new(config: Config, backend: Arc<dyn ClassifierBackend>) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            jobs: JobQueue::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// Partition and augment synchronously, then launch training.
    ///
    /// The user's job slot is reserved before the first file is touched, so
    /// a concurrent enrollment for the same user is rejected without writing
    /// anything. A partition failure releases the slot and aborts. An
    /// augmentation failure is logged and training proceeds on the
    /// un-augmented split.
    pub fn start(&self, user_id: &str, upload_dir: &Path) -> Result<Initiated, PipelineError> {
        if !is_valid_user_id(user_id) {
            return Err(PipelineError::InvalidUserId(user_id.to_string()));
        }
        let reservation = self.jobs.reserve(user_id)?;

        let split = partition::split_user_images(
            user_id,
            upload_dir,
            &self.config.paths.data_dir,
            &self.config.split,
        )?;

        let augmentation = match augment::augment_user_images(
            user_id,
            &split.train_dir,
            &self.config.split.allowed_extensions,
            &self.config.augment,
        ) {
            Ok(report) => {
                tracing::info!(user_id, summary = %report.message(), "augmentation finished");
                Some(report)
            }
            Err(e) => {
                tracing::warn!(
                    user_id,
                    error = %e,
                    "augmentation failed; training on original images"
                );
                None
            }
        };

        let config = Arc::clone(&self.config);
        let backend = Arc::clone(&self.backend);
        let user = user_id.to_string();
        let handle = reservation.submit(move |on_stage| {
            trainer::train(
                &user,
                &config.paths.data_dir,
                &config.paths.models_dir,
                &config,
                backend.as_ref(),
                on_stage,
            )
        })?;

        let job_id = handle.id();
        let message = format!(
            "Training initiated for user {user_id} (job {job_id}). {}",
            split.message()
        );
        tracing::info!(user_id, %job_id, "training initiated");
        Ok(Initiated {
            job_id,
            handle,
            split,
            augmentation,
            message,
        })
    }

    pub fn verify(&self, user_id: &str, image_bytes: &[u8]) -> Verification {
        verifier::verify(user_id, image_bytes, &self.config, self.backend.as_ref())
    }

    pub fn job_status(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.status(id)
    }
}
