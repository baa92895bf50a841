use veriface_core::{JobId, Pipeline, PipelineError};
use zbus::interface;

pub const BUS_NAME: &str = "org.veriface.Veriface1";
pub const OBJECT_PATH: &str = "/org/veriface/Veriface1";

/// D-Bus interface for the Veriface daemon.
///
/// Bus name: org.veriface.Veriface1
/// Object path: /org/veriface/Veriface1
pub struct VerifaceService {
    pipeline: Pipeline,
}

impl VerifaceService {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

fn to_fdo(err: PipelineError) -> zbus::fdo::Error {
    match err {
        PipelineError::InvalidUserId(_) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.veriface.Veriface1")]
impl VerifaceService {
    /// Enroll `user` from the images the upload handler saved under
    /// `{upload_dir}/{user}`. Returns once training is queued.
    async fn enroll(&self, user: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user, "enroll requested");
        let pipeline = self.pipeline.clone();
        let user = user.to_string();
        let upload_dir = pipeline.config().paths.upload_dir.join(&user);

        let initiated = tokio::task::spawn_blocking(move || pipeline.start(&user, &upload_dir))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("enroll task failed: {e}")))?
            .map_err(to_fdo)?;

        Ok(serde_json::json!({
            "job_id": initiated.job_id.to_string(),
            "message": initiated.message,
            "split": initiated.split.counts,
            "augmented": initiated.augmentation.as_ref().map(|a| a.created()),
        })
        .to_string())
    }

    /// Verify an encoded image of `user`. Returns (is_match, probability, message).
    async fn verify(&self, user: &str, image: Vec<u8>) -> zbus::fdo::Result<(bool, f64, String)> {
        tracing::info!(user, bytes = image.len(), "verify requested");
        let pipeline = self.pipeline.clone();
        let user = user.to_string();
        let verification = tokio::task::spawn_blocking(move || pipeline.verify(&user, &image))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("verify task failed: {e}")))?;
        Ok((
            verification.is_match,
            f64::from(verification.probability),
            verification.message,
        ))
    }

    /// Status of one training job as JSON.
    async fn job_status(&self, job_id: &str) -> zbus::fdo::Result<String> {
        let id: JobId = job_id
            .parse()
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid job id: {e}")))?;
        let record = self
            .pipeline
            .job_status(id)
            .ok_or_else(|| zbus::fdo::Error::Failed(format!("unknown job {id}")))?;
        serde_json::to_string(&record).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// All training jobs since startup as a JSON array, oldest first.
    async fn list_jobs(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.pipeline.jobs().list())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let jobs = self.pipeline.jobs().list();
        let running = jobs.iter().filter(|j| !j.state.is_finished()).count();
        let config = self.pipeline.config();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "backend": self.pipeline.backend_name(),
            "models_dir": config.paths.models_dir,
            "threshold": config.verification.threshold,
            "jobs_total": jobs.len(),
            "jobs_running": running,
        })
        .to_string())
    }
}
