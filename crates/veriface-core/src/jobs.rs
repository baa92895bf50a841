//! Background training jobs.
//!
//! Each submission runs on its own named OS thread and is tracked in a shared
//! table. At most one job per user is in flight; a second submission for the
//! same user is rejected until the first finishes. A user's slot can be
//! [reserved](JobQueue::reserve) before the job exists, so preparation work
//! that precedes training is covered by the same exclusion. Finished records
//! beyond the history limit are dropped oldest first.

use crate::trainer::{TrainError, TrainReport, TrainStage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running { stage: TrainStage },
    Succeeded { message: String },
    Failed { error: String },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Succeeded { .. } | JobState::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub user_id: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("user {user_id} already has training job {job_id} in flight")]
    AlreadyRunning { user_id: String, job_id: JobId },
    #[error("failed to spawn training thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("training failed: {0}")]
    Train(#[from] TrainError),
    #[error("training thread exited without a result")]
    WorkerLost,
}

/// Finished job records kept by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

#[derive(Default)]
struct Table {
    jobs: HashMap<JobId, JobRecord>,
    active: HashMap<String, JobId>,
    /// Finished jobs in completion order.
    finished: VecDeque<JobId>,
}

impl Table {
    /// Drop the oldest finished records until at most `limit` remain.
    fn prune(&mut self, limit: usize) {
        while self.finished.len() > limit {
            if let Some(id) = self.finished.pop_front() {
                self.jobs.remove(&id);
            }
        }
    }
}

/// Clone-safe handle to the job table.
#[derive(Clone)]
pub struct JobQueue {
    table: Arc<Mutex<Table>>,
    history_limit: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

/// A user's claimed job slot. The job is recorded as pending from the moment
/// of reservation; [`Reservation::submit`] starts it, and dropping the
/// reservation unsubmitted releases the slot and forgets the record.
pub struct Reservation {
    queue: JobQueue,
    id: JobId,
    user_id: String,
    submitted: bool,
}

/// Returned by [`JobQueue::submit`]; dropping it detaches the job.
pub struct JobHandle {
    id: JobId,
    rx: mpsc::Receiver<Result<TrainReport, TrainError>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Block until the job finishes.
    pub fn wait(self) -> Result<TrainReport, JobError> {
        match self.rx.recv() {
            Ok(result) => result.map_err(JobError::from),
            Err(_) => Err(JobError::WorkerLost),
        }
    }
}

impl Reservation {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Run `work` on a background thread under this reservation.
    ///
    /// `work` receives a stage observer that updates the job's status.
    pub fn submit<F>(mut self, work: F) -> Result<JobHandle, JobError>
    where
        F: FnOnce(&mut dyn FnMut(TrainStage)) -> Result<TrainReport, TrainError> + Send + 'static,
    {
        self.submitted = true;
        self.queue.spawn(self.id, &self.user_id, work)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.submitted {
            tracing::debug!(user_id = %self.user_id, job_id = %self.id, "reservation released");
            self.queue.forget(self.id, &self.user_id);
        }
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            history_limit,
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// In-flight job for `user_id`, if any.
    pub fn active_job(&self, user_id: &str) -> Option<JobId> {
        self.table().active.get(user_id).copied()
    }

    pub fn status(&self, id: JobId) -> Option<JobRecord> {
        self.table().jobs.get(&id).cloned()
    }

    /// All known jobs, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.table().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    /// Claim `user_id`'s slot, recording a pending job.
    pub fn reserve(&self, user_id: &str) -> Result<Reservation, JobError> {
        let id = JobId::new();
        let mut table = self.table();
        if let Some(&job_id) = table.active.get(user_id) {
            return Err(JobError::AlreadyRunning {
                user_id: user_id.to_string(),
                job_id,
            });
        }
        table.active.insert(user_id.to_string(), id);
        table.jobs.insert(
            id,
            JobRecord {
                id,
                user_id: user_id.to_string(),
                state: JobState::Pending,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
            },
        );
        Ok(Reservation {
            queue: self.clone(),
            id,
            user_id: user_id.to_string(),
            submitted: false,
        })
    }

    /// Reserve `user_id` and run `work` on a background thread.
    pub fn submit<F>(&self, user_id: &str, work: F) -> Result<JobHandle, JobError>
    where
        F: FnOnce(&mut dyn FnMut(TrainStage)) -> Result<TrainReport, TrainError> + Send + 'static,
    {
        self.reserve(user_id)?.submit(work)
    }

    fn spawn<F>(&self, id: JobId, user_id: &str, work: F) -> Result<JobHandle, JobError>
    where
        F: FnOnce(&mut dyn FnMut(TrainStage)) -> Result<TrainReport, TrainError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let queue = self.clone();
        let user = user_id.to_string();
        let spawned = std::thread::Builder::new()
            .name(format!("veriface-train-{user}"))
            .spawn(move || {
                tracing::info!(user_id = %user, job_id = %id, "training job started");
                queue.update(id, |job| {
                    job.started_at = Some(Utc::now());
                    job.state = JobState::Running { stage: TrainStage::Init };
                });

                let mut observer = |stage: TrainStage| {
                    queue.update(id, |job| job.state = JobState::Running { stage });
                };
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut observer)));

                let state = match &outcome {
                    Ok(Ok(report)) => JobState::Succeeded {
                        message: report.message(),
                    },
                    Ok(Err(e)) => JobState::Failed { error: e.to_string() },
                    Err(_) => JobState::Failed {
                        error: "training thread panicked".into(),
                    },
                };
                match &state {
                    JobState::Failed { error } => {
                        tracing::error!(
                            user_id = %user,
                            job_id = %id,
                            error = %error,
                            "training job failed"
                        )
                    }
                    _ => tracing::info!(user_id = %user, job_id = %id, "training job succeeded"),
                }
                queue.finish(id, &user, state);

                if let Ok(result) = outcome {
                    // Receiver may have been dropped; the table still holds the outcome.
                    let _ = tx.send(result);
                }
            });

        match spawned {
            Ok(_) => Ok(JobHandle { id, rx }),
            Err(e) => {
                self.finish(
                    id,
                    user_id,
                    JobState::Failed {
                        error: format!("spawn failed: {e}"),
                    },
                );
                Err(JobError::Spawn(e))
            }
        }
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut JobRecord)) {
        if let Some(job) = self.table().jobs.get_mut(&id) {
            f(job);
        }
    }

    fn finish(&self, id: JobId, user_id: &str, state: JobState) {
        let mut table = self.table();
        if table.active.get(user_id) == Some(&id) {
            table.active.remove(user_id);
        }
        if let Some(job) = table.jobs.get_mut(&id) {
            job.state = state;
            job.finished_at = Some(Utc::now());
            table.finished.push_back(id);
        }
        table.prune(self.history_limit);
    }

    fn forget(&self, id: JobId, user_id: &str) {
        let mut table = self.table();
        if table.active.get(user_id) == Some(&id) {
            table.active.remove(user_id);
        }
        table.jobs.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn report(user_id: &str) -> TrainReport {
        TrainReport {
            user_id: user_id.to_string(),
            train_samples: 4,
            validation_samples: 0,
            class_weights: None,
            history: Vec::new(),
            warmup_stopped_early: false,
            finetune_stopped_early: false,
            best_val_accuracy: None,
            best_model_path: None,
            final_model_path: PathBuf::from("models/alice/full_model.json"),
        }
    }

    #[test]
    fn test_submit_and_wait_succeeds() {
        let queue = JobQueue::new();
        let handle = queue
            .submit("alice", |on_stage| {
                on_stage(TrainStage::PhaseOneWarmup);
                Ok(report("alice"))
            })
            .unwrap();
        let id = handle.id();
        let report = handle.wait().unwrap();
        assert_eq!(report.user_id, "alice");

        let record = queue.status(id).unwrap();
        assert!(matches!(record.state, JobState::Succeeded { .. }));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
        assert_eq!(queue.active_job("alice"), None);
    }

    #[test]
    fn test_second_submission_for_same_user_is_rejected() {
        let queue = JobQueue::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (stage_tx, stage_rx) = mpsc::channel::<()>();
        let first = queue
            .submit("alice", move |on_stage| {
                on_stage(TrainStage::PhaseTwoFinetune);
                stage_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(report("alice"))
            })
            .unwrap();

        stage_rx.recv().unwrap();
        assert_eq!(
            queue.status(first.id()).unwrap().state,
            JobState::Running {
                stage: TrainStage::PhaseTwoFinetune
            }
        );
        let err = queue.submit("alice", |_| Ok(report("alice"))).err().unwrap();
        assert!(matches!(err, JobError::AlreadyRunning { job_id, .. } if job_id == first.id()));

        // Other users are unaffected.
        queue.submit("bob", |_| Ok(report("bob"))).unwrap().wait().unwrap();

        release_tx.send(()).unwrap();
        first.wait().unwrap();
        queue.submit("alice", |_| Ok(report("alice"))).unwrap().wait().unwrap();
        assert_eq!(queue.list().len(), 3);
    }

    #[test]
    fn test_failure_is_recorded() {
        let queue = JobQueue::new();
        let handle = queue
            .submit("alice", |_| {
                Err(TrainError::NoPositiveSamples {
                    user_id: "alice".into(),
                })
            })
            .unwrap();
        let id = handle.id();
        assert!(matches!(
            handle.wait(),
            Err(JobError::Train(TrainError::NoPositiveSamples { .. }))
        ));
        match queue.status(id).unwrap().state {
            JobState::Failed { error } => assert!(error.contains("alice")),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_panic_marks_failed_and_releases_user() {
        let queue = JobQueue::new();
        let handle = queue.submit("alice", |_| panic!("boom")).unwrap();
        let id = handle.id();
        assert!(matches!(handle.wait(), Err(JobError::WorkerLost)));
        assert!(matches!(queue.status(id).unwrap().state, JobState::Failed { .. }));
        assert_eq!(queue.active_job("alice"), None);
    }

    #[test]
    fn test_reservation_blocks_user_until_dropped() {
        let queue = JobQueue::new();
        let reservation = queue.reserve("alice").unwrap();
        assert_eq!(queue.active_job("alice"), Some(reservation.id()));
        assert_eq!(queue.status(reservation.id()).unwrap().state, JobState::Pending);
        assert!(matches!(
            queue.submit("alice", |_| Ok(report("alice"))),
            Err(JobError::AlreadyRunning { .. })
        ));
        assert!(matches!(
            queue.reserve("alice"),
            Err(JobError::AlreadyRunning { .. })
        ));

        let id = reservation.id();
        drop(reservation);
        assert_eq!(queue.active_job("alice"), None);
        assert!(queue.status(id).is_none());
        assert!(queue.list().is_empty());
    }

    #[test]
    fn test_reservation_submit_keeps_its_id() {
        let queue = JobQueue::new();
        let reservation = queue.reserve("alice").unwrap();
        let id = reservation.id();
        let handle = reservation.submit(|_| Ok(report("alice"))).unwrap();
        assert_eq!(handle.id(), id);
        handle.wait().unwrap();
        assert!(matches!(
            queue.status(id).unwrap().state,
            JobState::Succeeded { .. }
        ));
        assert_eq!(queue.active_job("alice"), None);
    }

    #[test]
    fn test_finished_history_is_capped() {
        let queue = JobQueue::with_history_limit(2);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let handle = queue.submit("alice", |_| Ok(report("alice"))).unwrap();
            ids.push(handle.id());
            handle.wait().unwrap();
        }
        assert_eq!(queue.list().len(), 2);
        assert!(queue.status(ids[0]).is_none());
        assert!(queue.status(ids[1]).is_none());
        assert!(queue.status(ids[2]).is_some());
        assert!(queue.status(ids[3]).is_some());
    }

    #[test]
    fn test_running_jobs_are_never_pruned() {
        let queue = JobQueue::with_history_limit(0);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let running = queue
            .submit("alice", move |_| {
                release_rx.recv().unwrap();
                Ok(report("alice"))
            })
            .unwrap();
        queue.submit("bob", |_| Ok(report("bob"))).unwrap().wait().unwrap();
        assert!(queue.status(running.id()).is_some());
        release_tx.send(()).unwrap();
        running.wait().unwrap();
    }

    #[test]
    fn test_job_id_parses_from_display() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let json = serde_json::to_string(&JobState::Running {
            stage: TrainStage::Persist,
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"running","stage":"persist"}"#);
    }
}
