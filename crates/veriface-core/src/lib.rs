//! veriface-core: per-user face enrollment and verification.
//!
//! Splits a user's uploaded images, augments the training split on disk,
//! trains a binary user-vs-impostor classifier in two phases on a background
//! job, and verifies single images against the trained model.

pub mod augment;
pub mod callbacks;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod files;
pub mod jobs;
pub mod onnx;
pub mod partition;
pub mod pipeline;
pub mod preprocess;
pub mod trainer;
pub mod types;
pub mod verifier;

pub use classifier::probe::ProbeBackend;
pub use classifier::{ClassifierBackend, Scorer, TrainableClassifier};
pub use config::Config;
pub use jobs::{JobHandle, JobId, JobQueue, JobRecord, JobState, Reservation};
pub use pipeline::{Initiated, Pipeline, PipelineError};
pub use trainer::{TrainError, TrainReport, TrainStage};
pub use types::{ClassWeights, InputShape, Label, Split};
pub use verifier::{Verification, VerifyError};
