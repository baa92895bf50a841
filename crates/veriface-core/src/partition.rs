//! Dataset partitioning.
//!
//! [`split_user_images`] copies one user's uploaded images into
//! `{data}/{train,validation,test}/{user_id}` under ratio targets with floor
//! rounding; the test split absorbs the remainder. [`split_corpus`] is the
//! bulk variant used to seed a multi-person corpus: fixed per-person counts
//! and a minimum-count floor below which a person is skipped.

use crate::config::SplitConfig;
use crate::files;
use crate::types::{seeded_rng, BatchReport, Split};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("source image directory not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("no images found in source directory: {0}")]
    NoImages(PathBuf),
    #[error("invalid split ratios: train {train}, validation {validation} (each >= 0, sum <= 1)")]
    InvalidRatios { train: f64, validation: f64 },
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to clear stale split directory {path}: {source}")]
    ClearDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Number of images assigned to each split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SplitCounts {
    pub train: usize,
    pub validation: usize,
    pub test: usize,
}

impl SplitCounts {
    /// `train = ⌊n·tr⌋`, `validation = ⌊n·va⌋`, `test = n − train − validation`.
    pub fn compute(total: usize, train_ratio: f64, validation_ratio: f64) -> Self {
        let train = ((total as f64 * train_ratio).floor() as usize).min(total);
        let validation = ((total as f64 * validation_ratio).floor() as usize).min(total - train);
        Self {
            train,
            validation,
            test: total - train - validation,
        }
    }

    pub fn total(&self) -> usize {
        self.train + self.validation + self.test
    }
}

/// Result of a per-user split.
#[derive(Debug, Clone, Serialize)]
pub struct SplitOutcome {
    pub user_id: String,
    pub counts: SplitCounts,
    pub train_dir: PathBuf,
    pub validation_dir: PathBuf,
    pub test_dir: PathBuf,
    /// Per-file copy results across all three destinations.
    pub copies: BatchReport,
}

impl SplitOutcome {
    pub fn message(&self) -> String {
        format!(
            "data for user {} split: {} train, {} validation, {} test ({} copy failures)",
            self.user_id,
            self.counts.train,
            self.counts.validation,
            self.counts.test,
            self.copies.failed.len()
        )
    }
}

fn validate_ratios(train: f64, validation: f64) -> Result<(), PartitionError> {
    let valid = train.is_finite()
        && validation.is_finite()
        && train >= 0.0
        && validation >= 0.0
        && train + validation <= 1.0;
    if valid {
        Ok(())
    } else {
        Err(PartitionError::InvalidRatios { train, validation })
    }
}

fn create_dir(path: &Path) -> Result<(), PartitionError> {
    std::fs::create_dir_all(path).map_err(|source| PartitionError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// Empty `path` of a previous split, then recreate it.
fn reset_dir(path: &Path) -> Result<(), PartitionError> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|source| PartitionError::ClearDir {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "cleared previous split");
    }
    create_dir(path)
}

/// Copy each file into `dest`, keeping its file name. Sources are left untouched.
fn copy_into(images: &[PathBuf], dest: &Path, report: &mut BatchReport) {
    for src in images {
        let Some(name) = src.file_name() else {
            report.push_failure(src, "path has no file name");
            continue;
        };
        let target = dest.join(name);
        match std::fs::copy(src, &target) {
            Ok(_) => report.succeeded.push(target),
            Err(e) => {
                tracing::warn!(
                    src = %src.display(),
                    dest = %dest.display(),
                    error = %e,
                    "failed to copy image"
                );
                report.push_failure(src, e);
            }
        }
    }
}

/// Split a user's uploaded images into train/validation/test directories.
///
/// Membership is shuffled before slicing; with `config.seed` unset every
/// call yields a fresh assignment. The user's split directories are cleared
/// first so a re-enrollment never mixes two assignments (or stale augmented
/// files) across splits. Files are copied, never moved.
pub fn split_user_images(
    user_id: &str,
    source_dir: &Path,
    base_data_dir: &Path,
    config: &SplitConfig,
) -> Result<SplitOutcome, PartitionError> {
    if !source_dir.is_dir() {
        tracing::error!(
            user_id,
            source = %source_dir.display(),
            "source image directory not found"
        );
        return Err(PartitionError::SourceNotFound(source_dir.to_path_buf()));
    }

    let mut images =
        files::list_images(source_dir, &config.allowed_extensions).map_err(|source| {
            PartitionError::ReadDir {
                path: source_dir.to_path_buf(),
                source,
            }
        })?;
    if images.is_empty() {
        tracing::warn!(
            user_id,
            source = %source_dir.display(),
            "no images found in source directory"
        );
        return Err(PartitionError::NoImages(source_dir.to_path_buf()));
    }

    validate_ratios(config.train_ratio, config.validation_ratio)?;

    let mut rng = seeded_rng(config.seed);
    images.shuffle(&mut rng);

    let counts = SplitCounts::compute(images.len(), config.train_ratio, config.validation_ratio);
    let (train, rest) = images.split_at(counts.train);
    let (validation, test) = rest.split_at(counts.validation);

    let train_dir = Split::Train.root(base_data_dir).join(user_id);
    let validation_dir = Split::Validation.root(base_data_dir).join(user_id);
    let test_dir = Split::Test.root(base_data_dir).join(user_id);
    for dir in [&train_dir, &validation_dir, &test_dir] {
        reset_dir(dir)?;
    }

    let mut copies = BatchReport::default();
    copy_into(train, &train_dir, &mut copies);
    copy_into(validation, &validation_dir, &mut copies);
    copy_into(test, &test_dir, &mut copies);

    let outcome = SplitOutcome {
        user_id: user_id.to_string(),
        counts,
        train_dir,
        validation_dir,
        test_dir,
        copies,
    };
    tracing::info!(
        user_id,
        train = counts.train,
        validation = counts.validation,
        test = counts.test,
        copy_failures = outcome.copies.failed.len(),
        "enrollment images split"
    );
    Ok(outcome)
}

/// Per-person parameters for bulk corpus preparation.
#[derive(Debug, Clone)]
pub struct CorpusSplitConfig {
    pub train_per_person: usize,
    pub validation_per_person: usize,
    /// Persons with fewer images are skipped. Defaults to train + validation.
    pub min_images: Option<usize>,
    pub seed: Option<u64>,
    pub allowed_extensions: Vec<String>,
}

impl Default for CorpusSplitConfig {
    fn default() -> Self {
        Self {
            train_per_person: 70,
            validation_per_person: 15,
            min_images: None,
            seed: None,
            allowed_extensions: vec![
                "png".into(),
                "jpg".into(),
                "jpeg".into(),
                "bmp".into(),
                "gif".into(),
            ],
        }
    }
}

impl CorpusSplitConfig {
    pub fn floor(&self) -> usize {
        self.min_images
            .unwrap_or(self.train_per_person + self.validation_per_person)
    }
}

/// One person's allocation in a bulk split.
#[derive(Debug, Clone, Serialize)]
pub struct PersonSplit {
    pub person: String,
    pub counts: SplitCounts,
}

/// A person left out of the corpus for having too few images.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedPerson {
    pub person: String,
    pub images: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CorpusReport {
    pub persons: Vec<PersonSplit>,
    pub skipped: Vec<SkippedPerson>,
    pub copies: BatchReport,
}

/// Split a `{raw_dir}/{person}/*` corpus into per-person split directories.
///
/// Every kept person gets exactly `train_per_person` train and
/// `validation_per_person` validation images; the remainder goes to test.
/// A kept person's split directories are cleared before copying; other
/// persons already in the corpus are left alone.
pub fn split_corpus(
    raw_dir: &Path,
    base_data_dir: &Path,
    config: &CorpusSplitConfig,
) -> Result<CorpusReport, PartitionError> {
    if !raw_dir.is_dir() {
        return Err(PartitionError::SourceNotFound(raw_dir.to_path_buf()));
    }

    let read_err = |source| PartitionError::ReadDir {
        path: raw_dir.to_path_buf(),
        source,
    };
    let mut persons = Vec::new();
    for entry in std::fs::read_dir(raw_dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.is_dir() {
            persons.push(path);
        }
    }
    persons.sort();

    let floor = config.floor();
    let mut rng = seeded_rng(config.seed);
    let mut report = CorpusReport::default();

    for person_dir in persons {
        let person = person_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut images = files::list_images(&person_dir, &config.allowed_extensions)
            .map_err(|source| PartitionError::ReadDir {
                path: person_dir.clone(),
                source,
            })?;

        if images.len() < floor {
            tracing::warn!(
                person = %person,
                images = images.len(),
                floor,
                "person below minimum image count, skipping"
            );
            report.skipped.push(SkippedPerson {
                person,
                images: images.len(),
            });
            continue;
        }

        images.shuffle(&mut rng);
        let train_n = config.train_per_person.min(images.len());
        let validation_n = config.validation_per_person.min(images.len() - train_n);
        let counts = SplitCounts {
            train: train_n,
            validation: validation_n,
            test: images.len() - train_n - validation_n,
        };

        let (train, rest) = images.split_at(counts.train);
        let (validation, test) = rest.split_at(counts.validation);
        for (split, subset) in Split::ALL.into_iter().zip([train, validation, test]) {
            let dest = split.root(base_data_dir).join(&person);
            reset_dir(&dest)?;
            copy_into(subset, &dest, &mut report.copies);
        }

        tracing::info!(
            person = %person,
            train = counts.train,
            validation = counts.validation,
            test = counts.test,
            "person split"
        );
        report.persons.push(PersonSplit { person, counts });
    }

    if report.persons.is_empty() && report.skipped.is_empty() {
        return Err(PartitionError::NoImages(raw_dir.to_path_buf()));
    }
    Ok(report)
}
