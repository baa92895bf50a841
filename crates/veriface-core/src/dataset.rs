//! Labelled example streams for training and validation.
//!
//! A [`FaceSequence`] reads `{split_root}/not_user` and `{split_root}/{user_id}`,
//! labels examples by directory, and yields preprocessed batches.

use crate::classifier::Batch;
use crate::files;
use crate::preprocess::{self, Normalization};
use crate::types::{seeded_rng, InputShape, Label};
use image::imageops;
use image::RgbImage;
use ndarray::{Array4, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};

const JITTER_RANGE: (f32, f32) = (0.8, 1.2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: Label,
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceOptions {
    pub batch_size: usize,
    pub shape: InputShape,
    pub normalization: Normalization,
    /// Reshuffle at every epoch end.
    pub shuffle: bool,
    /// Random flip plus brightness/contrast jitter per example.
    pub online_augmentation: bool,
    pub seed: Option<u64>,
}

pub struct FaceSequence {
    samples: Vec<Sample>,
    options: SequenceOptions,
    rng: ChaCha8Rng,
}

impl FaceSequence {
    /// Collect samples for both classes under `split_root`. A missing class
    /// directory contributes no samples.
    pub fn discover(
        split_root: &Path,
        user_id: &str,
        allowed_extensions: &[String],
        options: SequenceOptions,
    ) -> std::io::Result<Self> {
        let mut samples = Vec::new();
        for label in [Label::NotUser, Label::User] {
            let dir = split_root.join(label.dir_name(user_id));
            if !dir.is_dir() {
                tracing::debug!(dir = %dir.display(), "class directory absent");
                continue;
            }
            for path in files::list_images(&dir, allowed_extensions)? {
                samples.push(Sample { path, label });
            }
        }
        Ok(Self::from_samples(samples, options))
    }

    pub fn from_samples(samples: Vec<Sample>, options: SequenceOptions) -> Self {
        let mut rng = seeded_rng(options.seed);
        let mut samples = samples;
        if options.shuffle {
            samples.shuffle(&mut rng);
        }
        Self {
            samples,
            options: SequenceOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            rng,
        }
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        self.samples.len().div_ceil(self.options.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn count(&self, label: Label) -> usize {
        self.samples.iter().filter(|s| s.label == label).count()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn on_epoch_end(&mut self) {
        if self.options.shuffle {
            self.samples.shuffle(&mut self.rng);
        }
    }

    /// Load and preprocess batch `index`. Unreadable files are skipped, so a
    /// batch may hold fewer examples than the batch size, or none.
    pub fn batch(&mut self, index: usize) -> Batch {
        let SequenceOptions {
            batch_size,
            shape,
            normalization,
            online_augmentation,
            ..
        } = self.options;
        let start = (index * batch_size).min(self.samples.len());
        let end = (start + batch_size).min(self.samples.len());

        let mut images = Vec::with_capacity(end - start);
        for sample in &self.samples[start..end] {
            match image::open(&sample.path) {
                Ok(img) => {
                    let mut img = img.to_rgb8();
                    if online_augmentation {
                        img = jitter(&img, &mut self.rng);
                    }
                    images.push((img, sample.label));
                }
                Err(e) => {
                    tracing::warn!(
                        path = %sample.path.display(),
                        error = %e,
                        "skipping unreadable image"
                    );
                }
            }
        }

        let mut inputs = Array4::<f32>::zeros((
            images.len(),
            InputShape::CHANNELS,
            shape.height as usize,
            shape.width as usize,
        ));
        let mut labels = Vec::with_capacity(images.len());
        for (i, (img, label)) in images.iter().enumerate() {
            preprocess::fill_slot(inputs.index_axis_mut(Axis(0), i), img, shape, normalization);
            labels.push(*label);
        }
        Batch { inputs, labels }
    }
}

/// Horizontal flip with probability ½, then contrast about the mean and
/// brightness scaling.
fn jitter<R: Rng>(img: &RgbImage, rng: &mut R) -> RgbImage {
    let mut out = if rng.gen_bool(0.5) {
        imageops::flip_horizontal(img)
    } else {
        img.clone()
    };
    let brightness = rng.gen_range(JITTER_RANGE.0..=JITTER_RANGE.1);
    let contrast = rng.gen_range(JITTER_RANGE.0..=JITTER_RANGE.1);

    let pixels = (out.width() as f32 * out.height() as f32).max(1.0);
    let mean = out.pixels().flat_map(|p| p.0).map(f32::from).sum::<f32>() / (pixels * 3.0);
    for pixel in out.pixels_mut() {
        for c in pixel.0.iter_mut() {
            let v = ((*c as f32 - mean) * contrast + mean) * brightness;
            *c = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
