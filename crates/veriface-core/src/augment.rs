//! Offline augmentation of a user's training split.
//!
//! Each eligible original (allowed extension, no augmentation suffix) is
//! augmented with probability `p` by exactly one of four transforms, and the
//! result is written next to it as `{stem}{suffix}.{ext}`. Files that already
//! carry a suffix are never augmented again, and existing outputs are never
//! overwritten, so repeated runs converge.

use crate::config::AugmentConfig;
use crate::files;
use crate::types::{seeded_rng, BatchReport};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Shadow rectangles narrower or shorter than this fraction fall back to the default.
const SHADOW_MIN_FRACTION: f32 = 0.1;

#[derive(Error, Debug)]
pub enum AugmentError {
    #[error("training directory not found: {0}")]
    NotADirectory(PathBuf),
    #[error("failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A single offline augmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Transform {
    Glare,
    Shadow,
    Rotation,
    Spots,
}

impl Transform {
    pub const ALL: [Transform; 4] = [
        Transform::Glare,
        Transform::Shadow,
        Transform::Rotation,
        Transform::Spots,
    ];

    /// File-stem suffix marking an output of this transform.
    pub fn suffix(self) -> &'static str {
        match self {
            Transform::Glare => "_glare",
            Transform::Shadow => "_shadow",
            Transform::Rotation => "_rot",
            Transform::Spots => "_spots",
        }
    }

    pub fn apply<R: Rng>(self, img: &RgbImage, config: &AugmentConfig, rng: &mut R) -> RgbImage {
        match self {
            Transform::Glare => glare(img, config, rng),
            Transform::Shadow => shadow(img, config, rng),
            Transform::Rotation => rotate_reflect(img, uniform(rng, config.rotation_degrees)),
            Transform::Spots => spots(img, config, rng),
        }
    }
}

/// True if the file stem ends with any augmentation suffix.
pub fn is_augmented(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| Transform::ALL.iter().any(|t| stem.ends_with(t.suffix())))
        .unwrap_or(false)
}

/// `dir/{stem}{suffix}.{ext}` for an original at `dir/{stem}.{ext}`.
pub fn augmented_path(original: &Path, transform: Transform) -> Option<PathBuf> {
    let stem = original.file_stem()?.to_str()?;
    let ext = original.extension()?.to_str()?;
    Some(original.with_file_name(format!("{stem}{}.{ext}", transform.suffix())))
}

/// Outcome of one augmentation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AugmentReport {
    /// Eligible originals found in the directory.
    pub scanned: usize,
    /// Originals the Bernoulli draw selected.
    pub selected: usize,
    /// Outputs that already existed and were left alone.
    pub skipped_existing: Vec<PathBuf>,
    /// Newly written files, and originals that could not be augmented.
    pub files: BatchReport,
}

impl AugmentReport {
    pub fn created(&self) -> usize {
        self.files.succeeded.len()
    }

    pub fn message(&self) -> String {
        if self.scanned == 0 {
            return "no eligible images to augment".to_string();
        }
        format!(
            "scanned {} originals, created {} augmented images ({} failed, {} already present)",
            self.scanned,
            self.created(),
            self.files.failed.len(),
            self.skipped_existing.len()
        )
    }
}

/// Augment a user's training directory in place.
///
/// Finding nothing eligible is not an error. Per-image failures are recorded
/// in the report and do not abort the pass.
pub fn augment_user_images(
    user_id: &str,
    train_dir: &Path,
    allowed_extensions: &[String],
    config: &AugmentConfig,
) -> Result<AugmentReport, AugmentError> {
    if !train_dir.is_dir() {
        return Err(AugmentError::NotADirectory(train_dir.to_path_buf()));
    }

    let originals: Vec<PathBuf> = files::list_images(train_dir, allowed_extensions)
        .map_err(|source| AugmentError::ReadDir {
            path: train_dir.to_path_buf(),
            source,
        })?
        .into_iter()
        .filter(|p| !is_augmented(p))
        .collect();

    let mut report = AugmentReport {
        scanned: originals.len(),
        ..AugmentReport::default()
    };
    if originals.is_empty() {
        tracing::info!(user_id, dir = %train_dir.display(), "no eligible images to augment");
        return Ok(report);
    }

    let probability = config.probability.clamp(0.0, 1.0);
    let mut rng = seeded_rng(config.seed);
    for original in &originals {
        if !rng.gen_bool(probability) {
            continue;
        }
        report.selected += 1;

        let transform = *Transform::ALL
            .choose(&mut rng)
            .unwrap_or(&Transform::Rotation);
        let Some(target) = augmented_path(original, transform) else {
            report.files.push_failure(original, "file name is not valid UTF-8");
            continue;
        };
        if target.exists() {
            tracing::debug!(path = %target.display(), "augmented image already present");
            report.skipped_existing.push(target);
            continue;
        }

        let img = match image::open(original) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(
                    user_id,
                    path = %original.display(),
                    error = %e,
                    "could not read image, skipping"
                );
                report.files.push_failure(original, e);
                continue;
            }
        };

        let augmented = transform.apply(&img, config, &mut rng);
        match augmented.save(&target) {
            Ok(()) => {
                tracing::debug!(path = %target.display(), ?transform, "augmented image written");
                report.files.succeeded.push(target);
            }
            Err(e) => {
                tracing::warn!(
                    user_id,
                    path = %target.display(),
                    error = %e,
                    "could not write augmented image"
                );
                report.files.push_failure(original, e);
            }
        }
    }

    tracing::info!(
        user_id,
        scanned = report.scanned,
        created = report.created(),
        failed = report.files.failed.len(),
        "offline augmentation finished"
    );
    Ok(report)
}

fn uniform<R: Rng>(rng: &mut R, (lo, hi): (f32, f32)) -> f32 {
    if lo >= hi {
        lo
    } else {
        rng.gen_range(lo..=hi)
    }
}

/// Per-channel `base·(1−α) + overlay·α`.
fn blend(base: &RgbImage, overlay: &RgbImage, alpha: f32) -> RgbImage {
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = base.clone();
    for (dst, src) in out.pixels_mut().zip(overlay.pixels()) {
        for c in 0..3 {
            let v = dst.0[c] as f32 * (1.0 - alpha) + src.0[c] as f32 * alpha;
            dst.0[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Translucent white rotated ellipse.
fn glare<R: Rng>(img: &RgbImage, config: &AugmentConfig, rng: &mut R) -> RgbImage {
    let (w, h) = (img.width() as f32, img.height() as f32);
    let cx = rng.gen_range(0.0..w);
    let cy = rng.gen_range(0.0..h);
    let ax = (w * uniform(rng, config.glare_axis_fraction)).max(1.0);
    let ay = (h * uniform(rng, config.glare_axis_fraction)).max(1.0);
    let (sin, cos) = rng.gen_range(0.0..std::f32::consts::PI).sin_cos();
    let intensity = uniform(rng, config.glare_intensity);

    let mut overlay = img.clone();
    for (x, y, pixel) in overlay.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - cx;
        let dy = y as f32 + 0.5 - cy;
        let u = dx * cos + dy * sin;
        let v = -dx * sin + dy * cos;
        if (u / ax).powi(2) + (v / ay).powi(2) <= 1.0 {
            *pixel = Rgb([255, 255, 255]);
        }
    }
    blend(img, &overlay, intensity)
}

/// Translucent black rectangle.
fn shadow<R: Rng>(img: &RgbImage, config: &AugmentConfig, rng: &mut R) -> RgbImage {
    let (w, h) = img.dimensions();
    let (xa, xb) = (rng.gen_range(0..w), rng.gen_range(0..w));
    let (ya, yb) = (rng.gen_range(0..h), rng.gen_range(0..h));
    let (mut left, mut top) = (xa.min(xb), ya.min(yb));
    let (mut rw, mut rh) = (xa.max(xb) - left, ya.max(yb) - top);

    let too_small = (rw as f32) < SHADOW_MIN_FRACTION * w as f32
        || (rh as f32) < SHADOW_MIN_FRACTION * h as f32;
    if too_small {
        left = w / 4;
        top = h / 4;
        rw = w / 2;
        rh = h / 2;
    }
    let intensity = uniform(rng, config.shadow_intensity);

    let mut overlay = img.clone();
    draw_filled_rect_mut(
        &mut overlay,
        Rect::at(left as i32, top as i32).of_size(rw.max(1), rh.max(1)),
        Rgb([0, 0, 0]),
    );
    blend(img, &overlay, intensity)
}

/// Small filled circles of random dark colours.
fn spots<R: Rng>(img: &RgbImage, config: &AugmentConfig, rng: &mut R) -> RgbImage {
    let (w, h) = img.dimensions();
    let (count_lo, count_hi) = config.spot_count;
    let (radius_lo, radius_hi) = config.spot_radius;
    let count = rng.gen_range(count_lo..=count_hi.max(count_lo));

    let mut out = img.clone();
    for _ in 0..count {
        let radius = rng.gen_range(radius_lo..=radius_hi.max(radius_lo));
        let center = (rng.gen_range(0..w) as i32, rng.gen_range(0..h) as i32);
        let max = config.spot_max_channel;
        let color = Rgb([
            rng.gen_range(0..=max),
            rng.gen_range(0..=max),
            rng.gen_range(0..=max),
        ]);
        draw_filled_circle_mut(&mut out, center, radius as i32, color);
    }
    out
}

/// Reflect an out-of-range index back into `[0, n)` without repeating the edge
/// pixel (`gfedcb|abcdefgh|gfedcba`).
fn reflect_101(i: i64, n: u32) -> u32 {
    let n = n as i64;
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - m }) as u32
}

/// Rotate about the image centre by `degrees`, sampling bilinearly and
/// reflecting at the borders so no fill colour is introduced.
fn rotate_reflect(img: &RgbImage, degrees: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let (sin, cos) = degrees.to_radians().sin_cos();

    RgbImage::from_fn(w, h, |ox, oy| {
        // Map output pixel back to source: src = R⁻¹ · (dst − c) + c
        let dx = ox as f32 - cx;
        let dy = oy as f32 - cy;
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;

        let x0 = sx.floor();
        let y0 = sy.floor();
        let fx = sx - x0;
        let fy = sy - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let sample = |x: i64, y: i64| img.get_pixel(reflect_101(x, w), reflect_101(y, h)).0;
        let (tl, tr) = (sample(x0, y0), sample(x0 + 1, y0));
        let (bl, br) = (sample(x0, y0 + 1), sample(x0 + 1, y0 + 1));

        let mut px = [0u8; 3];
        for c in 0..3 {
            let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                + tr[c] as f32 * fx * (1.0 - fy)
                + bl[c] as f32 * (1.0 - fx) * fy
                + br[c] as f32 * fx * fy;
            px[c] = val.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}
