//! End-to-end enrollment and verification on synthetic images.

use image::{ImageFormat, Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use veriface_core::augment;
use veriface_core::partition;
use veriface_core::trainer;
use veriface_core::{
    Config, InputShape, JobState, Pipeline, ProbeBackend, TrainError, VerifyError,
};

/// A face-ish blob on a background. `warm` faces are red-dominant,
/// others blue-dominant.
fn synthetic_face(rng: &mut ChaCha8Rng, warm: bool) -> RgbImage {
    let (w, h) = (40u32, 48u32);
    let jitter = |rng: &mut ChaCha8Rng| rng.gen_range(-25i32..=25);
    let base: [i32; 3] = if warm { [190, 70, 60] } else { [60, 80, 190] };
    let bg = [base[0] / 3, base[1] / 3, base[2] / 3];
    let face = [
        base[0] + jitter(rng),
        base[1] + jitter(rng),
        base[2] + jitter(rng),
    ];
    let cx = w as f32 / 2.0 + rng.gen_range(-4.0..4.0);
    let cy = h as f32 / 2.0 + rng.gen_range(-4.0..4.0);
    let (rx, ry) = (rng.gen_range(12.0..16.0), rng.gen_range(15.0..20.0));

    RgbImage::from_fn(w, h, |x, y| {
        let dx = (x as f32 - cx) / rx;
        let dy = (y as f32 - cy) / ry;
        let c = if dx * dx + dy * dy <= 1.0 { face } else { bg };
        let noise = ((x * 7 + y * 13) % 9) as i32 - 4;
        Rgb([
            (c[0] + noise).clamp(0, 255) as u8,
            (c[1] + noise).clamp(0, 255) as u8,
            (c[2] + noise).clamp(0, 255) as u8,
        ])
    })
}

fn write_faces(dir: &Path, prefix: &str, count: usize, warm: bool, seed: u64) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let path = dir.join(format!("{prefix}_{i:03}.png"));
            synthetic_face(&mut rng, warm).save(&path).unwrap();
            path
        })
        .collect()
}

fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

fn config(root: &Path) -> Config {
    let mut config = Config::default();
    config.paths.data_dir = root.join("data");
    config.paths.models_dir = root.join("models");
    config.paths.upload_dir = root.join("uploads");
    config.split.seed = Some(11);
    config.augment.probability = 1.0;
    config.augment.seed = Some(12);
    config.training.input_shape = InputShape::new(24, 20);
    config.training.batch_size = 8;
    config.training.initial_epochs = 8;
    config.training.fine_tune_epochs = 4;
    config.training.learning_rate_initial = 1e-2;
    config.training.learning_rate_finetune = 1e-3;
    config.training.dropout = 0.2;
    config.training.seed = Some(13);
    config.verification.threshold = 0.5;
    config
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[test]
fn test_twenty_images_split_and_augment_to_thirty_two() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let upload = root.path().join("uploads/alice");
    write_faces(&upload, "alice", 20, true, 1);

    let split =
        partition::split_user_images("alice", &upload, &config.paths.data_dir, &config.split)
            .unwrap();
    assert_eq!(
        (split.counts.train, split.counts.validation, split.counts.test),
        (16, 3, 1)
    );
    assert_eq!(file_count(&split.train_dir), 16);
    assert_eq!(file_count(&split.validation_dir), 3);
    assert_eq!(file_count(&split.test_dir), 1);

    let report = augment::augment_user_images(
        "alice",
        &split.train_dir,
        &config.split.allowed_extensions,
        &config.augment,
    )
    .unwrap();
    assert_eq!(report.scanned, 16);
    assert_eq!(report.created(), 16);
    assert_eq!(file_count(&split.train_dir), 32);

    for created in &report.files.succeeded {
        assert!(augment::is_augmented(created));
        assert_eq!(created.extension().unwrap(), "png");
    }

    // A second pass only ever looks at the 16 originals.
    let again = augment::augment_user_images(
        "alice",
        &split.train_dir,
        &config.split.allowed_extensions,
        &config.augment,
    )
    .unwrap();
    assert_eq!(again.scanned, 16);
    assert_eq!(again.selected, 16);
    assert_eq!(again.created() + again.skipped_existing.len(), 16);
    for created in &again.files.succeeded {
        let stem = created.file_stem().unwrap().to_str().unwrap();
        assert!(stem.starts_with("alice_"));
        let suffixes = ["_glare", "_shadow", "_rot", "_spots"];
        assert_eq!(suffixes.iter().filter(|s| stem.contains(*s)).count(), 1);
    }
    assert_eq!(file_count(&split.train_dir), 32 + again.created());
}

#[test]
fn test_enrolled_user_verifies_and_impostors_do_not() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let data = config.paths.data_dir.clone();
    write_faces(&data.join("train/not_user"), "imp", 24, false, 2);
    write_faces(&data.join("validation/not_user"), "imp_val", 6, false, 3);
    let upload = root.path().join("uploads/alice");
    write_faces(&upload, "alice", 20, true, 4);

    let pipeline = Pipeline::new(config.clone(), Arc::new(ProbeBackend::default()));
    let initiated = pipeline.start("alice", &upload).unwrap();
    let job_id = initiated.job_id;
    let report = initiated.handle.wait().unwrap();

    assert!(matches!(
        pipeline.job_status(job_id).unwrap().state,
        JobState::Succeeded { .. }
    ));
    assert!(report.best_model_path.is_some());
    assert!(config.best_model_path("alice").is_file());
    assert!(config.final_model_path("alice").is_file());
    assert!(config.user_models_dir("alice").join("training_history.json").is_file());

    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let mut user_hits = 0;
    let mut impostor_rejections = 0;
    for _ in 0..10 {
        let v = pipeline.verify("alice", &png_bytes(&synthetic_face(&mut rng, true)));
        assert!(v.error.is_none(), "{:?}", v.error);
        assert!((0.0..=1.0).contains(&v.probability));
        assert_eq!(v.is_match, v.probability >= 0.5);
        user_hits += usize::from(v.is_match);

        let v = pipeline.verify("alice", &png_bytes(&synthetic_face(&mut rng, false)));
        assert!(v.error.is_none(), "{:?}", v.error);
        impostor_rejections += usize::from(!v.is_match);
    }
    assert!(user_hits >= 8, "only {user_hits}/10 genuine faces matched");
    assert!(impostor_rejections >= 8, "only {impostor_rejections}/10 impostors rejected");
}

#[test]
fn test_verify_unknown_user_reports_model_not_found() {
    let root = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(config(root.path()), Arc::new(ProbeBackend::default()));
    let v = pipeline.verify("nobody", b"not even an image");
    assert!(!v.is_match);
    assert_eq!(v.probability, 0.0);
    assert!(matches!(v.error, Some(VerifyError::ModelNotFound { .. })));
}

#[test]
fn test_training_without_user_images_fails_early() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    write_faces(&config.paths.data_dir.join("train/not_user"), "imp", 6, false, 5);

    let mut stages = Vec::new();
    let err = trainer::train(
        "alice",
        &config.paths.data_dir,
        &config.paths.models_dir,
        &config,
        &ProbeBackend::default(),
        &mut |stage| stages.push(stage),
    )
    .unwrap_err();
    assert!(matches!(err, TrainError::NoPositiveSamples { .. }));
    assert!(!config.user_models_dir("alice").exists());
}
