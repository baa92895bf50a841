use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use veriface_core::partition::{self, CorpusSplitConfig};
use veriface_core::types::Split;
use veriface_core::{augment, trainer, Config, Pipeline, ProbeBackend};

#[derive(Parser)]
#[command(name = "veriface", about = "Veriface enrollment and verification CLI")]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Fixed RNG seed for splitting, augmentation and training
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a user's uploaded images into train/validation/test
    Split {
        #[arg(short, long)]
        user: String,
        /// Directory holding the raw uploads
        #[arg(short, long)]
        source: PathBuf,
    },
    /// Augment a user's training split in place
    Augment {
        #[arg(short, long)]
        user: String,
        /// Override the per-image augmentation probability
        #[arg(short, long)]
        probability: Option<f64>,
    },
    /// Train a user's classifier from the existing splits
    Train {
        #[arg(short, long)]
        user: String,
    },
    /// Split, augment and train, waiting for training to finish
    Enroll {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        source: PathBuf,
    },
    /// Verify an image against a user's model
    Verify {
        #[arg(short, long)]
        user: String,
        /// Encoded image file (PNG, JPEG, ...)
        image: PathBuf,
    },
    /// Split a `{raw_dir}/{person}/*` corpus with fixed per-person counts
    PrepareCorpus {
        raw_dir: PathBuf,
        #[arg(long, default_value_t = 70)]
        train_per_person: usize,
        #[arg(long, default_value_t = 15)]
        validation_per_person: usize,
        /// Skip persons with fewer images (default: train + validation)
        #[arg(long)]
        min_images: Option<usize>,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(seed) = cli.seed {
        config.split.seed = Some(seed);
        config.augment.seed = Some(seed);
        config.training.seed = Some(seed);
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Split { user, source } => {
            let outcome = partition::split_user_images(
                &user,
                &source,
                &config.paths.data_dir,
                &config.split,
            )?;
            println!("{}", outcome.message());
            print_json(&outcome)?;
        }
        Commands::Augment { user, probability } => {
            if let Some(p) = probability {
                config.augment.probability = p;
                config.validate()?;
            }
            let train_dir = Split::Train.root(&config.paths.data_dir).join(&user);
            let report = augment::augment_user_images(
                &user,
                &train_dir,
                &config.split.allowed_extensions,
                &config.augment,
            )?;
            println!("{}", report.message());
            print_json(&report)?;
        }
        Commands::Train { user } => {
            let report = trainer::train(
                &user,
                &config.paths.data_dir,
                &config.paths.models_dir,
                &config,
                &ProbeBackend::default(),
                &mut |stage| tracing::info!(%stage, "stage"),
            )?;
            println!("{}", report.message());
            print_json(&report)?;
        }
        Commands::Enroll { user, source } => {
            let pipeline = Pipeline::new(config, Arc::new(ProbeBackend::default()));
            let initiated = pipeline.start(&user, &source)?;
            println!("{}", initiated.message);
            let report = initiated.handle.wait()?;
            println!("{}", report.message());
            print_json(&report)?;
        }
        Commands::Verify { user, image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let pipeline = Pipeline::new(config, Arc::new(ProbeBackend::default()));
            let verification = pipeline.verify(&user, &bytes);
            println!("{}", verification.message);
            print_json(&serde_json::json!({
                "user_id": verification.user_id,
                "is_match": verification.is_match,
                "probability": verification.probability,
                "threshold": verification.threshold,
                "model_path": verification.model_path,
                "error": verification.error.as_ref().map(|e| e.kind()),
            }))?;
            if let Some(err) = verification.error {
                bail!(err);
            }
        }
        Commands::PrepareCorpus {
            raw_dir,
            train_per_person,
            validation_per_person,
            min_images,
        } => {
            let corpus = CorpusSplitConfig {
                train_per_person,
                validation_per_person,
                min_images,
                seed: config.split.seed,
                ..CorpusSplitConfig::default()
            };
            let report = partition::split_corpus(&raw_dir, &config.paths.data_dir, &corpus)?;
            println!(
                "{} persons split, {} skipped, {} copy failures",
                report.persons.len(),
                report.skipped.len(),
                report.copies.failed.len()
            );
            print_json(&report)?;
        }
    }

    Ok(())
}
