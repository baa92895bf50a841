use std::path::PathBuf;
use veriface_core::config::ConfigError;
use veriface_core::Config;

/// Which D-Bus bus to register on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: the core config plus process-level settings.
pub struct DaemonConfig {
    pub core: Config,
    /// TOML file the core config was read from, if any.
    pub config_path: Option<PathBuf>,
    pub bus: BusKind,
}

impl DaemonConfig {
    /// Load from `VERIFACE_CONFIG` (TOML, optional), then apply `VERIFACE_*`
    /// overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config_path = lookup("VERIFACE_CONFIG").map(PathBuf::from);
        let mut core = match &config_path {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(dir) = lookup("VERIFACE_DATA_DIR") {
            core.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("VERIFACE_MODELS_DIR") {
            core.paths.models_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("VERIFACE_UPLOAD_DIR") {
            core.paths.upload_dir = PathBuf::from(dir);
        }
        if let Some(threshold) = parsed::<f32>(&lookup, "VERIFACE_THRESHOLD") {
            core.verification.threshold = threshold;
        }
        if let Some(seed) = parsed::<u64>(&lookup, "VERIFACE_SEED") {
            core.split.seed = Some(seed);
            core.augment.seed = Some(seed);
            core.training.seed = Some(seed);
        }
        core.validate()?;

        let bus = match lookup("VERIFACE_BUS").as_deref() {
            Some("system") => BusKind::System,
            _ => BusKind::Session,
        };

        Ok(Self {
            core,
            config_path,
            bus,
        })
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}
