use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use veriface_core::{ClassifierBackend, Pipeline, ProbeBackend};

mod config;
mod dbus_interface;

use config::{BusKind, DaemonConfig};
use dbus_interface::{VerifaceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("verifaced starting");

    let cfg = DaemonConfig::from_env().context("loading configuration")?;
    tracing::info!(
        config = ?cfg.config_path,
        data_dir = %cfg.core.paths.data_dir.display(),
        models_dir = %cfg.core.paths.models_dir.display(),
        upload_dir = %cfg.core.paths.upload_dir.display(),
        threshold = cfg.core.verification.threshold,
        bus = ?cfg.bus,
        "configuration loaded"
    );

    let backend: Arc<dyn ClassifierBackend> = Arc::new(ProbeBackend::default());
    let pipeline = Pipeline::new(cfg.core, backend);

    let builder = match cfg.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VerifaceService::new(pipeline))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "verifaced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("verifaced shutting down");

    Ok(())
}
