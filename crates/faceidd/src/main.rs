use anyhow::{Context, Result};
use faceid_core::EnrollmentService;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, DaemonConfig};

const BUS_NAME: &str = "io.faceid.FaceId1";
const OBJECT_PATH: &str = "/io/faceid/FaceId1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceidd starting");

    let config = DaemonConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        data_dir = %config.core.storage.data_dir.display(),
        cascade = %config.core.extraction.cascade_path.display(),
        bus = %config.bus,
        "configuration loaded"
    );

    let service = EnrollmentService::with_opencv(config.core.clone())
        .context("failed to initialise enrollment pipeline")?;
    let engine = engine::spawn_engine(service)?;

    let iface = dbus_interface::FaceIdService::new(engine, config.bus.to_string());
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the {} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "faceidd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceidd shutting down");

    Ok(())
}
