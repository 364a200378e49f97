use anyhow::{Context, Result};
use rollcall_core::CosineMatcher;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod attendance;
mod config;
mod db;
mod dbus_interface;
mod engine;
mod service;
mod store;

use attendance::AttendanceLog;
use config::Config;
use dbus_interface::{AttendanceBus, BUS_NAME, OBJECT_PATH};
use service::AttendanceService;
use store::IdentityStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        similarity_threshold = config.similarity_threshold,
        liveness_threshold = config.liveness_threshold,
        embedding_dim = config.embedding_dim,
        "configuration loaded"
    );

    let conn = db::open(&config.db_path).await?;
    let store = IdentityStore::open(conn.clone(), config.embedding_dim).await?;
    let log = AttendanceLog::new(conn);

    let pipeline = engine::load_pipeline(&config).context("loading models")?;
    let engine = engine::spawn_engine(pipeline)?;

    let service = Arc::new(AttendanceService::new(
        engine,
        store,
        log,
        Box::new(CosineMatcher::new(config.tie_epsilon)),
        config.similarity_threshold,
    )
    .with_synthetic_limit(config.max_synthetic_batch));
    let bus = AttendanceBus::new(service, Duration::from_secs(config.request_timeout_secs));

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, bus)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        name = BUS_NAME,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
