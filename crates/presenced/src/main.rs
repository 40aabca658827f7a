use anyhow::Result;
use presence_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod service;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = config::Config::from_env();
    if let Some(dir) = config.db_path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let store = SqliteStore::open(&config.db_path).await?;
    tracing::info!(db = %config.db_path.display(), "attendance database opened");

    let service = Arc::new(service::AttendanceService::new(
        store,
        config.match_threshold,
        Duration::from_secs(config.dependency_timeout_secs),
    ));

    let enrolled = service.refresh_snapshot().await?;
    tracing::info!(
        enrolled,
        threshold = config.match_threshold,
        "template snapshot loaded"
    );

    service::spawn_refresher(
        service.clone(),
        Duration::from_secs(config.snapshot_refresh_secs),
    );

    let _conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(
            dbus_interface::OBJECT_PATH,
            dbus_interface::AttendanceInterface::new(service),
        )?
        .build()
        .await?;

    tracing::info!(bus = dbus_interface::BUS_NAME, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
