use anyhow::{Context, Result};
use faceon_core::SharedControls;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{FaceOnService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "faceond starting");

    let config = Config::load()?;
    let controls = Arc::new(SharedControls::default());
    controls.set_mode(config.tunables.mode);
    controls
        .apply_tunables(&config.tunables.values)
        .context("invalid [tunables] in config")?;

    // Models and camera are loaded synchronously; the FIFO sink may block
    // until a reader attaches.
    let init_config = config.clone();
    let init_controls = controls.clone();
    let engine = tokio::task::spawn_blocking(move || engine::spawn_engine(&init_config, init_controls))
        .await?
        .map_err(|e| {
            tracing::error!(error = %e, "engine initialization failed");
            e
        })?;

    let service = FaceOnService::new(controls.clone(), config.embeddings_dir.clone());
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "faceond ready");

    let mut poll = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("interrupt received");
                break;
            }
            _ = poll.tick() => {
                if !controls.is_running() || engine.is_finished() {
                    break;
                }
            }
        }
    }

    tracing::info!("faceond shutting down");
    controls.stop();
    tokio::task::spawn_blocking(move || engine.join()).await??;

    Ok(())
}
