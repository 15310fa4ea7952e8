//! camstreamd - camera inference daemon
//!
//! This daemon:
//! 1. Loads configuration (CAMSTREAM_CONFIG file, then CAMSTREAM_* overrides)
//! 2. Registers the built-in detector backends
//! 3. Serves the inference API until Ctrl-C, then stops every open stream

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use camstream::{
    api::{ApiConfig, ApiServer, AppState},
    config::AppConfig,
    BackendRegistry,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load()?;
    let registry = BackendRegistry::builtin(&config.backend, config.model.clone())?;
    log::info!(
        "detector backend '{}' ({} registered)",
        config.backend,
        registry.list().join(", ")
    );

    let state = Arc::new(AppState::new(config.cameras.clone(), Arc::new(registry)));
    let api_handle = ApiServer::new(ApiConfig::from_app(&config), state).spawn()?;
    log::info!("inference api listening on {}", api_handle.addr);
    for camera in config.camera_ids() {
        log::info!(
            "camera {} at http://{}/cv/{}/infer_stream",
            camera,
            api_handle.addr,
            camera
        );
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("camstreamd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams and API server...");
    api_handle.stop()?;

    Ok(())
}
