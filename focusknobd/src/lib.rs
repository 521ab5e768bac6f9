//! FocusKnob companion daemon.
//!
//! Keeps the knob on the serial line in sync (clock, buffered focus logs,
//! Jira/weather/calendar feeds) and serves the desktop UI over a Unix
//! socket, including the prompts the knob's Jira flows need answered.

pub mod desktop;
pub mod device;
pub mod duration;
pub mod handlers;
pub mod integrations;
pub mod ipc_server;
pub mod logs;
pub mod meetings;
pub mod shutdown;
pub mod sync;
pub mod wire;
pub mod workflows;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use focusknob_common::paths;
use tracing::{info, warn};

use crate::device::Device;
use crate::handlers::{DaemonHandler, StatusBoard};
use crate::integrations::IntegrationRegistry;
use crate::ipc_server::{EventSink, IpcServer};
use crate::shutdown::Shutdown;
use crate::sync::SyncService;
use crate::workflows::InputBroker;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub socket: PathBuf,
    pub config_file: PathBuf,
    pub log_file: PathBuf,
}

/// Serve the UI socket and run the sync loop against `device` until
/// `shutdown` fires. Returns the exit code the shutdown carried.
pub async fn serve(options: DaemonOptions, device: Arc<dyn Device>, shutdown: Shutdown) -> Result<i32> {
    // The calendar token cache lives next to the settings file.
    let cache_dir = options
        .config_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(paths::config_dir);
    let registry = Arc::new(IntegrationRegistry::new(
        options.config_file.clone(),
        cache_dir,
    ));
    if let Err(e) = registry.reload() {
        warn!("Starting without integrations: {}", e);
    }

    let server = Arc::new(IpcServer::new(&options.socket));
    let events: Arc<dyn EventSink> = server.clone();
    let inputs = Arc::new(InputBroker::new(events.clone()));
    let status = Arc::new(StatusBoard::new());
    let handler = Arc::new(DaemonHandler::new(
        status.clone(),
        registry.clone(),
        inputs.clone(),
        options.log_file.clone(),
        shutdown.clone(),
    ));
    server
        .start(handler)
        .await
        .with_context(|| format!("failed to listen on {}", options.socket.display()))?;

    let sync = SyncService::new(device, registry, events, inputs.clone(), status);
    let sync_task = tokio::spawn(sync.run(shutdown.subscribe()));

    let code = shutdown.wait().await;
    info!(exit_code = code, "Graceful shutdown initiated");
    inputs.release_all();
    if let Err(e) = sync_task.await {
        warn!("Sync loop ended abnormally: {}", e);
    }
    server.stop();
    Ok(code)
}
