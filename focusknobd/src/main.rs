//! FocusKnob daemon entry point.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use focusknob_common::paths;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use focusknobd::device::{spawn_device_actor, Device, DeviceChannel, SystemPorts};
use focusknobd::shutdown::Shutdown;
use focusknobd::{logs, serve, DaemonOptions};

#[derive(Parser, Debug)]
#[command(name = "focusknobd", version)]
#[command(about = "FocusKnob companion daemon")]
struct Cli {
    /// IPC socket path
    #[arg(long, env = "FOCUSKNOB_SOCKET", default_value = paths::DEFAULT_SOCK)]
    socket: PathBuf,

    /// Settings file (config.toml or config.json)
    #[arg(long, env = "FOCUSKNOB_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for sync.log
    #[arg(long, env = "FOCUSKNOB_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// stderr plus the log file that `logs` requests read back.
fn init_tracing(debug: bool, log_dir: &Path) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    let (file_layer, file_error) = match logs::open_log_file(log_dir) {
        Ok(file) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        warn!("Logging to stderr only, cannot open {}: {}", log_dir.display(), e);
    }
}

fn spawn_signal_handlers(shutdown: Shutdown) {
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down daemon");
            ctrl_c.trigger(0);
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down daemon");
                shutdown.trigger(0);
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = cli.log_dir.clone().unwrap_or_else(paths::log_dir);
    init_tracing(cli.debug, &log_dir);
    info!("focusknobd version {}", env!("CARGO_PKG_VERSION"));

    let config_file = cli.config.clone().unwrap_or_else(paths::default_config_file);
    info!("Settings file: {}", config_file.display());

    let device: Arc<dyn Device> = Arc::new(
        spawn_device_actor(DeviceChannel::new(SystemPorts))
            .context("failed to start the serial thread")?,
    );

    let shutdown = Shutdown::new();
    spawn_signal_handlers(shutdown.clone());

    let options = DaemonOptions {
        socket: cli.socket,
        config_file,
        log_file: logs::log_file_in(&log_dir),
    };
    let code = serve(options, device, shutdown).await?;
    info!("focusknobd stopped");
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
