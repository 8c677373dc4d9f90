//! Companion server binary.
//!
//! # Usage
//!
//! ```bash
//! # Plain HTTP on the default port
//! decenza-server --data-dir ~/.local/share/decenza
//!
//! # TLS with a generated self-signed certificate
//! decenza-server --data-dir ~/.local/share/decenza --tls
//!
//! # Attach a machine over USB serial
//! decenza-server --data-dir ~/.local/share/decenza --serial-port /dev/ttyACM0
//! ```

use std::sync::Arc;

use clap::Parser;
use decenza_backup::BackupEngine;
use decenza_core::{PlatformServices, SettingsStore};
use decenza_device::DeviceSession;
use decenza_history::ShotHistory;
use decenza_server::{CompanionServer, HealthProbes, ServerConfig, ServerState};
use decenza_transport::serial::SerialTransport;
use decenza_transport::watcher::{OsScanner, WatcherEvent, spawn_watcher};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Decenza DE1 companion server
#[derive(Parser, Debug)]
#[command(name = "decenza-server")]
#[command(about = "DE1 espresso machine companion server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8888")]
    bind: String,

    /// Data directory (database, settings, profiles, backups)
    #[arg(long, default_value = "./decenza-data")]
    data_dir: String,

    /// Cache directory (upload staging, backup assembly)
    #[arg(long, default_value = "./decenza-cache")]
    cache_dir: String,

    /// Terminate TLS (self-signed pair generated on first run)
    #[arg(long)]
    tls: bool,

    /// Path to a TLS certificate (PEM); implies --tls
    #[arg(long)]
    cert: Option<String>,

    /// Path to the matching TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Serial port of an attached machine (e.g. /dev/ttyACM0)
    #[arg(long)]
    serial_port: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("decenza server starting");

    let paths = PlatformServices::new(&args.data_dir, &args.cache_dir)?;
    let settings = Arc::new(SettingsStore::load(paths.settings_path())?);
    let history = ShotHistory::open(paths.shot_db_path())?;
    let backup = BackupEngine::new(paths.clone(), Arc::clone(&settings), history.clone());
    backup.start_scheduler();

    let device = match &args.serial_port {
        Some(port) => match SerialTransport::open(port) {
            Ok(transport) => {
                tracing::info!(port, "machine attached over serial");
                Some(DeviceSession::attach(transport))
            },
            Err(e) => {
                tracing::warn!(port, error = %e, "failed to open serial port");
                None
            },
        },
        None => None,
    };

    let config = ServerConfig {
        bind_address: args.bind,
        tls: args.tls || args.cert.is_some(),
        cert_path: args.cert.as_ref().map(Into::into),
        key_path: args.key.as_ref().map(Into::into),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let state = Arc::new(ServerState::new(
        config,
        paths,
        settings,
        history,
        backup,
        device,
        HealthProbes::default(),
    ));

    let server = CompanionServer::start(Arc::clone(&state)).await?;
    tracing::info!(url = %state.url(), addr = %server.local_addr(), "companion server ready");

    // Without a fixed port, watch the USB bus and attach machines as they
    // appear
    if args.serial_port.is_none() {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut events = spawn_watcher(OsScanner);
            while let Some(event) = events.recv().await {
                match event {
                    WatcherEvent::MachineFound { port_name, serial_number } => {
                        match SerialTransport::open(&port_name) {
                            Ok(transport) => {
                                tracing::info!(
                                    port_name,
                                    serial_number = serial_number.as_deref().unwrap_or("n/a"),
                                    "machine found, attaching session"
                                );
                                state.attach_device(DeviceSession::attach(transport));
                            },
                            Err(e) => {
                                tracing::warn!(port_name, error = %e, "failed to open found port");
                            },
                        }
                    },
                    WatcherEvent::MachineLost { port_name } => {
                        tracing::warn!(port_name, "machine port disappeared, detaching");
                        state.detach_device();
                    },
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
