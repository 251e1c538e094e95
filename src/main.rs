#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # modemctl
//!
//! Command-line front end for the modem device-control core.
//!
//! ## Subcommands
//!
//! - `modemctl run` (default): connect, optionally poll telemetry, and print
//!   every push event as a JSON line until SIGINT/SIGTERM
//! - `modemctl at <text>`: send one raw AT command
//! - `modemctl signal | carriers | lock-status | temperature`: one reading
//! - `modemctl lock --band n78 --arfcn 627264 --pci 123`: lock onto a cell
//! - `modemctl unlock`: clear any cell lock
//! - `modemctl scan [--restore]`: run a cell scan, optionally re-attaching
//! - `modemctl restore`: re-attach a modem left detached
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use modemctl::{Config, Device, DeviceEvent, ModemError, ScanError};

/// Device-control core for cellular modems.
#[derive(Parser)]
#[command(name = "modemctl", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected and print push events (default when no subcommand given).
    Run {
        /// Poll telemetry even if `[monitor] enabled = false`.
        #[arg(long)]
        monitor: bool,
        /// Polling interval in seconds.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Send a raw AT command.
    At { text: String },
    /// Current signal quality.
    Signal,
    /// Carrier aggregation status.
    Carriers,
    /// Current cell lock.
    LockStatus,
    /// Modem temperature.
    Temperature,
    /// Lock onto a single cell.
    Lock {
        /// `n78` for NR, `B3`/`b3`/`3` for LTE.
        #[arg(long)]
        band: String,
        #[arg(long)]
        arfcn: u32,
        #[arg(long)]
        pci: u16,
    },
    /// Clear the cell lock.
    Unlock,
    /// Scan for nearby cells. The modem stays detached unless `--restore`.
    Scan {
        #[arg(long)]
        restore: bool,
    },
    /// Re-attach to the network.
    Restore,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Modem(#[from] ModemError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Interrupted(&'static str),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("modemctl: {e}");
            return ExitCode::from(2);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("modemctl v{} starting", env!("CARGO_PKG_VERSION"));

    let device = match Device::start(&config).await {
        Ok(device) => device,
        Err(e) => {
            error!("Modem: failed to connect: {e}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Commands::Run {
        monitor: false,
        interval: None,
    });
    let result = run(&device, command).await;
    device.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(device: &Device, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Run { monitor, interval } => run_events(device, monitor, interval).await,
        Commands::At { text } => print_json(&device.send_raw_command(&text).await?),
        Commands::Signal => print_json(&device.get_signal().await?),
        Commands::Carriers => print_json(&device.get_carrier_aggregation_status().await?),
        Commands::LockStatus => print_json(&device.get_lock_status().await?),
        Commands::Temperature => print_json(&device.get_temperature().await?),
        Commands::Lock { band, arfcn, pci } => {
            print_json(&device.lock_cell(&band, arfcn, pci).await?)
        }
        Commands::Unlock => {
            device.unlock_cell().await?;
            print_json(&device.get_lock_status().await?)
        }
        Commands::Scan { restore } => run_scan(device, restore).await,
        Commands::Restore => {
            device.reattach().await?;
            info!("Network restored");
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_events(
    device: &Device,
    monitor: bool,
    interval: Option<u64>,
) -> Result<(), CliError> {
    print_json(device.modem_info())?;
    if monitor || interval.is_some() {
        device.enable_monitoring(true, interval.map(Duration::from_secs));
    }

    let mut events = device.subscribe();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(n)) => warn!("Events: subscriber lagged, {n} dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    info!("Shutting down...");
    Ok(())
}

/// Print scan progress as JSON lines until the session completes or fails.
async fn run_scan(device: &Device, restore: bool) -> Result<(), CliError> {
    let mut events = device.subscribe();
    let id = device.start_scan()?;
    info!("Scan: session {id} started");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let failed = loop {
        tokio::select! {
            () = &mut shutdown => {
                warn!("Scan: interrupted, the modem may be detached; run `modemctl restore`");
                return Err(CliError::Interrupted("scan interrupted"));
            }
            event = events.recv() => match event {
                Ok(event @ (DeviceEvent::ScanProgress { .. }
                    | DeviceEvent::ScanComplete { .. }
                    | DeviceEvent::ScanError { .. })) => {
                    println!("{}", serde_json::to_string(&event)?);
                    match event {
                        DeviceEvent::ScanComplete { .. } => break false,
                        DeviceEvent::ScanError { .. } => break true,
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Events: subscriber lagged, {n} dropped"),
                Err(RecvError::Closed) => return Err(CliError::Interrupted("event bus closed")),
            },
        }
    };

    if let Some(session) = device.scan_session() {
        print_json(&session)?;
    }
    if restore || failed {
        device.restore_network().await?;
        info!("Scan: network restored");
    } else {
        info!("Scan: modem left detached; run `modemctl restore` to re-attach");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
