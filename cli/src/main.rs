// podlink: command-line front end for the pod link core
//
// Scans with the host's Bluetooth stack, runs simulated pods, and manages the
// configuration file.

mod btle;
mod config;
mod simulate;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::*;
use futures::StreamExt;
use podlink_core::ble::DiscoveryState;
use podlink_core::{ApplicationFunctions, KeepAwakeGuard, PeripheralAdapter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "podlink")]
#[command(about = "Podlink: BLE link to insulin pods", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write daily-rolling log files here
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover radios with the host Bluetooth adapter
    Scan {
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },
    /// Run simulated pods with probing
    Simulate {
        #[arg(short, long, default_value = "2")]
        pods: usize,
        #[arg(short, long, default_value = "120")]
        seconds: u64,
        /// Make primary radios unreachable and backups unreliable
        #[arg(long)]
        flaky: bool,
    },
    /// Inspect the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Path,
    Reset,
}

/// Host without a keep-awake mechanism
struct HostApplication {
    data_dir: PathBuf,
}

impl ApplicationFunctions for HostApplication {
    fn acquire_radio_keep_awake(&self) -> KeepAwakeGuard {
        KeepAwakeGuard::noop()
    }

    fn data_directory(&self) -> PathBuf {
        self.data_dir.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // config commands must work even when the file does not parse
    if let Commands::Config { action } = cli.command {
        let _log_guard = init_logging(cli.verbose, cli.log_dir.as_deref())?;
        return cmd_config(action);
    }

    let config = config::Config::load()?;
    let log_dir = cli.log_dir.clone().or_else(|| config.log_dir.clone());
    let _log_guard = init_logging(cli.verbose, log_dir.as_deref())?;

    match cli.command {
        Commands::Scan { seconds } => cmd_scan(&config, seconds).await,
        Commands::Simulate { pods, seconds, flaky } => {
            simulate::run(&config, simulate::SimulateOptions { pods, seconds, flaky }).await
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn init_logging(verbose: u8, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(default_level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "podlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn cmd_scan(config: &config::Config, seconds: u64) -> Result<()> {
    let stack = btle::BtleStack::first_adapter()
        .await
        .context("Failed to open Bluetooth adapter")?;
    let app = Arc::new(HostApplication {
        data_dir: config::Config::data_dir()?,
    });
    let adapter = PeripheralAdapter::new(
        stack,
        app,
        config.service_ids.clone(),
        config.link.adapter.clone(),
    );

    println!("{}", format!("Scanning for {} seconds...", seconds).bold());
    println!();

    let mut discovery = adapter.discover_peripherals();
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        let found = tokio::select! {
            _ = &mut deadline => break,
            found = discovery.next() => found,
        };
        match found {
            Some(Ok(peripheral)) => {
                let rssi = peripheral
                    .rssi()
                    .map(|(rssi, _)| format!("{} dBm", rssi))
                    .unwrap_or_else(|| "connected".to_string());
                println!(
                    "  {} {:<24} {} {}",
                    "•".bright_green(),
                    peripheral.name().unwrap_or_else(|| "(unnamed)".to_string()).bright_cyan(),
                    peripheral.id().to_string().dimmed(),
                    rssi
                );
            }
            Some(Err(e)) => {
                println!("{} {}", "✗".red(), e);
                break;
            }
            None => break,
        }
    }
    drop(discovery);

    let peripherals = adapter.known_peripherals();
    println!();
    println!("{} ({} total)", "Peripherals".bold(), peripherals.len());
    for snapshot in peripherals.iter().map(|p| p.snapshot()) {
        let state = match snapshot.discovery {
            Some((DiscoveryState::Discovered, _)) => "discovered".green(),
            Some((DiscoveryState::Searching, _)) => "searching".yellow(),
            Some((DiscoveryState::NotFound, _)) => "not found".red(),
            None => "unknown".dimmed(),
        };
        let rssi = snapshot
            .rssi
            .map(|(rssi, _)| format!("{} dBm", rssi))
            .unwrap_or_default();
        println!(
            "  {} {:<24} {} {}",
            snapshot.id,
            snapshot.name.unwrap_or_default(),
            state,
            rssi
        );
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let path = config::Config::config_file()?;
            match config::Config::load_from(&path) {
                Ok(config) => println!("{}", serde_json::to_string_pretty(&config)?),
                Err(e) => {
                    println!("{} {:#}", "✗".red(), e);
                    println!("  Run {} to restore defaults", "podlink config reset".bright_green());
                }
            }
        }
        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
        ConfigAction::Reset => {
            config::Config::reset()?;
            println!(
                "{} Configuration reset: {}",
                "✓".green(),
                config::Config::config_file()?.display().to_string().bright_cyan()
            );
        }
    }
    Ok(())
}
