//! Fleet Daemon - Peer Health Monitoring and Routing Administration
//!
//! Keeps the peer registry fresh in the background (`run`) and exposes the
//! administrative operations of the router as one-shot subcommands.
//!
//! # Usage
//!
//! ```bash
//! # Monitor the fleet until interrupted
//! fleet-daemon run --seed 10.0.0.12 --seed 10.0.0.13:11500
//!
//! # Register and inspect peers
//! fleet-daemon add-peer 10.0.0.12 --name gpu-box
//! fleet-daemon peers
//! fleet-daemon status
//!
//! # Ask where a task would run
//! fleet-daemon route "write python code to parse a CSV"
//! fleet-daemon --strict route --role researcher
//!
//! # Verbose logging
//! RUST_LOG=debug fleet-daemon run
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (the registry is saved)
//! - `SIGHUP`: Re-read the peer file

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use fleet_core::{load_config_from_path, ConfigOverrides, FleetConfig, PeerAddr, RouterMode};

/// Fleet Daemon - peer discovery and model routing for a local inference fleet
#[derive(Parser, Debug)]
#[command(name = "fleet-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, global = true, env = "FLEET_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Peer file path (overrides the config file)
    #[arg(short = 'p', long, global = true, value_name = "FILE")]
    peers_file: Option<PathBuf>,

    /// Surface selection errors instead of falling back to the local endpoint
    #[arg(long, global = true)]
    strict: bool,

    /// Do not probe or select the local node
    #[arg(long, global = true)]
    no_local: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        global = true,
        env = "FLEET_LOG_LEVEL",
        default_value = "info"
    )]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Daemon subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the health monitor until interrupted
    Run {
        /// Seconds between health cycles
        #[arg(short = 'i', long, value_name = "SECS")]
        interval: Option<u64>,

        /// Candidate peer address (`host` or `host:port`), repeatable
        #[arg(short = 's', long = "seed", value_name = "ADDR")]
        seeds: Vec<PeerAddr>,
    },

    /// Probe every peer once and print the fleet status as JSON
    Status,

    /// List registered peers as JSON
    Peers,

    /// Probe and register a peer
    AddPeer {
        /// IP address or hostname
        ip: String,

        /// Model-serving port
        #[arg(long, default_value_t = fleet_core::DEFAULT_MODEL_PORT)]
        port: u16,

        /// Peer name (defaults to the IP)
        #[arg(short = 'n', long)]
        name: Option<String>,
    },

    /// Remove a peer by id
    RemovePeer {
        /// Peer id
        id: String,
    },

    /// Print the endpoint a task would be routed to
    Route {
        /// Task prompt used for keyword classification
        #[arg(default_value = "")]
        prompt: String,

        /// Route for an agent role instead of the prompt
        #[arg(long)]
        role: Option<String>,

        /// Force a task category
        #[arg(long)]
        category: Option<String>,

        /// Peer id to skip, repeatable
        #[arg(short = 'x', long = "exclude", value_name = "PEER")]
        exclude: Vec<String>,

        /// Preferred model replacing the category list, repeatable
        #[arg(long = "prefer", value_name = "MODEL")]
        prefer: Vec<String>,
    },

    /// Probe a single address without registering it
    Probe {
        /// Address (`host` or `host:port`)
        addr: PeerAddr,

        /// Probe deadline in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

/// Initialize logging with the specified level
///
/// Logs go to stderr so subcommand output on stdout stays machine-readable.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("fleet_daemon={level},fleet_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve configuration: file, then environment, then CLI flags
fn resolve_config(cli: &Cli) -> Result<FleetConfig> {
    let path = cli.config.clone().or_else(fleet_core::default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref peers_file) = cli.peers_file {
        overrides = overrides.with_peers_file(peers_file.clone());
    }
    if cli.strict {
        overrides = overrides.with_mode(RouterMode::Strict);
    }
    if cli.no_local {
        overrides = overrides.with_local_enabled(false);
    }
    if let Command::Run {
        interval, seeds, ..
    } = &cli.command
    {
        if let Some(secs) = interval {
            overrides = overrides.with_interval_secs(*secs);
        }
        overrides = overrides.with_seeds(seeds.clone());
    }
    overrides.apply(&mut config);

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    let config = resolve_config(&cli)?;
    info!(
        source = %config.source(),
        mode = %config.mode,
        peers_file = ?config.peers_file,
        "Configuration resolved"
    );

    let result = commands::dispatch(cli.command, config).await;
    if let Err(ref e) = result {
        error!(error = %e, "Command failed");
    }
    result
}
