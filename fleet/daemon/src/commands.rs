//! Subcommand implementations
//!
//! Every command builds the same object graph: one registry, loaded from the
//! peer file, shared by a health monitor and a router.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fleet_core::{
    CapabilityProber, FleetConfig, HealthMonitor, HttpProber, PeerRegistry, PreferencePolicy,
    ProbeEvent, Router, RoutingRequest,
};

use crate::Command;

/// Registry, monitor and router built from one configuration
struct Fleet {
    registry: Arc<PeerRegistry>,
    monitor: Arc<HealthMonitor>,
    router: Router,
    peers_file: Option<PathBuf>,
}

impl Fleet {
    /// Build the object graph and load persisted peers
    fn open(config: &FleetConfig) -> Result<(Self, mpsc::UnboundedReceiver<ProbeEvent>)> {
        let prober = Arc::new(HttpProber::new(config.local.clone()));
        let registry = Arc::new(
            PeerRegistry::new(prober).with_probe_timeout(config.monitor.probe_timeout),
        );

        if let Some(ref path) = config.peers_file {
            registry
                .load(path)
                .with_context(|| format!("Failed to load peer file {}", path.display()))?;
        }

        let (monitor, events) = HealthMonitor::with_events(registry.clone(), config.monitor_config());
        let monitor = Arc::new(monitor);

        let router = Router::new(
            registry.clone(),
            PreferencePolicy::from_config(&config.policy),
            config.failure_policy(),
        )
        .with_monitor(monitor.clone());

        Ok((
            Self {
                registry,
                monitor,
                router,
                peers_file: config.peers_file.clone(),
            },
            events,
        ))
    }

    /// Persist the registry if a peer file is configured
    fn save(&self) -> Result<()> {
        if let Some(ref path) = self.peers_file {
            let saved = self
                .registry
                .save(path)
                .with_context(|| format!("Failed to save peer file {}", path.display()))?;
            debug!(path = %path.display(), peers = saved, "Peer file written");
        }
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

/// Run `command` against `config`
pub async fn dispatch(command: Command, config: FleetConfig) -> Result<()> {
    match command {
        Command::Run { .. } => run(&config).await,
        Command::Status => status(&config).await,
        Command::Peers => peers(&config),
        Command::AddPeer { ip, port, name } => add_peer(&config, &ip, port, name.as_deref()).await,
        Command::RemovePeer { id } => remove_peer(&config, &id),
        Command::Route {
            prompt,
            role,
            category,
            exclude,
            prefer,
        } => {
            let mut request = match role {
                Some(role) => RoutingRequest::for_role(role),
                None => RoutingRequest::new(prompt),
            }
            .with_excluded(exclude);
            if let Some(category) = category {
                request = request.with_category(category);
            }
            if !prefer.is_empty() {
                request = request.with_preferences(prefer);
            }
            route(&config, &request).await
        }
        Command::Probe { addr, timeout } => {
            let timeout = timeout.map_or(config.monitor.probe_timeout, Duration::from_secs);
            let prober = HttpProber::new(config.local.clone());
            let capability = prober
                .probe_remote(&addr, timeout)
                .await
                .with_context(|| format!("Probe of {addr} failed"))?;
            print_json(&capability)
        }
    }
}

// ============================================================================
// Long-running
// ============================================================================

/// Monitor the fleet until SIGINT or SIGTERM
async fn run(config: &FleetConfig) -> Result<()> {
    let (fleet, mut events) = Fleet::open(config)?;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    info!(
        peers = fleet.registry.len(),
        interval_secs = config.monitor.interval.as_secs(),
        seeds = config.seeds.len(),
        "Fleet daemon starting"
    );
    if let Some(report) = fleet.router.start().await {
        info!(discovered = report.discovered, "Startup discovery complete");
    }

    let handle = fleet.monitor.spawn();

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, re-reading peer file");
                if let Some(ref path) = fleet.peers_file {
                    match fleet.registry.load(path) {
                        Ok(report) => info!(loaded = report.loaded, skipped = report.skipped, "Peer file re-read"),
                        Err(e) => warn!(error = %e, "Failed to re-read peer file"),
                    }
                }
            }
            Some(event) = events.recv() => log_event(&event),
        }
    }

    handle.shutdown().await;
    fleet.save()?;
    info!("Fleet daemon stopped cleanly");
    Ok(())
}

fn log_event(event: &ProbeEvent) {
    match event {
        ProbeEvent::CycleCompleted(report) => info!(
            cycle = report.cycle,
            probed = report.probed,
            succeeded = report.succeeded,
            failed = report.failed,
            discovered = report.discovered,
            local = report.local_available,
            "Health cycle"
        ),
        ProbeEvent::PeerDiscovered { peer_id, addr } => {
            info!(peer = %peer_id, addr = %addr, "Discovered peer");
        }
        ProbeEvent::ProbeFailed { peer_id, class } => {
            debug!(peer = %peer_id, class = %class, "Peer unavailable");
        }
        ProbeEvent::ProbeSucceeded { .. } => {}
    }
}

// ============================================================================
// One-shot
// ============================================================================

async fn status(config: &FleetConfig) -> Result<()> {
    let (fleet, _events) = Fleet::open(config)?;
    if fleet.monitor.force_cycle().await.is_none() {
        warn!("Health cycle did not finish within the startup wait");
    }
    print_json(&fleet.router.get_status())
}

fn peers(config: &FleetConfig) -> Result<()> {
    let (fleet, _events) = Fleet::open(config)?;
    print_json(&fleet.router.list_peers())
}

async fn add_peer(config: &FleetConfig, ip: &str, port: u16, name: Option<&str>) -> Result<()> {
    let (fleet, _events) = Fleet::open(config)?;
    let id = fleet.router.add_peer(ip, port, name).await?;
    fleet.save()?;

    if let Some(peer) = fleet.registry.get(&id) {
        print_json(&peer)?;
    }
    Ok(())
}

fn remove_peer(config: &FleetConfig, id: &str) -> Result<()> {
    let (fleet, _events) = Fleet::open(config)?;
    let peer = fleet.router.remove_peer(id)?;
    fleet.save()?;
    print_json(&peer)
}

async fn route(config: &FleetConfig, request: &RoutingRequest) -> Result<()> {
    let (fleet, _events) = Fleet::open(config)?;
    if fleet.monitor.force_cycle().await.is_none() {
        warn!("Health cycle did not finish within the startup wait");
    }
    let result = fleet.router.route(request)?;
    print_json(&result)
}
