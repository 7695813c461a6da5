//! Health Monitor
//!
//! Background task that keeps the registry's capability snapshots fresh.
//!
//! # Cycle
//!
//! 1. Refresh the reserved local entry (when local probing is enabled)
//! 2. Probe every registered remote peer, at most `max_concurrent_probes` at a
//!    time, each bounded by `probe_timeout`
//! 3. Success replaces the peer's snapshot; failure flips it to unavailable
//!    and records a classified entry in the rolling error window
//! 4. Probe configured seed addresses that are not registered yet and admit
//!    the ones that answer
//! 5. Persist the registry if anything was learned
//!
//! Peers are never removed by the monitor, and a failing probe never aborts
//! the cycle for other peers.
//!
//! # Usage
//!
//! ```ignore
//! let monitor = Arc::new(HealthMonitor::new(registry.clone(), MonitorConfig::default()));
//! let handle = monitor.spawn();
//!
//! // On shutdown
//! handle.shutdown().await;
//! ```

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::capability::Capability;
use super::peer::{Peer, PeerAddr};
use super::registry::PeerRegistry;
use super::PeerId;
use crate::error::{ErrorClass, ProbeError, RegistryError};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the health monitor
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Time between cycles (default: 30 seconds)
    pub interval: Duration,

    /// Deadline for each probe (default: 5 seconds)
    pub probe_timeout: Duration,

    /// Bound on [`HealthMonitor::force_cycle`] (default: 5 seconds)
    pub startup_wait: Duration,

    /// How long failures stay in the error window (default: 5 minutes)
    pub error_window: Duration,

    /// Maximum probes in flight at once (default: 16)
    pub max_concurrent_probes: usize,

    /// Address of the local endpoint; `None` disables local probing
    pub local_addr: Option<PeerAddr>,

    /// Candidate addresses admitted once they answer a probe
    pub seeds: Vec<PeerAddr>,

    /// Where the registry is persisted after a productive cycle
    pub peers_file: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            startup_wait: Duration::from_secs(5),
            error_window: Duration::from_secs(300),
            max_concurrent_probes: 16,
            local_addr: None,
            seeds: Vec::new(),
            peers_file: None,
        }
    }
}

impl MonitorConfig {
    /// Create a config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cycle interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-probe deadline
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the forced-cycle bound
    #[must_use]
    pub fn with_startup_wait(mut self, wait: Duration) -> Self {
        self.startup_wait = wait;
        self
    }

    /// Enable local probing against `addr`
    #[must_use]
    pub fn with_local(mut self, addr: PeerAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Set the seed addresses
    #[must_use]
    pub fn with_seeds(mut self, seeds: Vec<PeerAddr>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Persist the registry to `path` after productive cycles
    #[must_use]
    pub fn with_peers_file(mut self, path: PathBuf) -> Self {
        self.peers_file = Some(path);
        self
    }

    /// Short intervals for tests
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(100),
            startup_wait: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

// ============================================================================
// Events and Reports
// ============================================================================

/// Events emitted by the monitor for observability
#[derive(Clone, Debug)]
pub enum ProbeEvent {
    /// A registered peer answered its probe
    ProbeSucceeded {
        /// Probed peer
        peer_id: PeerId,
        /// Number of models it serves
        models: usize,
        /// Reported load
        load_avg: f64,
    },
    /// A registered peer failed its probe
    ProbeFailed {
        /// Probed peer
        peer_id: PeerId,
        /// Failure classification
        class: ErrorClass,
    },
    /// A seed address answered and was admitted
    PeerDiscovered {
        /// Id of the new peer
        peer_id: PeerId,
        /// Its address
        addr: PeerAddr,
    },
    /// A cycle finished
    CycleCompleted(CycleReport),
}

/// Summary of one monitor cycle
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Sequence number of the cycle, starting at 1
    pub cycle: u64,
    /// Registered remote peers probed
    pub probed: usize,
    /// Probes that succeeded
    pub succeeded: usize,
    /// Probes that failed
    pub failed: usize,
    /// Seed addresses admitted
    pub discovered: usize,
    /// Whether the local entry was refreshed and available
    pub local_available: bool,
    /// Wall time of the cycle
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}

/// One entry of the rolling error window
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProbeFailure {
    /// Probed peer (the address for a seed)
    pub peer_id: PeerId,
    /// Probed address
    pub addr: String,
    /// Failure classification
    pub class: ErrorClass,
    /// Error text
    pub message: String,
    /// When the failure was recorded
    pub at: DateTime<Utc>,
}

/// Failures newer than the window, oldest first
#[derive(Debug)]
struct ErrorWindow {
    entries: VecDeque<(Instant, ProbeFailure)>,
    span: Duration,
}

impl ErrorWindow {
    fn new(span: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            span,
        }
    }

    fn push(&mut self, failure: ProbeFailure) {
        let now = Instant::now();
        self.prune(now);
        self.entries.push_back((now, failure));
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.entries.front() {
            if now.duration_since(*at) > self.span {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn snapshot(&mut self) -> Vec<ProbeFailure> {
        self.prune(Instant::now());
        self.entries.iter().map(|(_, f)| f.clone()).collect()
    }
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Periodically re-probes every registered peer
pub struct HealthMonitor {
    /// Registry being kept fresh
    registry: Arc<PeerRegistry>,
    /// Configuration
    config: MonitorConfig,
    /// Rolling error window
    errors: Mutex<ErrorWindow>,
    /// Channel for emitting probe events
    event_tx: Option<mpsc::UnboundedSender<ProbeEvent>>,
    /// Completed cycle counter
    cycles: AtomicU64,
    /// Serialises timer cycles with forced cycles
    cycle_lock: tokio::sync::Mutex<()>,
}

impl HealthMonitor {
    /// Create a monitor for `registry`
    #[must_use]
    pub fn new(registry: Arc<PeerRegistry>, config: MonitorConfig) -> Self {
        let errors = Mutex::new(ErrorWindow::new(config.error_window));
        Self {
            registry,
            config,
            errors,
            event_tx: None,
            cycles: AtomicU64::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a monitor with an event channel for observability
    #[must_use]
    pub fn with_events(
        registry: Arc<PeerRegistry>,
        config: MonitorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProbeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut monitor = Self::new(registry, config);
        monitor.event_tx = Some(tx);
        (monitor, rx)
    }

    /// Monitor configuration
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Registry this monitor updates
    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Number of cycles completed so far
    #[must_use]
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Failures recorded within the error window, oldest first
    #[must_use]
    pub fn recent_errors(&self) -> Vec<ProbeFailure> {
        self.errors.lock().snapshot()
    }

    fn emit_event(&self, event: ProbeEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn record_failure(&self, peer_id: &str, error: &ProbeError) {
        self.errors.lock().push(ProbeFailure {
            peer_id: peer_id.to_string(),
            addr: error.addr().to_string(),
            class: error.class(),
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    // ------------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------------

    /// Run one full cycle now
    ///
    /// Concurrent callers are serialised; a cycle never fails.
    pub async fn run_cycle(&self) -> CycleReport {
        let _guard = self.cycle_lock.lock().await;
        let started = Instant::now();
        let mut report = CycleReport::default();

        if let Some(ref addr) = self.config.local_addr {
            let capability = self.registry.prober().probe_local().await;
            report.local_available = capability.available;
            self.registry.register_local(addr.clone(), capability);
        }

        let targets: Vec<(PeerId, PeerAddr)> = self
            .registry
            .get_snapshot()
            .into_iter()
            .filter(|p| !p.is_local())
            .map(|p| (p.id, p.addr))
            .collect();
        report.probed = targets.len();

        for (peer_id, _, result) in self.probe_all(targets).await {
            match result {
                Ok(capability) => {
                    let models = capability.models.len();
                    let load_avg = capability.load_avg;
                    match self.registry.update(&peer_id, capability) {
                        Ok(()) => {
                            report.succeeded += 1;
                            tracing::debug!(peer = %peer_id, models, load_avg, "Probe succeeded");
                            self.emit_event(ProbeEvent::ProbeSucceeded {
                                peer_id,
                                models,
                                load_avg,
                            });
                        }
                        Err(RegistryError::NotFound(_)) => {
                            tracing::debug!(peer = %peer_id, "Peer removed during cycle");
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer_id, error = %e, "Failed to apply probe result");
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        peer = %peer_id,
                        class = %e.class(),
                        error = %e,
                        "Probe failed; marking peer unavailable"
                    );
                    if let Err(RegistryError::NotFound(_)) = self.registry.mark_unavailable(&peer_id) {
                        tracing::debug!(peer = %peer_id, "Peer removed during cycle");
                    }
                    self.record_failure(&peer_id, &e);
                    self.emit_event(ProbeEvent::ProbeFailed {
                        peer_id,
                        class: e.class(),
                    });
                }
            }
        }

        report.discovered = self.discover_seeds().await;

        if report.succeeded + report.discovered > 0 {
            if let Some(ref path) = self.config.peers_file {
                if let Err(e) = self.registry.save(path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to persist peers");
                }
            }
        }

        report.cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        report.duration = started.elapsed();
        tracing::debug!(
            cycle = report.cycle,
            probed = report.probed,
            succeeded = report.succeeded,
            failed = report.failed,
            discovered = report.discovered,
            "Health cycle completed"
        );
        self.emit_event(ProbeEvent::CycleCompleted(report.clone()));
        report
    }

    /// Run a cycle now, bounded by `startup_wait`
    ///
    /// Returns `None` if the cycle did not finish in time; whatever it had
    /// applied to the registry by then is kept.
    pub async fn force_cycle(&self) -> Option<CycleReport> {
        match tokio::time::timeout(self.config.startup_wait, self.run_cycle()).await {
            Ok(report) => Some(report),
            Err(_) => {
                tracing::warn!(
                    wait_ms = u64::try_from(self.config.startup_wait.as_millis()).unwrap_or(u64::MAX),
                    "Forced discovery cycle did not finish within startup wait"
                );
                None
            }
        }
    }

    async fn probe_all(
        &self,
        targets: Vec<(PeerId, PeerAddr)>,
    ) -> Vec<(PeerId, PeerAddr, Result<Capability, ProbeError>)> {
        let prober = self.registry.prober();
        let timeout = self.config.probe_timeout;

        stream::iter(targets)
            .map(|(peer_id, addr)| async move {
                let result = prober.probe_remote(&addr, timeout).await;
                (peer_id, addr, result)
            })
            .buffer_unordered(self.config.max_concurrent_probes.max(1))
            .collect()
            .await
    }

    async fn discover_seeds(&self) -> usize {
        let candidates: Vec<(PeerId, PeerAddr)> = self
            .config
            .seeds
            .iter()
            .filter(|seed| !self.registry.contains_ip(&seed.ip))
            .map(|seed| (seed.to_string(), seed.clone()))
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        let mut discovered = 0;
        for (label, addr, result) in self.probe_all(candidates).await {
            match result {
                Ok(capability) => match self.registry.admit(Peer::new(addr.clone(), None, capability)) {
                    Ok(peer_id) => {
                        discovered += 1;
                        tracing::info!(peer = %peer_id, addr = %addr, "Discovered seed peer");
                        self.emit_event(ProbeEvent::PeerDiscovered { peer_id, addr });
                    }
                    Err(e) => {
                        tracing::debug!(addr = %addr, error = %e, "Seed already registered");
                    }
                },
                Err(e) => {
                    tracing::debug!(addr = %addr, class = %e.class(), "Seed did not answer");
                    self.record_failure(&label, &e);
                }
            }
        }
        discovered
    }

    // ------------------------------------------------------------------------
    // Background Task
    // ------------------------------------------------------------------------

    /// Start the periodic loop
    ///
    /// The first cycle runs immediately. The loop ends when
    /// [`HealthMonitorHandle::shutdown`] is called or the handle is dropped.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> HealthMonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);

        let task = tokio::spawn(async move {
            tracing::info!(
                interval_secs = monitor.config.interval.as_secs(),
                timeout_secs = monitor.config.probe_timeout.as_secs(),
                max_concurrent = monitor.config.max_concurrent_probes,
                "Starting health monitor"
            );

            let mut ticker = tokio::time::interval(monitor.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => break,
                            _ = monitor.run_cycle() => {}
                        }
                    }
                }
            }

            tracing::info!("Health monitor stopped");
        });

        HealthMonitorHandle { shutdown_tx, task }
    }
}

/// Owner's handle on a running monitor loop
#[derive(Debug)]
pub struct HealthMonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HealthMonitorHandle {
    /// Signal the loop to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Health monitor task ended abnormally");
        }
    }

    /// Whether the loop has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
