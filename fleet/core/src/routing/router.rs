//! Fleet Router
//!
//! The main entry point for picking where a request runs. Reads a registry
//! snapshot, walks the preference list and returns the first admissible
//! `(endpoint, peer, model)`.
//!
//! # Selection
//!
//! For each model in preference order, the candidates are the non-excluded,
//! available peers serving it, ranked:
//!
//! 1. the local entry
//! 2. remote peers by ascending `load_avg`
//! 3. ascending peer id on ties
//!
//! The first non-empty tier wins; later tiers are never consulted.
//!
//! # Usage
//!
//! ```ignore
//! let router = Router::new(registry, PreferencePolicy::default(), FailurePolicy::default())
//!     .with_monitor(monitor);
//! router.start().await;
//!
//! let result = router.for_task("write python code")?;
//! ```

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::fallback::{FailurePolicy, RouterMode};
use super::metrics::{RouterStats, StatsSnapshot};
use super::policy::{PreferencePolicy, RoutingRequest, RoutingResult};
use crate::discovery::{CycleReport, HealthMonitor, Peer, PeerId, PeerRegistry, ProbeFailure};
use crate::error::{RegistryError, RouterError};

// ============================================================================
// Endpoint Selector
// ============================================================================

/// Outcome of a successful selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Selected triple
    pub result: RoutingResult,
    /// Index of the preference that was served (0 = first)
    pub tier: usize,
    /// Category the request resolved to
    pub category: String,
}

/// Pure selection over a peer snapshot; no I/O
#[derive(Clone, Debug, Default)]
pub struct EndpointSelector {
    policy: PreferencePolicy,
}

impl EndpointSelector {
    /// Create a selector for `policy`
    #[must_use]
    pub fn new(policy: PreferencePolicy) -> Self {
        Self { policy }
    }

    /// Policy in use
    #[must_use]
    pub fn policy(&self) -> &PreferencePolicy {
        &self.policy
    }

    /// Category for a request: explicit, then role, then prompt keywords
    #[must_use]
    pub fn category_for(&self, request: &RoutingRequest) -> String {
        if let Some(ref category) = request.explicit_category {
            return category.clone();
        }
        if let Some(ref role) = request.role {
            return self.policy.category_for_role(role);
        }
        self.policy.classify(&request.prompt)
    }

    /// Select an endpoint for `request` among `peers`
    ///
    /// # Errors
    ///
    /// - [`RouterError::System`] when the resolved preference list is empty
    /// - [`RouterError::NoAvailableEndpoint`] when no tier has a candidate
    pub fn select(&self, request: &RoutingRequest, peers: &[Peer]) -> Result<Selection, RouterError> {
        let category = self.category_for(request);
        let preferences = self
            .policy
            .resolve_preferences(&category, request.model_preference_override.as_deref());

        if preferences.is_empty() {
            return Err(RouterError::System(format!(
                "no model preferences configured for category '{category}'"
            )));
        }

        for (tier, model) in preferences.iter().enumerate() {
            let best = peers
                .iter()
                .filter(|p| !request.excluded_peer_ids.contains(&p.id) && p.serves(model))
                .min_by(|a, b| rank(a, b));

            if let Some(peer) = best {
                return Ok(Selection {
                    result: RoutingResult {
                        endpoint_url: peer.endpoint_url(),
                        peer_id: peer.id.clone(),
                        model_id: model.clone(),
                        is_fallback: false,
                    },
                    tier,
                    category,
                });
            }
        }

        Err(RouterError::NoAvailableEndpoint {
            category,
            tried: preferences,
        })
    }
}

/// Local first, then lower load, then lower id
fn rank(a: &Peer, b: &Peer) -> Ordering {
    b.is_local()
        .cmp(&a.is_local())
        .then_with(|| a.capability.load_avg.total_cmp(&b.capability.load_avg))
        .then_with(|| a.id.cmp(&b.id))
}

// ============================================================================
// Status
// ============================================================================

/// One peer as reported by [`Router::get_status`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PeerStatus {
    /// Peer id
    pub id: PeerId,
    /// Endpoint base URL
    pub endpoint_url: String,
    /// Whether the last probe succeeded
    pub available: bool,
    /// Served models
    pub models: Vec<String>,
    /// Last reported load
    pub load_avg: f64,
    /// Time of the last successful probe
    pub last_seen: DateTime<Utc>,
}

impl From<&Peer> for PeerStatus {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id.clone(),
            endpoint_url: peer.endpoint_url(),
            available: peer.is_available(),
            models: peer.capability.models.iter().cloned().collect(),
            load_avg: peer.capability.load_avg,
            last_seen: peer.capability.last_seen,
        }
    }
}

/// Fleet overview for administrative callers
#[derive(Clone, Debug, Serialize)]
pub struct FleetStatus {
    /// Strict or resilient
    pub mode: RouterMode,
    /// Registered peers, including the local entry
    pub peers_total: usize,
    /// Peers whose last probe succeeded
    pub peers_available: usize,
    /// Per-peer detail, ordered by id
    pub peers: Vec<PeerStatus>,
    /// Selection counters
    pub stats: StatsSnapshot,
    /// Monitor cycles completed (0 without a monitor)
    pub cycles_completed: u64,
    /// Probe failures within the monitor's error window
    pub recent_errors: Vec<ProbeFailure>,
}

// ============================================================================
// Router
// ============================================================================

/// Selects endpoints from the fleet under a failure policy
pub struct Router {
    /// Shared peer registry
    registry: Arc<PeerRegistry>,
    /// Selection logic
    selector: EndpointSelector,
    /// What errors turn into
    failure_policy: FailurePolicy,
    /// Monitor used for the startup discovery cycle and status
    monitor: Option<Arc<HealthMonitor>>,
    /// Selection counters
    stats: RouterStats,
}

impl Router {
    /// Create a router over `registry`
    #[must_use]
    pub fn new(
        registry: Arc<PeerRegistry>,
        policy: PreferencePolicy,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            registry,
            selector: EndpointSelector::new(policy),
            failure_policy,
            monitor: None,
            stats: RouterStats::new(),
        }
    }

    /// Attach the health monitor that feeds `registry`
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Get the registry
    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Get the selection policy
    #[must_use]
    pub fn policy(&self) -> &PreferencePolicy {
        self.selector.policy()
    }

    /// Get the failure policy
    #[must_use]
    pub fn failure_policy(&self) -> &FailurePolicy {
        &self.failure_policy
    }

    /// Get the selection counters
    #[must_use]
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Run the startup discovery cycle if the registry is empty
    ///
    /// Bounded by the monitor's startup wait. Returns the cycle report when a
    /// cycle ran to completion.
    pub async fn start(&self) -> Option<CycleReport> {
        if !self.registry.is_empty() {
            return None;
        }
        let monitor = self.monitor.as_ref()?;

        tracing::info!("Registry empty, running startup discovery");
        let report = monitor.force_cycle().await;
        tracing::info!(peers = self.registry.len(), "Startup discovery finished");
        report
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    /// Select an endpoint for `request`
    ///
    /// # Errors
    ///
    /// Under [`FailurePolicy::Strict`], [`RouterError::NoAvailableEndpoint`]
    /// when every tier is empty and [`RouterError::System`] when there are no
    /// preferences. A resilient router never fails.
    pub fn route(&self, request: &RoutingRequest) -> Result<RoutingResult, RouterError> {
        let snapshot = self.registry.get_snapshot();

        match self.selector.select(request, &snapshot) {
            Ok(selection) => {
                self.stats.record_selection(
                    &selection.result.peer_id,
                    &selection.result.model_id,
                    selection.tier,
                );
                tracing::debug!(
                    category = %selection.category,
                    peer = %selection.result.peer_id,
                    model = %selection.result.model_id,
                    tier = selection.tier,
                    "Selected endpoint"
                );
                Ok(selection.result)
            }
            Err(e) => {
                match e {
                    RouterError::NoAvailableEndpoint { .. } => self.stats.exhaustions.inc(),
                    RouterError::System(_) => self.stats.system_errors.inc(),
                }
                if snapshot.is_empty() {
                    tracing::debug!("Selection against an empty registry");
                }
                let recovered = self.failure_policy.recover(e);
                if recovered.is_ok() {
                    self.stats.fallbacks.inc();
                }
                recovered
            }
        }
    }

    /// Low-level selection used by retry loops
    ///
    /// # Errors
    ///
    /// See [`Router::route`].
    pub fn select(
        &self,
        prompt: &str,
        excluded_peers: &BTreeSet<PeerId>,
        override_preferences: Option<&[String]>,
    ) -> Result<RoutingResult, RouterError> {
        let mut request = RoutingRequest::new(prompt).with_excluded(excluded_peers.iter().cloned());
        request.model_preference_override = override_preferences.map(<[String]>::to_vec);
        self.route(&request)
    }

    /// Select for a free-text task, classified by keywords
    ///
    /// # Errors
    ///
    /// See [`Router::route`].
    pub fn for_task(&self, prompt: &str) -> Result<RoutingResult, RouterError> {
        self.route(&RoutingRequest::new(prompt))
    }

    /// Select for an agent role
    ///
    /// # Errors
    ///
    /// See [`Router::route`].
    pub fn for_role(&self, role: &str) -> Result<RoutingResult, RouterError> {
        self.route(&RoutingRequest::for_role(role))
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    /// Probe and register a peer
    ///
    /// # Errors
    ///
    /// See [`PeerRegistry::add_peer`].
    pub async fn add_peer(
        &self,
        ip: &str,
        port: u16,
        name: Option<&str>,
    ) -> Result<PeerId, RegistryError> {
        self.registry.add_peer(ip, port, name).await
    }

    /// Remove a peer
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn remove_peer(&self, peer_id: &str) -> Result<Peer, RegistryError> {
        self.registry.remove_peer(peer_id)
    }

    /// Every registered peer, ordered by id
    #[must_use]
    pub fn list_peers(&self) -> Vec<Peer> {
        self.registry.get_snapshot()
    }

    /// Fleet overview
    #[must_use]
    pub fn get_status(&self) -> FleetStatus {
        let peers = self.registry.get_snapshot();
        FleetStatus {
            mode: self.failure_policy.mode(),
            peers_total: peers.len(),
            peers_available: peers.iter().filter(|p| p.is_available()).count(),
            peers: peers.iter().map(PeerStatus::from).collect(),
            stats: self.stats.snapshot(),
            cycles_completed: self.monitor.as_ref().map_or(0, |m| m.cycles_completed()),
            recent_errors: self
                .monitor
                .as_ref()
                .map(|m| m.recent_errors())
                .unwrap_or_default(),
        }
    }
}
