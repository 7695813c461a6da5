//! Fleet Core - Peer Discovery and Distributed Model Routing
//!
//! This crate keeps a live view of the machines on a local network that serve
//! language models and, for each task, picks the peer and model that should
//! serve it. It is headless: the daemon binary drives it, and any agent
//! runtime can embed it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Router                                │
//! │   route / for_task / for_role        add_peer / status / peers   │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │ PreferencePolicy │─▶│ EndpointSelector │─▶│ FailurePolicy  │  │
//! │  └──────────────────┘  └────────┬─────────┘  └────────────────┘  │
//! └─────────────────────────────────┼────────────────────────────────┘
//!                                   │ snapshot
//! ┌─────────────────────────────────┼────────────────────────────────┐
//! │                           DISCOVERY                              │
//! │  ┌──────────────┐   ┌───────────┴──────┐   ┌──────────────────┐  │
//! │  │HealthMonitor │──▶│   PeerRegistry   │◀──│ CapabilityProber │  │
//! │  │ (periodic)   │   │ (peers.json)     │   │ (HTTP, /proc)    │  │
//! │  └──────────────┘   └──────────────────┘   └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`PeerRegistry`]: The authoritative set of peers and their capabilities
//! - [`HealthMonitor`]: Periodically re-probes peers and the local node
//! - [`Router`]: Classifies tasks and selects an endpoint
//! - [`FleetConfig`]: Layered configuration (file, environment, CLI)
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use fleet_core::{
//!     load_config, FailurePolicy, HealthMonitor, HttpProber, PeerRegistry,
//!     PreferencePolicy, Router,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let prober = Arc::new(HttpProber::new(config.local.clone()));
//!     let registry = Arc::new(PeerRegistry::new(prober));
//!
//!     let monitor = Arc::new(HealthMonitor::new(registry.clone(), config.monitor_config()));
//!     let handle = monitor.spawn();
//!
//!     let router = Router::new(
//!         registry,
//!         PreferencePolicy::from_config(&config.policy),
//!         config.failure_policy(),
//!     )
//!     .with_monitor(monitor);
//!     router.start().await;
//!
//!     let result = router.for_task("write python code to sort a list")?;
//!     println!("{} via {}", result.model_id, result.endpoint_url);
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod routing;

// Re-export main types at crate root
pub use config::{
    default_config_path, default_peers_path, load_config, load_config_from_path, ConfigError,
    ConfigOverrides, ConfigSource, FleetConfig, FleetToml,
};
pub use discovery::{
    Capability, CapabilityProber, CycleReport, HealthMonitor, HealthMonitorHandle, HttpProber,
    LocalEndpoint, MonitorConfig, Peer, PeerAddr, PeerId, PeerRegistry, ProbeEvent, ProbeFailure,
    DEFAULT_MODEL_PORT, LOCAL_PEER_ID,
};
pub use error::{ErrorClass, ProbeError, RegistryError, RouterError};
pub use routing::{
    AttemptContext, EndpointSelector, FailurePolicy, FleetStatus, LearnedPreference,
    LocalFallback, PeerStatus, PolicyConfig, PreferencePolicy, Router, RouterMode, RouterStats,
    RoutingRequest, RoutingResult, StatsSnapshot, FALLBACK_PEER_ID,
};
