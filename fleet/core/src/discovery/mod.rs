//! Peer Discovery
//!
//! Tracks the inference fleet: which nodes exist, what they can serve and how
//! loaded they are.
//!
//! # Components
//!
//! - [`CapabilityProber`]: collects a single node's resource snapshot
//! - [`PeerRegistry`]: the fleet's peers and their latest snapshots
//! - [`HealthMonitor`]: background task that re-probes every peer
//!
//! # Data Flow
//!
//! ```text
//! HealthMonitor --probe--> CapabilityProber
//!       |
//!       +--update / mark_unavailable--> PeerRegistry --get_snapshot--> Router
//! ```
//!
//! The registry is the only shared state. It is constructed once by the
//! application and handed to both the monitor and the router as an `Arc`.

pub mod capability;
pub mod health;
pub mod local;
pub mod peer;
pub mod prober;
pub mod registry;

#[cfg(test)]
pub mod test_utils;

pub use capability::{Capability, CapabilityPayload, TagsPayload};
pub use health::{
    CycleReport, HealthMonitor, HealthMonitorHandle, MonitorConfig, ProbeEvent, ProbeFailure,
};
pub use local::HostResources;
pub use peer::{Peer, PeerAddr};
pub use prober::{CapabilityProber, HttpProber, LocalEndpoint};
pub use registry::{LoadReport, PeerRecord, PeerRegistry};

/// Identifier of a peer within the registry
///
/// The explicit peer name when one was given, otherwise the IP.
pub type PeerId = String;

/// Reserved id of the local node's registry entry
pub const LOCAL_PEER_ID: &str = "local";

/// Default port of the model-serving endpoint on every node
pub const DEFAULT_MODEL_PORT: u16 = 11434;
