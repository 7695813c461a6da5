#![allow(missing_docs)]
//! Distributed Model Routing
//!
//! Picks, for each task, the peer and model that should serve it.
//!
//! # Pipeline
//!
//! ```text
//! RoutingRequest
//!   -> PreferencePolicy   category, then ordered models
//!   -> EndpointSelector   first tier with an admissible peer
//!   -> FailurePolicy      strict error, or the local fallback
//!   -> RoutingResult
//! ```
//!
//! An earlier preference always beats a later one, and the local node wins
//! ties within a tier. A resilient router always yields an endpoint.

pub mod fallback;
pub mod metrics;
pub mod policy;
pub mod router;

pub use fallback::*;
pub use metrics::{RouterStats, StatsSnapshot};
pub use policy::*;
pub use router::*;
