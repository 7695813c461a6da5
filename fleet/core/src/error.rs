//! Error Taxonomy
//!
//! Typed errors for probing, the peer registry and endpoint selection.
//!
//! Probe-level errors ([`ProbeError`]) never reach a router caller: the health
//! monitor absorbs them, flips the peer to unavailable and records an
//! [`ErrorClass`] in its rolling error window. [`RouterError::NoAvailableEndpoint`]
//! is the only error a strict router surfaces during normal operation.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::discovery::PeerId;

// ============================================================================
// Error Classification
// ============================================================================

/// Coarse classification used for logging and the rolling error window
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection refused, reset or otherwise unreachable
    Network,
    /// Probe exceeded its deadline
    Timeout,
    /// Malformed capability payload
    Validation,
    /// Unparseable configuration or persisted peer file
    Config,
    /// Selection exhausted every preference tier
    NoAvailableEndpoint,
    /// Unexpected or uncategorized failure
    System,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::Validation => write!(f, "validation"),
            Self::Config => write!(f, "config"),
            Self::NoAvailableEndpoint => write!(f, "no_available_endpoint"),
            Self::System => write!(f, "system"),
        }
    }
}

// ============================================================================
// Probe Errors
// ============================================================================

/// Failure while probing a peer's capabilities
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ProbeError {
    /// Connection refused/reset or a non-success HTTP status
    #[error("network error probing {addr}: {message}")]
    Network {
        /// Probed address
        addr: String,
        /// Underlying failure
        message: String,
    },

    /// The probe did not complete within its deadline
    #[error("probe of {addr} timed out after {timeout:?}")]
    Timeout {
        /// Probed address
        addr: String,
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// The peer answered with a payload that failed validation
    #[error("invalid capability payload from {addr}: {message}")]
    Validation {
        /// Probed address
        addr: String,
        /// What was wrong with the payload
        message: String,
    },

    /// Anything else (client construction, task panics)
    #[error("unexpected error probing {addr}: {message}")]
    System {
        /// Probed address
        addr: String,
        /// Underlying failure
        message: String,
    },
}

impl ProbeError {
    /// Classification of this error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. } => ErrorClass::Network,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Validation { .. } => ErrorClass::Validation,
            Self::System { .. } => ErrorClass::System,
        }
    }

    /// Address the failing probe targeted
    #[must_use]
    pub fn addr(&self) -> &str {
        match self {
            Self::Network { addr, .. }
            | Self::Timeout { addr, .. }
            | Self::Validation { addr, .. }
            | Self::System { addr, .. } => addr,
        }
    }
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors from peer registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another peer already uses this IP
    #[error("address {ip} is already registered as peer {existing}")]
    DuplicateIp {
        /// Rejected IP
        ip: String,
        /// Peer currently holding the IP
        existing: PeerId,
    },

    /// Another peer already uses this id
    #[error("peer id {0} is already registered")]
    DuplicatePeerId(PeerId),

    /// The id is reserved for the local node
    #[error("peer id {0} is reserved")]
    ReservedPeerId(PeerId),

    /// The address cannot be used to reach a peer
    #[error("invalid peer address {ip}:{port}: {reason}")]
    InvalidAddress {
        /// Rejected host or IP
        ip: String,
        /// Rejected port
        port: u16,
        /// Why the address was rejected
        reason: String,
    },

    /// No peer with this id
    #[error("peer {0} not found")]
    NotFound(PeerId),

    /// Persisted peer file could not be parsed
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Persisted peer file could not be read or written
    #[error("peer file I/O error at {path}: {source}")]
    Io {
        /// Target path
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },
}

impl RegistryError {
    /// Classification of this error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) => ErrorClass::Config,
            Self::Io { .. } => ErrorClass::System,
            Self::InvalidAddress { .. }
            | Self::DuplicateIp { .. }
            | Self::DuplicatePeerId(_)
            | Self::ReservedPeerId(_)
            | Self::NotFound(_) => ErrorClass::Validation,
        }
    }
}

// ============================================================================
// Router Errors
// ============================================================================

/// Errors surfaced by endpoint selection
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RouterError {
    /// Every preference tier was empty
    #[error("no available endpoint for category '{category}' (tried: {})", .tried.join(", "))]
    NoAvailableEndpoint {
        /// Category the request resolved to
        category: String,
        /// Models that were tried, in preference order
        tried: Vec<String>,
    },

    /// Selection could not run at all (e.g. the policy has no models for a category)
    #[error("routing system error: {0}")]
    System(String),
}

impl RouterError {
    /// Classification of this error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoAvailableEndpoint { .. } => ErrorClass::NoAvailableEndpoint,
            Self::System(_) => ErrorClass::System,
        }
    }

    /// Whether this is the typed exhaustion signal
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::NoAvailableEndpoint { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_error_classes() {
        let err = ProbeError::Timeout {
            addr: "10.0.0.1:11434".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.class(), ErrorClass::Timeout);
        assert_eq!(err.addr(), "10.0.0.1:11434");

        let err = ProbeError::Validation {
            addr: "nodeA:11434".to_string(),
            message: "load_avg out of range".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.to_string().contains("load_avg out of range"));
    }

    #[test]
    fn test_router_error_display() {
        let err = RouterError::NoAvailableEndpoint {
            category: "coding".to_string(),
            tried: vec!["codellama:13b".to_string(), "llama3.1:8b".to_string()],
        };
        assert!(err.is_exhausted());
        assert_eq!(
            err.to_string(),
            "no available endpoint for category 'coding' (tried: codellama:13b, llama3.1:8b)"
        );
        assert!(!RouterError::System("boom".to_string()).is_exhausted());
    }

    #[test]
    fn test_error_class_display() {
        assert_eq!(ErrorClass::NoAvailableEndpoint.to_string(), "no_available_endpoint");
        assert_eq!(ErrorClass::Network.to_string(), "network");
    }
}
