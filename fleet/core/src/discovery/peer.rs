//! Peers and Peer Addresses

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::capability::Capability;
use super::{PeerId, DEFAULT_MODEL_PORT, LOCAL_PEER_ID};
use crate::error::RegistryError;

// ============================================================================
// Peer Address
// ============================================================================

/// Network location of a node's model-serving endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    /// IP address or hostname, case preserved
    pub ip: String,

    /// TCP port
    pub port: u16,
}

impl PeerAddr {
    /// Create a new address
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Reject addresses that cannot form a URL authority
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidAddress`] for an empty host, a host
    /// containing whitespace or path characters, or port 0.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let reason = if self.ip.is_empty() {
            Some("host is empty")
        } else if self.ip.chars().any(|c| c.is_whitespace() || c == '/') {
            Some("host contains whitespace or '/'")
        } else if self.port == 0 {
            Some("port must be non-zero")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(RegistryError::InvalidAddress {
                ip: self.ip.clone(),
                port: self.port,
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// `http://{ip}:{port}`, bracketing IPv6 literals
    #[must_use]
    pub fn base_url(&self) -> String {
        if self.ip.contains(':') && !self.ip.starts_with('[') {
            format!("http://[{}]:{}", self.ip, self.port)
        } else {
            format!("http://{}:{}", self.ip, self.port)
        }
    }

    /// URL of the rich capability document
    #[must_use]
    pub fn capabilities_url(&self) -> String {
        format!("{}/api/capabilities", self.base_url())
    }

    /// URL of the Ollama-style model list
    #[must_use]
    pub fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = RegistryError;

    /// Parse `host`, `host:port` or `[v6]:port`; the port defaults to 11434
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: &str| RegistryError::InvalidAddress {
            ip: s.to_string(),
            port: 0,
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid("unexpected characters after IPv6 literal")),
            }
        } else if s.matches(':').count() == 1 {
            let (host, port) = s.split_once(':').ok_or_else(|| invalid("malformed address"))?;
            (host, Some(port))
        } else {
            (s, None)
        };

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("port is not a number"))?,
            None => DEFAULT_MODEL_PORT,
        };

        let addr = Self::new(host, port);
        addr.validate()?;
        Ok(addr)
    }
}

// ============================================================================
// Peer
// ============================================================================

/// A registered node: identity, address and latest capability snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique id within the registry
    pub id: PeerId,

    /// Where the node is reached
    pub addr: PeerAddr,

    /// Latest snapshot
    pub capability: Capability,
}

impl Peer {
    /// Create a peer, deriving the id from `name` or falling back to the IP
    pub fn new(addr: PeerAddr, name: Option<&str>, capability: Capability) -> Self {
        let id = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => addr.ip.clone(),
        };
        Self {
            id,
            addr,
            capability,
        }
    }

    /// Whether this is the reserved local entry
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.id == LOCAL_PEER_ID
    }

    /// Whether the last probe succeeded
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.capability.available
    }

    /// Whether the peer is available and serves `model`
    #[must_use]
    pub fn serves(&self, model: &str) -> bool {
        self.is_available() && self.capability.serves(model)
    }

    /// Base URL of the peer's model-serving endpoint
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        self.addr.base_url()
    }
}
