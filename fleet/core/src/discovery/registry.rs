//! Peer Registry
//!
//! The fleet's known peers and their latest capability snapshots.
//!
//! # Concurrency
//!
//! One `parking_lot::RwLock` guards the peer map. No lock is ever held across
//! an `.await`: [`PeerRegistry::add_peer`] probes the candidate first and only
//! takes the write lock to admit it, re-checking for duplicates at that point.
//! Readers get owned copies via [`PeerRegistry::get_snapshot`].
//!
//! # Persistence
//!
//! The peer file is a JSON array of `{name, ip, port, capabilities}` records.
//! Loading is lenient per record; saving is atomic (temp file + rename) and
//! never writes the reserved local entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::capability::Capability;
use super::peer::{Peer, PeerAddr};
use super::prober::CapabilityProber;
use super::{PeerId, DEFAULT_MODEL_PORT, LOCAL_PEER_ID};
use crate::config::ConfigError;
use crate::error::RegistryError;

/// Default deadline for the admission probe in `add_peer`
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Persisted Records
// ============================================================================

/// One entry of the persisted peer file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Explicit peer name; absent when the id is the IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// IP or hostname
    pub ip: String,

    /// Model-serving port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Last known snapshot
    #[serde(default, alias = "capability")]
    pub capabilities: Option<Capability>,
}

fn default_port() -> u16 {
    DEFAULT_MODEL_PORT
}

impl From<&Peer> for PeerRecord {
    fn from(peer: &Peer) -> Self {
        Self {
            name: (peer.id != peer.addr.ip).then(|| peer.id.clone()),
            ip: peer.addr.ip.clone(),
            port: peer.addr.port,
            capabilities: Some(peer.capability.clone()),
        }
    }
}

impl PeerRecord {
    fn into_peer(self) -> Result<Peer, RegistryError> {
        let addr = PeerAddr::new(self.ip, self.port);
        addr.validate()?;
        let capability = self.capabilities.unwrap_or_else(Capability::unavailable);
        capability
            .validate()
            .map_err(|reason| RegistryError::InvalidAddress {
                ip: addr.ip.clone(),
                port: addr.port,
                reason: format!("invalid capabilities: {reason}"),
            })?;
        Ok(Peer::new(addr, self.name.as_deref(), capability))
    }
}

/// Outcome of [`PeerRegistry::load`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Records admitted into the registry
    pub loaded: usize,
    /// Records skipped as malformed or duplicate
    pub skipped: usize,
}

// ============================================================================
// Registry
// ============================================================================

/// Concurrency-safe map of `peer_id -> Peer`
pub struct PeerRegistry {
    /// All peers, including the reserved local entry once probed
    peers: RwLock<HashMap<PeerId, Peer>>,

    /// Prober used to admit new peers
    prober: Arc<dyn CapabilityProber>,

    /// Deadline for admission probes
    probe_timeout: Duration,
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.len())
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new(prober: Arc<dyn CapabilityProber>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            prober,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Set the admission probe deadline
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Prober shared with the health monitor
    #[must_use]
    pub fn prober(&self) -> &Arc<dyn CapabilityProber> {
        &self.prober
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    /// Probe and admit a new peer
    ///
    /// A peer whose probe fails is still admitted, marked unavailable, so the
    /// health monitor keeps retrying it.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidAddress`] for an unusable address
    /// - [`RegistryError::ReservedPeerId`] when the id would be `"local"`
    /// - [`RegistryError::DuplicateIp`] / [`RegistryError::DuplicatePeerId`]
    ///   when the peer is already known (checked before and after probing)
    pub async fn add_peer(
        &self,
        ip: &str,
        port: u16,
        name: Option<&str>,
    ) -> Result<PeerId, RegistryError> {
        let addr = PeerAddr::new(ip, port);
        addr.validate()?;
        let candidate = Peer::new(addr, name, Capability::unavailable());
        {
            let peers = self.peers.read();
            check_admissible(&peers, &candidate)?;
        }

        let capability = match self
            .prober
            .probe_remote(&candidate.addr, self.probe_timeout)
            .await
        {
            Ok(cap) => cap,
            Err(e) => {
                tracing::warn!(
                    peer = %candidate.id,
                    class = %e.class(),
                    error = %e,
                    "Admission probe failed; peer registered as unavailable"
                );
                Capability::unavailable()
            }
        };

        let peer = Peer {
            capability,
            ..candidate
        };
        self.admit(peer)
    }

    /// Insert an already-probed peer
    ///
    /// # Errors
    ///
    /// Same duplicate and reserved-id checks as [`Self::add_peer`].
    pub fn admit(&self, peer: Peer) -> Result<PeerId, RegistryError> {
        let mut peers = self.peers.write();
        check_admissible(&peers, &peer)?;

        let id = peer.id.clone();
        tracing::info!(
            peer = %id,
            addr = %peer.addr,
            available = peer.is_available(),
            models = peer.capability.models.len(),
            "Peer registered"
        );
        peers.insert(id.clone(), peer);
        Ok(id)
    }

    /// Upsert the reserved local entry
    ///
    /// An unavailable local snapshot only flips the flag on an existing entry,
    /// preserving its last known models.
    pub fn register_local(&self, addr: PeerAddr, capability: Capability) {
        let mut peers = self.peers.write();
        match peers.get_mut(LOCAL_PEER_ID) {
            Some(existing) if !capability.available => {
                existing.capability.available = false;
            }
            Some(existing) => {
                let last_seen = existing.capability.last_seen.max(capability.last_seen);
                existing.addr = addr;
                existing.capability = Capability {
                    last_seen,
                    ..capability
                };
            }
            None => {
                peers.insert(
                    LOCAL_PEER_ID.to_string(),
                    Peer {
                        id: LOCAL_PEER_ID.to_string(),
                        addr,
                        capability,
                    },
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Monitor Updates
    // ------------------------------------------------------------------------

    /// Replace a peer's capability after a successful probe
    ///
    /// The stored snapshot is marked available and its `last_seen` never moves
    /// backwards.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the peer was removed meanwhile.
    pub fn update(&self, peer_id: &str, capability: Capability) -> Result<(), RegistryError> {
        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| RegistryError::NotFound(peer_id.to_string()))?;

        let last_seen = peer
            .capability
            .last_seen
            .max(capability.last_seen)
            .max(Utc::now());
        peer.capability = Capability {
            available: true,
            last_seen,
            ..capability
        };
        Ok(())
    }

    /// Flip a peer to unavailable, keeping every other field
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the peer was removed meanwhile.
    pub fn mark_unavailable(&self, peer_id: &str) -> Result<(), RegistryError> {
        let mut peers = self.peers.write();
        let peer = peers
            .get_mut(peer_id)
            .ok_or_else(|| RegistryError::NotFound(peer_id.to_string()))?;
        peer.capability.available = false;
        Ok(())
    }

    /// Administrative removal
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn remove_peer(&self, peer_id: &str) -> Result<Peer, RegistryError> {
        let removed = self
            .peers
            .write()
            .remove(peer_id)
            .ok_or_else(|| RegistryError::NotFound(peer_id.to_string()))?;
        tracing::info!(peer = %peer_id, "Peer removed");
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Owned copy of every peer, ordered by id
    #[must_use]
    pub fn get_snapshot(&self) -> Vec<Peer> {
        let mut snapshot: Vec<Peer> = self.peers.read().values().cloned().collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    /// Copy of one peer
    #[must_use]
    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Number of registered peers, including the local entry
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peer is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Whether any peer uses this IP or hostname
    #[must_use]
    pub fn contains_ip(&self, ip: &str) -> bool {
        self.peers
            .read()
            .values()
            .any(|p| p.addr.ip.eq_ignore_ascii_case(ip))
    }

    /// Id of the peer using this IP or hostname
    #[must_use]
    pub fn peer_id_for_ip(&self, ip: &str) -> Option<PeerId> {
        find_by_ip(&self.peers.read(), ip).map(|p| p.id.clone())
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Load peers from a JSON file
    ///
    /// A missing file loads nothing. Malformed or duplicate records are logged
    /// and skipped. Loaded peers keep their persisted `available` flag until
    /// the next probe.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Io`] if the file exists but cannot be read
    /// - [`RegistryError::Config`] if the document is not a JSON array
    pub fn load(&self, path: &Path) -> Result<LoadReport, RegistryError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Peer file not found, starting empty");
                return Ok(LoadReport::default());
            }
            Err(source) => {
                return Err(RegistryError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let document: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| ConfigError::PeerFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let serde_json::Value::Array(entries) = document else {
            return Err(ConfigError::PeerFile {
                path: path.to_path_buf(),
                message: "expected a JSON array of peer records".to_string(),
            }
            .into());
        };

        let mut report = LoadReport::default();
        for (index, entry) in entries.into_iter().enumerate() {
            let peer = serde_json::from_value::<PeerRecord>(entry)
                .map_err(|e| RegistryError::from(ConfigError::PeerFile {
                    path: path.to_path_buf(),
                    message: format!("record {index}: {e}"),
                }))
                .and_then(PeerRecord::into_peer);

            let admitted = peer.and_then(|peer| {
                let mut peers = self.peers.write();
                check_admissible(&peers, &peer)?;
                peers.insert(peer.id.clone(), peer);
                Ok(())
            });

            match admitted {
                Ok(()) => report.loaded += 1,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        record = index,
                        error = %e,
                        "Skipping peer record"
                    );
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            path = %path.display(),
            loaded = report.loaded,
            skipped = report.skipped,
            "Loaded peer file"
        );
        Ok(report)
    }

    /// Atomically write every non-local peer to a JSON file
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the file or its parent directory
    /// cannot be written.
    pub fn save(&self, path: &Path) -> Result<usize, RegistryError> {
        let records: Vec<PeerRecord> = self
            .get_snapshot()
            .iter()
            .filter(|p| !p.is_local())
            .map(PeerRecord::from)
            .collect();

        let json = serde_json::to_string_pretty(&records).map_err(|e| RegistryError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        let io_err = |source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = temp_path(path);
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;

        tracing::debug!(path = %path.display(), peers = records.len(), "Saved peer file");
        Ok(records.len())
    }
}

fn find_by_ip<'a>(peers: &'a HashMap<PeerId, Peer>, ip: &str) -> Option<&'a Peer> {
    peers.values().find(|p| p.addr.ip.eq_ignore_ascii_case(ip))
}

fn check_admissible(peers: &HashMap<PeerId, Peer>, candidate: &Peer) -> Result<(), RegistryError> {
    if candidate.id == LOCAL_PEER_ID {
        return Err(RegistryError::ReservedPeerId(candidate.id.clone()));
    }
    if let Some(existing) = find_by_ip(peers, &candidate.addr.ip) {
        return Err(RegistryError::DuplicateIp {
            ip: candidate.addr.ip.clone(),
            existing: existing.id.clone(),
        });
    }
    if peers.contains_key(&candidate.id) {
        return Err(RegistryError::DuplicatePeerId(candidate.id.clone()));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
