//! Capability Probing
//!
//! [`CapabilityProber`] is the seam between discovery and the network. The
//! production implementation, [`HttpProber`], talks to a node's model-serving
//! endpoint:
//!
//! 1. `GET /api/capabilities` for the full resource document
//! 2. on HTTP 404, `GET /api/tags` for the model list alone
//!
//! The whole sequence is bounded by one deadline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::capability::{Capability, CapabilityPayload, TagsPayload};
use super::local::HostResources;
use super::peer::PeerAddr;
use super::DEFAULT_MODEL_PORT;
use crate::error::ProbeError;

// ============================================================================
// Prober Trait
// ============================================================================

/// Collects capability snapshots from nodes
#[async_trait]
pub trait CapabilityProber: Send + Sync {
    /// Snapshot of this host; never fails, missing pieces read as zero/empty
    async fn probe_local(&self) -> Capability;

    /// Snapshot of a remote node, bounded by `timeout`
    async fn probe_remote(
        &self,
        addr: &PeerAddr,
        timeout: Duration,
    ) -> Result<Capability, ProbeError>;
}

// ============================================================================
// HTTP Prober
// ============================================================================

/// Local model-serving endpoint queried by [`HttpProber::probe_local`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalEndpoint {
    /// Host of the local endpoint
    pub host: String,
    /// Port of the local endpoint
    pub port: u16,
    /// Deadline for the local model list query
    pub timeout: Duration,
}

impl Default for LocalEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_MODEL_PORT,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Probes nodes over HTTP
#[derive(Clone, Debug)]
pub struct HttpProber {
    /// Shared connection pool
    client: reqwest::Client,
    /// Where the local model list lives
    local: LocalEndpoint,
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new(LocalEndpoint::default())
    }
}

impl HttpProber {
    /// Create a prober for the given local endpoint
    #[must_use]
    pub fn new(local: LocalEndpoint) -> Self {
        Self {
            client: reqwest::Client::new(),
            local,
        }
    }

    /// Use a preconfigured client
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Local endpoint this prober reports on
    #[must_use]
    pub fn local_endpoint(&self) -> &LocalEndpoint {
        &self.local
    }

    async fn probe_unbounded(&self, addr: &PeerAddr) -> Result<Capability, ProbeError> {
        let response = self
            .client
            .get(addr.capabilities_url())
            .send()
            .await
            .map_err(|e| classify_reqwest(addr, &e))?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(peer = %addr, "No capability endpoint, falling back to model list");
            return self.fetch_tags(addr).await;
        }

        let payload: CapabilityPayload = read_json(addr, response).await?;
        payload
            .into_capability(Utc::now())
            .map_err(|message| ProbeError::Validation {
                addr: addr.to_string(),
                message,
            })
    }

    async fn fetch_tags(&self, addr: &PeerAddr) -> Result<Capability, ProbeError> {
        let response = self
            .client
            .get(addr.tags_url())
            .send()
            .await
            .map_err(|e| classify_reqwest(addr, &e))?;

        let payload: TagsPayload = read_json(addr, response).await?;
        payload
            .into_capability(Utc::now())
            .map_err(|message| ProbeError::Validation {
                addr: addr.to_string(),
                message,
            })
    }
}

#[async_trait]
impl CapabilityProber for HttpProber {
    async fn probe_local(&self) -> Capability {
        let host = HostResources::collect().await;
        let addr = PeerAddr::new(self.local.host.clone(), self.local.port);

        let models = match tokio::time::timeout(self.local.timeout, self.fetch_tags(&addr)).await {
            Ok(Ok(cap)) => Some(cap.models),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Local model list unavailable");
                None
            }
            Err(_) => {
                tracing::debug!(endpoint = %addr, "Local model list query timed out");
                None
            }
        };

        Capability {
            cpu_cores: host.cpu_cores,
            memory_gb: host.memory_gb,
            gpu_memory_gb: host.gpu_memory_gb,
            available: models.is_some(),
            models: models.unwrap_or_default(),
            load_avg: host.load_avg,
            last_seen: Utc::now(),
        }
    }

    async fn probe_remote(
        &self,
        addr: &PeerAddr,
        timeout: Duration,
    ) -> Result<Capability, ProbeError> {
        match tokio::time::timeout(timeout, self.probe_unbounded(addr)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout {
                addr: addr.to_string(),
                timeout,
            }),
        }
    }
}

/// Check the status and decode a JSON body
async fn read_json<T: DeserializeOwned>(
    addr: &PeerAddr,
    response: reqwest::Response,
) -> Result<T, ProbeError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Network {
            addr: addr.to_string(),
            message: format!("HTTP {status}"),
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| classify_reqwest(addr, &e))?;

    serde_json::from_slice(&body).map_err(|e| ProbeError::Validation {
        addr: addr.to_string(),
        message: e.to_string(),
    })
}

fn classify_reqwest(addr: &PeerAddr, error: &reqwest::Error) -> ProbeError {
    let addr = addr.to_string();
    let message = error.to_string();

    // Deadlines are enforced by probe_remote, so the client never times out itself
    if error.is_decode() {
        ProbeError::Validation { addr, message }
    } else if error.is_builder() {
        ProbeError::System { addr, message }
    } else {
        ProbeError::Network { addr, message }
    }
}
