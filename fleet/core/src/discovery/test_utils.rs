//! Test utilities for discovery
//!
//! A scripted in-memory prober that stands in for the network.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::capability::Capability;
use super::peer::PeerAddr;
use super::prober::CapabilityProber;
use crate::error::{ErrorClass, ProbeError};

/// Scripted outcome for one address
#[derive(Clone, Debug)]
pub enum ProbeScript {
    /// Answer with this snapshot (stamped as available, now)
    Answer(Capability),
    /// Fail with an error of this class
    Fail(ErrorClass),
    /// Never answer; the probe runs into its deadline
    Hang,
}

/// Prober whose answers are set per address by the test
#[derive(Default)]
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, ProbeScript>>,
    local: Mutex<Capability>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProber {
    /// Empty script: every address is unreachable
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome for `addr` (`"ip:port"`)
    pub fn set(&self, addr: &str, script: ProbeScript) {
        self.scripts.lock().insert(addr.to_string(), script);
    }

    /// Answer `addr` with an available snapshot serving `models`
    pub fn answer(&self, addr: &str, models: &[&str], load_avg: f64) {
        self.set(
            addr,
            ProbeScript::Answer(Capability::with_models(models.iter().copied(), load_avg)),
        );
    }

    /// Snapshot returned by `probe_local`
    pub fn set_local(&self, capability: Capability) {
        *self.local.lock() = capability;
    }

    /// Number of remote probes issued against `addr`
    #[must_use]
    pub fn calls_to(&self, addr: &str) -> usize {
        self.calls.lock().iter().filter(|a| *a == addr).count()
    }

    /// Total number of remote probes issued
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl CapabilityProber for ScriptedProber {
    async fn probe_local(&self) -> Capability {
        self.local.lock().clone()
    }

    async fn probe_remote(
        &self,
        addr: &PeerAddr,
        timeout: Duration,
    ) -> Result<Capability, ProbeError> {
        let key = addr.to_string();
        self.calls.lock().push(key.clone());
        let script = self.scripts.lock().get(&key).cloned();

        match script {
            Some(ProbeScript::Answer(mut cap)) => {
                cap.available = true;
                cap.last_seen = chrono::Utc::now();
                Ok(cap)
            }
            Some(ProbeScript::Fail(class)) => Err(error_of_class(key, class, timeout)),
            Some(ProbeScript::Hang) => {
                tokio::time::sleep(timeout).await;
                Err(ProbeError::Timeout { addr: key, timeout })
            }
            None => Err(ProbeError::Network {
                addr: key,
                message: "connection refused".to_string(),
            }),
        }
    }
}

fn error_of_class(addr: String, class: ErrorClass, timeout: Duration) -> ProbeError {
    match class {
        ErrorClass::Timeout => ProbeError::Timeout { addr, timeout },
        ErrorClass::Validation => ProbeError::Validation {
            addr,
            message: "scripted invalid payload".to_string(),
        },
        ErrorClass::Network => ProbeError::Network {
            addr,
            message: "scripted connection reset".to_string(),
        },
        _ => ProbeError::System {
            addr,
            message: "scripted failure".to_string(),
        },
    }
}
