//! Capability Snapshots
//!
//! A [`Capability`] is what a probe learns about one node: its hardware, the
//! models it serves and how busy it is. Wire payloads are deserialized into
//! typed structs ([`CapabilityPayload`], [`TagsPayload`]) and validated before
//! they become a snapshot.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound of the normalised load scale
pub const MAX_LOAD_AVG: f64 = 100.0;

// ============================================================================
// Capability
// ============================================================================

/// Resource and model snapshot of a single node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capability {
    /// Logical CPU cores
    pub cpu_cores: u32,

    /// Total system memory in GiB
    pub memory_gb: f64,

    /// Total GPU memory in GiB (0 when no GPU was detected)
    pub gpu_memory_gb: f64,

    /// Model identifiers the node serves
    pub models: BTreeSet<String>,

    /// Instantaneous load on a 0-100 scale
    pub load_avg: f64,

    /// Whether the last probe of this node succeeded
    pub available: bool,

    /// Time of the last successful probe
    pub last_seen: DateTime<Utc>,
}

impl Capability {
    /// Available snapshot serving `models` at the given load
    pub fn with_models<I, S>(models: I, load_avg: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            load_avg,
            available: true,
            last_seen: Utc::now(),
            ..Self::default()
        }
    }

    /// Snapshot for a node that has never answered a probe
    #[must_use]
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Whether this node serves `model`
    #[must_use]
    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    /// Check the snapshot's numeric ranges and model ids
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if !self.load_avg.is_finite() || !(0.0..=MAX_LOAD_AVG).contains(&self.load_avg) {
            return Err(format!(
                "load_avg {} outside 0-{MAX_LOAD_AVG}",
                self.load_avg
            ));
        }
        for (field, value) in [
            ("memory_gb", self.memory_gb),
            ("gpu_memory_gb", self.gpu_memory_gb),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{field} must be a non-negative number, got {value}"));
            }
        }
        if self.models.iter().any(|m| m.trim().is_empty()) {
            return Err("model identifiers must be non-empty".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Wire Payloads
// ============================================================================

/// Body of `GET /api/capabilities`
///
/// Every field is optional on the wire; absent fields read as zero/empty.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CapabilityPayload {
    /// Logical CPU cores
    pub cpu_cores: u32,
    /// Total memory in GiB
    pub memory_gb: f64,
    /// Total GPU memory in GiB
    pub gpu_memory_gb: f64,
    /// Served model identifiers
    pub models: Vec<String>,
    /// Load on a 0-100 scale
    pub load_avg: f64,
}

impl CapabilityPayload {
    /// Validate the payload and stamp it as an available snapshot
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn into_capability(self, now: DateTime<Utc>) -> Result<Capability, String> {
        let capability = Capability {
            cpu_cores: self.cpu_cores,
            memory_gb: self.memory_gb,
            gpu_memory_gb: self.gpu_memory_gb,
            models: self.models.into_iter().collect(),
            load_avg: self.load_avg,
            available: true,
            last_seen: now,
        };
        capability.validate()?;
        Ok(capability)
    }
}

/// Single entry of an Ollama-style model list
#[derive(Clone, Debug, Deserialize)]
pub struct TagEntry {
    /// Model identifier, e.g. `llama3.1:8b`
    pub name: String,
}

/// Body of `GET /api/tags`
#[derive(Clone, Debug, Deserialize)]
pub struct TagsPayload {
    /// Installed models
    pub models: Vec<TagEntry>,
}

impl TagsPayload {
    /// Model identifiers, rejecting blank names
    ///
    /// # Errors
    ///
    /// Returns an error when any entry has an empty name.
    pub fn model_ids(self) -> Result<BTreeSet<String>, String> {
        let mut ids = BTreeSet::new();
        for entry in self.models {
            if entry.name.trim().is_empty() {
                return Err("model list contains an empty name".to_string());
            }
            ids.insert(entry.name);
        }
        Ok(ids)
    }

    /// Snapshot with only the model list populated
    ///
    /// # Errors
    ///
    /// Returns an error when any entry has an empty name.
    pub fn into_capability(self, now: DateTime<Utc>) -> Result<Capability, String> {
        Ok(Capability {
            models: self.model_ids()?,
            available: true,
            last_seen: now,
            ..Capability::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_capability_payload_defaults_missing_fields() {
        let payload: CapabilityPayload =
            serde_json::from_str(r#"{"models": ["llama3.1:8b"], "load_avg": 12.5}"#).unwrap();
        let cap = payload.into_capability(Utc::now()).unwrap();

        assert_eq!(cap.cpu_cores, 0);
        assert_eq!(cap.memory_gb, 0.0);
        assert!(cap.available);
        assert!(cap.serves("llama3.1:8b"));
        assert!(!cap.serves("mistral:7b"));
    }

    #[test]
    fn test_capability_rejects_out_of_range_load() {
        let payload = CapabilityPayload {
            load_avg: 250.0,
            ..CapabilityPayload::default()
        };
        let err = payload.into_capability(Utc::now()).unwrap_err();
        assert!(err.contains("load_avg"));

        let payload = CapabilityPayload {
            load_avg: -1.0,
            ..CapabilityPayload::default()
        };
        assert!(payload.into_capability(Utc::now()).is_err());
    }

    #[test]
    fn test_capability_rejects_negative_memory_and_blank_models() {
        let payload = CapabilityPayload {
            memory_gb: -4.0,
            ..CapabilityPayload::default()
        };
        assert!(payload.into_capability(Utc::now()).is_err());

        let payload = CapabilityPayload {
            models: vec!["  ".to_string()],
            ..CapabilityPayload::default()
        };
        assert!(payload.into_capability(Utc::now()).is_err());
    }

    #[test]
    fn test_tags_payload_leaves_resources_zero() {
        let payload: TagsPayload = serde_json::from_str(
            r#"{"models": [{"name": "mistral:7b", "size": 4100000000}, {"name": "llama3.2:3b"}]}"#,
        )
        .unwrap();
        let cap = payload.into_capability(Utc::now()).unwrap();

        let models: Vec<_> = cap.models.iter().cloned().collect();
        assert_eq!(models, vec!["llama3.2:3b", "mistral:7b"]);
        assert_eq!(cap.gpu_memory_gb, 0.0);
        assert_eq!(cap.load_avg, 0.0);
    }

    #[test]
    fn test_tags_payload_requires_model_list() {
        assert!(serde_json::from_str::<TagsPayload>(r#"{"tags": []}"#).is_err());
    }

    #[test]
    fn test_unavailable_snapshot() {
        let cap = Capability::unavailable();
        assert!(!cap.available);
        assert!(cap.models.is_empty());
    }
}
