//! Failure Policy and Local Fallback
//!
//! One router type serves both strict and resilient callers; the
//! [`FailurePolicy`] decides what a selection error turns into.
//!
//! - **Strict**: errors are returned to the caller
//! - **Resilient**: every error becomes the configured [`LocalFallback`]
//!
//! [`AttemptContext`] supports the caller-side retry loop: each failed peer
//! is added to the exclusion set of the next selection.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::policy::{RoutingRequest, RoutingResult};
use crate::config::ConfigError;
use crate::discovery::PeerId;
use crate::error::RouterError;

/// Peer id reported for the local fallback endpoint
pub const FALLBACK_PEER_ID: &str = "local-fallback";

// ============================================================================
// Local Fallback
// ============================================================================

/// Endpoint used when the fleet cannot serve a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFallback {
    /// Base URL of the fallback endpoint
    pub url: String,

    /// Model requested from it
    pub model: String,
}

impl Default for LocalFallback {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.1:8b".to_string(),
        }
    }
}

impl LocalFallback {
    /// Create a fallback
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
        }
    }

    /// The routing result this fallback stands for
    #[must_use]
    pub fn result(&self) -> RoutingResult {
        RoutingResult {
            endpoint_url: self.url.clone(),
            peer_id: FALLBACK_PEER_ID.to_string(),
            model_id: self.model.clone(),
            is_fallback: true,
        }
    }
}

// ============================================================================
// Failure Policy
// ============================================================================

/// Configured router mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterMode {
    /// Surface selection errors
    Strict,
    /// Fall back to the local endpoint
    #[default]
    Resilient,
}

impl fmt::Display for RouterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Resilient => write!(f, "resilient"),
        }
    }
}

impl FromStr for RouterMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "resilient" => Ok(Self::Resilient),
            other => Err(ConfigError::ValidationError(format!(
                "unknown router mode '{other}' (expected 'strict' or 'resilient')"
            ))),
        }
    }
}

/// What a selection error turns into
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Return the error
    Strict,
    /// Return the local fallback instead
    Resilient(LocalFallback),
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Resilient(LocalFallback::default())
    }
}

impl FailurePolicy {
    /// Policy for a configured mode
    #[must_use]
    pub fn from_mode(mode: RouterMode, fallback: LocalFallback) -> Self {
        match mode {
            RouterMode::Strict => Self::Strict,
            RouterMode::Resilient => Self::Resilient(fallback),
        }
    }

    /// Mode this policy implements
    #[must_use]
    pub fn mode(&self) -> RouterMode {
        match self {
            Self::Strict => RouterMode::Strict,
            Self::Resilient(_) => RouterMode::Resilient,
        }
    }

    /// Whether errors are converted into the fallback
    #[must_use]
    pub fn is_resilient(&self) -> bool {
        matches!(self, Self::Resilient(_))
    }

    /// Apply the policy to a failed selection
    ///
    /// # Errors
    ///
    /// Returns `error` unchanged under [`FailurePolicy::Strict`].
    pub fn recover(&self, error: RouterError) -> Result<RoutingResult, RouterError> {
        match self {
            Self::Strict => Err(error),
            Self::Resilient(fallback) => {
                tracing::warn!(
                    error = %error,
                    class = %error.class(),
                    fallback = %fallback.url,
                    model = %fallback.model,
                    "Selection failed, using local fallback"
                );
                Ok(fallback.result())
            }
        }
    }
}

// ============================================================================
// Attempt Context
// ============================================================================

/// Tracks a caller's retry loop across downstream failures
///
/// ```ignore
/// let mut attempts = AttemptContext::new(RoutingRequest::new(prompt), 3);
/// while let Some(request) = attempts.next_request() {
///     let result = router.route(&request)?;
///     match generate(&result).await {
///         Ok(output) => return Ok(output),
///         Err(_) => attempts.record_failure(&result),
///     }
/// }
/// ```
#[derive(Clone, Debug)]
pub struct AttemptContext {
    /// Request the loop started from
    base: RoutingRequest,

    /// Peers that failed downstream, in order
    failed_peers: Vec<PeerId>,

    /// Attempts handed out so far
    attempts: usize,

    /// Maximum attempts
    max_attempts: usize,

    /// Whether the last result was the local fallback
    reached_fallback: bool,
}

impl AttemptContext {
    /// Create a context allowing `max_attempts` selections
    #[must_use]
    pub fn new(base: RoutingRequest, max_attempts: usize) -> Self {
        Self {
            base,
            failed_peers: Vec::new(),
            attempts: 0,
            max_attempts,
            reached_fallback: false,
        }
    }

    /// The next request to route, or `None` once attempts are used up
    ///
    /// After the fallback has failed there is nothing left to try.
    pub fn next_request(&mut self) -> Option<RoutingRequest> {
        if self.attempts >= self.max_attempts || self.reached_fallback {
            return None;
        }
        self.attempts += 1;
        Some(
            self.base
                .clone()
                .with_excluded(self.failed_peers.iter().cloned()),
        )
    }

    /// Record that `result` failed downstream
    pub fn record_failure(&mut self, result: &RoutingResult) {
        if result.is_fallback {
            self.reached_fallback = true;
            return;
        }
        if !self.failed_peers.contains(&result.peer_id) {
            tracing::debug!(peer = %result.peer_id, model = %result.model_id, "Excluding failed peer");
            self.failed_peers.push(result.peer_id.clone());
        }
    }

    /// Peers excluded so far
    #[must_use]
    pub fn excluded(&self) -> BTreeSet<PeerId> {
        self.failed_peers.iter().cloned().collect()
    }

    /// Check if a peer has already failed
    #[must_use]
    pub fn has_failed(&self, peer_id: &str) -> bool {
        self.failed_peers.iter().any(|p| p == peer_id)
    }

    /// Selections handed out so far
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
