//! Fleet Configuration
//!
//! Monitor timing, the local endpoint, the fallback, seeds, router mode and
//! policy tables, read from `$XDG_CONFIG_HOME/fleet-router/fleet.toml`.
//!
//! # Layering
//!
//! Later layers win:
//! 1. built-in defaults
//! 2. the TOML file
//! 3. `FLEET_*` / `OLLAMA_*` environment variables
//! 4. daemon flags, via [`ConfigOverrides`]
//!
//! The peer list lives next to the config file in `peers.json` unless
//! `discovery.peers_file` says otherwise.
//!
//! # Example
//!
//! ```toml
//! [monitor]
//! interval_secs = 30
//! probe_timeout_secs = 5
//! startup_wait_secs = 5
//! error_window_secs = 300
//! max_concurrent_probes = 16
//!
//! [local]
//! enabled = true
//! host = "127.0.0.1"
//! port = 11434
//!
//! [fallback]
//! url = "http://127.0.0.1:11434"
//! model = "llama3.1:8b"
//!
//! [discovery]
//! peers_file = "/var/lib/fleet-router/peers.json"
//! seeds = ["10.0.0.12:11434"]
//!
//! [router]
//! mode = "resilient"
//!
//! [policy]
//! default_category = "general"
//!
//! [policy.preferences]
//! coding = ["codellama:13b", "llama3.1:8b"]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::{LocalEndpoint, MonitorConfig, PeerAddr};
use crate::routing::{FailurePolicy, LocalFallback, PolicyConfig, RouterMode};

// =============================================================================
// Error Types
// =============================================================================

/// Configuration and peer file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file exists but could not be read
    #[error("Cannot read config file {path}: {source}")]
    ReadError {
        /// Config file path
        path: PathBuf,
        /// IO failure
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Malformed TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value is out of range or unusable
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Persisted peer file, or one of its records, is malformed
    #[error("Invalid peer file {path}: {message}")]
    PeerFile {
        /// The peer file
        path: PathBuf,
        /// What was wrong with it
        message: String,
    },
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Highest layer that contributed a value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Daemon flag
    Cli,
    /// Environment variable
    Env,
    /// TOML file
    File,
    /// Built-in default
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Sections
// =============================================================================

/// Monitor section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorToml {
    /// Seconds between health cycles
    pub interval_secs: Option<u64>,

    /// Per-probe deadline in seconds
    pub probe_timeout_secs: Option<u64>,

    /// Bound on the startup discovery cycle in seconds
    pub startup_wait_secs: Option<u64>,

    /// Rolling error window in seconds
    pub error_window_secs: Option<u64>,

    /// Maximum probes in flight
    pub max_concurrent_probes: Option<usize>,
}

/// Local node section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalToml {
    /// Whether the local node takes part in selection
    pub enabled: Option<bool>,

    /// Host of the local model-serving endpoint
    pub host: Option<String>,

    /// Port of the local model-serving endpoint
    pub port: Option<u16>,
}

/// Fallback section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackToml {
    /// Base URL of the fallback endpoint
    pub url: Option<String>,

    /// Model requested from the fallback
    pub model: Option<String>,
}

/// Discovery section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryToml {
    /// Persisted peer list
    pub peers_file: Option<PathBuf>,

    /// Candidate addresses (`host` or `host:port`)
    pub seeds: Option<Vec<String>>,
}

/// Router section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    /// `"strict"` or `"resilient"`
    pub mode: Option<RouterMode>,
}

/// Whole `fleet.toml` document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetToml {
    /// Monitor configuration section
    pub monitor: MonitorToml,

    /// Local node configuration section
    pub local: LocalToml,

    /// Fallback configuration section
    pub fallback: FallbackToml,

    /// Discovery configuration section
    pub discovery: DiscoveryToml,

    /// Router configuration section
    pub router: RouterToml,

    /// Policy tables layered over the built-ins
    pub policy: PolicyConfig,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Resolved configuration after every layer has been applied
///
/// Built by [`load_config`]; [`Self::source`] reports the highest layer that
/// changed anything.
#[derive(Clone, Debug)]
pub struct FleetConfig {
    /// Health monitor timing (addresses are filled in by [`Self::monitor_config`])
    pub monitor: MonitorConfig,

    /// Whether the local node is probed and selectable
    pub local_enabled: bool,

    /// Local model-serving endpoint
    pub local: LocalEndpoint,

    /// Local fallback for the resilient policy
    pub fallback: LocalFallback,

    /// Strict or resilient selection
    pub mode: RouterMode,

    /// Persisted peer list
    pub peers_file: Option<PathBuf>,

    /// Seed addresses probed every cycle until they answer
    pub seeds: Vec<PeerAddr>,

    /// Policy tables layered over the built-ins
    pub policy: PolicyConfig,

    /// Config file that was read, if one existed
    pub config_file_path: Option<PathBuf>,

    /// Highest contributing layer
    source: ConfigSource,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            local_enabled: true,
            local: LocalEndpoint::default(),
            fallback: LocalFallback::default(),
            mode: RouterMode::default(),
            peers_file: default_peers_path(),
            seeds: Vec::new(),
            policy: PolicyConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl FleetConfig {
    /// Built-in defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest contributing layer
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Override the recorded layer
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Monitor configuration with local, seed and persistence settings applied
    #[must_use]
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            local_addr: self
                .local_enabled
                .then(|| PeerAddr::new(self.local.host.clone(), self.local.port)),
            seeds: self.seeds.clone(),
            peers_file: self.peers_file.clone(),
            ..self.monitor.clone()
        }
    }

    /// Failure policy for the configured mode
    #[must_use]
    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::from_mode(self.mode, self.fallback.clone())
    }

    /// Check values a running system cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "monitor.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.monitor.probe_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "monitor.probe_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.monitor.max_concurrent_probes == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.max_concurrent_probes must be greater than 0".to_string(),
            ));
        }
        if self.local.port == 0 {
            return Err(ConfigError::ValidationError(
                "local.port must be non-zero".to_string(),
            ));
        }
        if !self.fallback.url.starts_with("http://") && !self.fallback.url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "fallback.url must be an http(s) URL, got '{}'",
                self.fallback.url
            )));
        }
        if self.fallback.model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "fallback.model must not be empty".to_string(),
            ));
        }
        for (category, models) in &self.policy.preferences {
            if models.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "policy.preferences.{category} must list at least one model"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Loading
// =============================================================================

/// `$XDG_CONFIG_HOME/fleet-router/fleet.toml`, if a config dir is known
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fleet-router").join("fleet.toml"))
}

/// `$XDG_CONFIG_HOME/fleet-router/peers.json`, if a config dir is known
#[must_use]
pub fn default_peers_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("fleet-router").join("peers.json"))
}

/// Load the default config file, then apply the environment
///
/// # Errors
///
/// Fails when the file exists but is unreadable or malformed; a missing file
/// just yields defaults.
pub fn load_config() -> Result<FleetConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load `path` (when given and present), then apply the environment
///
/// # Errors
///
/// Fails when the file is unreadable or malformed, or lists a bad seed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<FleetConfig, ConfigError> {
    let mut config = FleetConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: FleetToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Config file loaded"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "No config file, using defaults"
            );
        }
    }

    apply_env_config(&mut config);

    Ok(config)
}

fn parse_seeds(seeds: &[String]) -> Result<Vec<PeerAddr>, ConfigError> {
    seeds
        .iter()
        .map(|s| {
            s.parse::<PeerAddr>()
                .map_err(|e| ConfigError::ValidationError(format!("discovery.seeds: {e}")))
        })
        .collect()
}

/// Layer the file's values over `config`
fn apply_toml_config(config: &mut FleetConfig, toml: FleetToml) -> Result<(), ConfigError> {
    // Monitor settings
    if let Some(secs) = toml.monitor.interval_secs {
        config.monitor.interval = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.monitor.probe_timeout_secs {
        config.monitor.probe_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.monitor.startup_wait_secs {
        config.monitor.startup_wait = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.monitor.error_window_secs {
        config.monitor.error_window = Duration::from_secs(secs);
    }
    if let Some(max) = toml.monitor.max_concurrent_probes {
        config.monitor.max_concurrent_probes = max;
    }

    // Local node settings
    if let Some(enabled) = toml.local.enabled {
        config.local_enabled = enabled;
    }
    if let Some(host) = toml.local.host {
        config.local.host = host;
    }
    if let Some(port) = toml.local.port {
        config.local.port = port;
    }

    // Fallback settings
    if let Some(url) = toml.fallback.url {
        config.fallback.url = url;
    }
    if let Some(model) = toml.fallback.model {
        config.fallback.model = model;
    }

    // Discovery settings
    if let Some(path) = toml.discovery.peers_file {
        config.peers_file = Some(path);
    }
    if let Some(ref seeds) = toml.discovery.seeds {
        config.seeds = parse_seeds(seeds)?;
    }

    // Router settings
    if let Some(mode) = toml.router.mode {
        config.mode = mode;
    }

    config.policy = toml.policy;
    Ok(())
}

fn env_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Layer `FLEET_*` and `OLLAMA_*` variables over `config`
fn apply_env_config(config: &mut FleetConfig) {
    // Monitor settings from environment
    if let Ok(interval) = std::env::var("FLEET_MONITOR_INTERVAL") {
        if let Ok(secs) = interval.parse::<u64>() {
            config.monitor.interval = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(timeout) = std::env::var("FLEET_PROBE_TIMEOUT") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.monitor.probe_timeout = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(wait) = std::env::var("FLEET_STARTUP_WAIT") {
        if let Ok(secs) = wait.parse::<u64>() {
            config.monitor.startup_wait = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }

    // Discovery settings from environment
    if let Ok(path) = std::env::var("FLEET_PEERS_FILE") {
        config.peers_file = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }

    // Fallback settings from environment
    if let Ok(url) = std::env::var("FLEET_FALLBACK_URL") {
        config.fallback.url = url;
        config.source = ConfigSource::Env;
    }
    if let Ok(model) = std::env::var("FLEET_FALLBACK_MODEL") {
        config.fallback.model = model;
        config.source = ConfigSource::Env;
    }

    // Router settings from environment
    if let Ok(mode) = std::env::var("FLEET_ROUTER_MODE") {
        match mode.parse::<RouterMode>() {
            Ok(mode) => {
                config.mode = mode;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring FLEET_ROUTER_MODE"),
        }
    }

    // Local node settings from environment
    if let Ok(enabled) = std::env::var("FLEET_LOCAL_PROBE") {
        config.local_enabled = env_flag(&enabled);
        config.source = ConfigSource::Env;
    }
    if let Ok(host) = std::env::var("OLLAMA_HOST") {
        config.local.host = host;
        config.source = ConfigSource::Env;
    }
    if let Ok(port) = std::env::var("OLLAMA_PORT") {
        if let Ok(p) = port.parse::<u16>() {
            config.local.port = p;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// Daemon Overrides
// =============================================================================

/// Daemon flags layered over a loaded configuration
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Peer file override
    pub peers_file: Option<PathBuf>,

    /// Monitor interval override (seconds)
    pub interval_secs: Option<u64>,

    /// Probe timeout override (seconds)
    pub probe_timeout_secs: Option<u64>,

    /// Router mode override
    pub mode: Option<RouterMode>,

    /// Local probing override
    pub local_enabled: Option<bool>,

    /// Extra seed addresses
    pub seeds: Vec<PeerAddr>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set peer file override
    #[must_use]
    pub fn with_peers_file(mut self, path: PathBuf) -> Self {
        self.peers_file = Some(path);
        self
    }

    /// Set monitor interval override
    #[must_use]
    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = Some(secs);
        self
    }

    /// Set probe timeout override
    #[must_use]
    pub fn with_probe_timeout_secs(mut self, secs: u64) -> Self {
        self.probe_timeout_secs = Some(secs);
        self
    }

    /// Set router mode override
    #[must_use]
    pub fn with_mode(mut self, mode: RouterMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set local probing override
    #[must_use]
    pub fn with_local_enabled(mut self, enabled: bool) -> Self {
        self.local_enabled = Some(enabled);
        self
    }

    /// Add seed addresses
    #[must_use]
    pub fn with_seeds(mut self, seeds: Vec<PeerAddr>) -> Self {
        self.seeds.extend(seeds);
        self
    }

    /// Layer the set flags over `config`
    pub fn apply(&self, config: &mut FleetConfig) {
        if self.peers_file.is_some()
            || self.interval_secs.is_some()
            || self.probe_timeout_secs.is_some()
            || self.mode.is_some()
            || self.local_enabled.is_some()
            || !self.seeds.is_empty()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.peers_file {
            config.peers_file = Some(path.clone());
        }
        if let Some(secs) = self.interval_secs {
            config.monitor.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.probe_timeout_secs {
            config.monitor.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(enabled) = self.local_enabled {
            config.local_enabled = enabled;
        }
        for seed in &self.seeds {
            if !config.seeds.contains(seed) {
                config.seeds.push(seed.clone());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ENV_VARS: &[&str] = &[
        "FLEET_MONITOR_INTERVAL",
        "FLEET_PROBE_TIMEOUT",
        "FLEET_STARTUP_WAIT",
        "FLEET_PEERS_FILE",
        "FLEET_FALLBACK_URL",
        "FLEET_FALLBACK_MODEL",
        "FLEET_ROUTER_MODE",
        "FLEET_LOCAL_PROBE",
        "OLLAMA_HOST",
        "OLLAMA_PORT",
    ];

    /// Unset every variable the loader reads
    fn clear_config_env_vars() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();

        assert_eq!(config.monitor.interval, Duration::from_secs(30));
        assert_eq!(config.monitor.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.monitor.startup_wait, Duration::from_secs(5));
        assert!(config.local_enabled);
        assert_eq!(config.fallback.url, "http://127.0.0.1:11434");
        assert_eq!(config.mode, RouterMode::Resilient);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("fleet-router"));
            assert!(p.to_string_lossy().ends_with("fleet.toml"));
        }
    }

    #[test]
    fn test_monitor_config_carries_addresses() {
        let mut config = FleetConfig::default();
        config.seeds = vec![PeerAddr::new("10.0.0.12", 11434)];
        config.peers_file = Some(PathBuf::from("/tmp/peers.json"));

        let monitor = config.monitor_config();
        assert_eq!(monitor.local_addr, Some(PeerAddr::new("127.0.0.1", 11434)));
        assert_eq!(monitor.seeds.len(), 1);
        assert_eq!(monitor.peers_file, Some(PathBuf::from("/tmp/peers.json")));

        config.local_enabled = false;
        assert!(config.monitor_config().local_addr.is_none());
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    #[serial]
    fn test_parse_valid_toml() {
        clear_config_env_vars();
        let file = write_toml(
            r#"
[monitor]
interval_secs = 60
probe_timeout_secs = 2
startup_wait_secs = 10
error_window_secs = 600
max_concurrent_probes = 4

[local]
enabled = false
host = "gpu-box"
port = 11500

[fallback]
url = "http://10.0.0.1:11434"
model = "llama3.2:3b"

[discovery]
peers_file = "/var/lib/fleet-router/peers.json"
seeds = ["10.0.0.12:11434", "10.0.0.13"]

[router]
mode = "strict"

[policy]
default_category = "writing"

[policy.preferences]
coding = ["deepseek-coder:6.7b", "llama3.1:8b"]

[[policy.keywords]]
keyword = "sql"
category = "coding"
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.monitor.interval, Duration::from_secs(60));
        assert_eq!(config.monitor.probe_timeout, Duration::from_secs(2));
        assert_eq!(config.monitor.startup_wait, Duration::from_secs(10));
        assert_eq!(config.monitor.error_window, Duration::from_secs(600));
        assert_eq!(config.monitor.max_concurrent_probes, 4);
        assert!(!config.local_enabled);
        assert_eq!(config.local.host, "gpu-box");
        assert_eq!(config.local.port, 11500);
        assert_eq!(config.fallback.model, "llama3.2:3b");
        assert_eq!(
            config.peers_file,
            Some(PathBuf::from("/var/lib/fleet-router/peers.json"))
        );
        assert_eq!(
            config.seeds,
            vec![PeerAddr::new("10.0.0.12", 11434), PeerAddr::new("10.0.0.13", 11434)]
        );
        assert_eq!(config.mode, RouterMode::Strict);
        assert_eq!(config.failure_policy(), FailurePolicy::Strict);
        assert_eq!(config.policy.default_category.as_deref(), Some("writing"));
        assert_eq!(config.policy.keywords.len(), 1);
        assert_eq!(config.source(), ConfigSource::File);
    }

    #[test]
    #[serial]
    fn test_parse_partial_toml() {
        clear_config_env_vars();
        let file = write_toml(
            r#"
[monitor]
interval_secs = 15
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.monitor.interval, Duration::from_secs(15));
        assert_eq!(config.monitor.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.fallback.model, "llama3.1:8b");
        assert_eq!(config.mode, RouterMode::Resilient);
    }

    #[test]
    #[serial]
    fn test_missing_file_graceful() {
        clear_config_env_vars();

        let path = PathBuf::from("/nonexistent/path/fleet.toml");
        let config = load_config_from_path(Some(path)).unwrap();

        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_toml(
            r#"
[monitor
interval_secs = "not a number"
"#,
        );

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_unknown_router_mode_rejected() {
        let file = write_toml("[router]\nmode = \"lenient\"\n");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_bad_seed_rejected() {
        let file = write_toml("[discovery]\nseeds = [\"10.0.0.1:notaport\"]\n");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    // =========================================================================
    // Priority Ordering Tests
    // =========================================================================

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_config_env_vars();
        let file = write_toml(
            r#"
[monitor]
interval_secs = 60

[fallback]
model = "file-model"
"#,
        );

        std::env::set_var("FLEET_MONITOR_INTERVAL", "10");
        std::env::set_var("FLEET_FALLBACK_MODEL", "env-model");
        std::env::set_var("FLEET_LOCAL_PROBE", "false");
        std::env::set_var("OLLAMA_HOST", "ollama.lan");
        std::env::set_var("OLLAMA_PORT", "11500");
        std::env::set_var("FLEET_ROUTER_MODE", "strict");

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        clear_config_env_vars();

        assert_eq!(config.monitor.interval, Duration::from_secs(10));
        assert_eq!(config.fallback.model, "env-model");
        assert!(!config.local_enabled);
        assert_eq!(config.local.host, "ollama.lan");
        assert_eq!(config.local.port, 11500);
        assert_eq!(config.mode, RouterMode::Strict);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    #[serial]
    fn test_unparseable_env_values_ignored() {
        clear_config_env_vars();
        std::env::set_var("FLEET_PROBE_TIMEOUT", "soon");
        std::env::set_var("FLEET_ROUTER_MODE", "sometimes");

        let config = load_config_from_path(None).unwrap();
        clear_config_env_vars();

        assert_eq!(config.monitor.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.mode, RouterMode::Resilient);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = FleetConfig::default();
        config.mode = RouterMode::Resilient;
        config.set_source(ConfigSource::Env);

        let overrides = ConfigOverrides::new()
            .with_mode(RouterMode::Strict)
            .with_interval_secs(5)
            .with_seeds(vec![PeerAddr::new("10.0.0.20", 11434)]);
        overrides.apply(&mut config);

        assert_eq!(config.mode, RouterMode::Strict);
        assert_eq!(config.monitor.interval, Duration::from_secs(5));
        assert_eq!(config.seeds.len(), 1);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = FleetConfig::default();
        let original_source = config.source();

        ConfigOverrides::new().apply(&mut config);

        assert_eq!(config.source(), original_source);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = FleetConfig::default();
        config.monitor.max_concurrent_probes = 0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.fallback.url = "127.0.0.1:11434".to_string();
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.policy.preferences.insert("coding".to_string(), Vec::new());
        assert!(config.validate().is_err());
    }
}
