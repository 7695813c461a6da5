//! End-to-end routing scenarios
//!
//! These tests wire a registry, a health monitor and a router together the
//! way the daemon does, with an in-memory prober standing in for the network.
//! Tests cover:
//! - Strict and resilient behaviour on an empty fleet
//! - Tier fallthrough, load ordering and exclusions
//! - A timed-out peer dropping out of selection after a health cycle
//! - Persistence across a restart

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use fleet_core::{
    AttemptContext, Capability, CapabilityProber, FailurePolicy, HealthMonitor, LocalFallback,
    MonitorConfig, PeerAddr, PeerRegistry, PreferencePolicy, ProbeError, Router, RouterError,
    RoutingRequest, RoutingResult, FALLBACK_PEER_ID, LOCAL_PEER_ID,
};

// =============================================================================
// Fixtures
// =============================================================================

/// Prober answering from a table; `None` entries hang past the deadline
#[derive(Default)]
struct FleetProber {
    answers: Mutex<HashMap<String, Option<Capability>>>,
    local: Mutex<Capability>,
}

impl FleetProber {
    fn serve(&self, addr: &str, models: &[&str], load_avg: f64) {
        self.answers.lock().insert(
            addr.to_string(),
            Some(Capability::with_models(models.iter().copied(), load_avg)),
        );
    }

    fn hang(&self, addr: &str) {
        self.answers.lock().insert(addr.to_string(), None);
    }
}

#[async_trait]
impl CapabilityProber for FleetProber {
    async fn probe_local(&self) -> Capability {
        self.local.lock().clone()
    }

    async fn probe_remote(
        &self,
        addr: &PeerAddr,
        timeout: Duration,
    ) -> Result<Capability, ProbeError> {
        let key = addr.to_string();
        let answer = self.answers.lock().get(&key).cloned();
        match answer {
            Some(Some(cap)) => Ok(cap),
            Some(None) => {
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

fn fleet() -> (Arc<FleetProber>, Arc<PeerRegistry>) {
    let prober = Arc::new(FleetProber::default());
    let registry = Arc::new(
        PeerRegistry::new(prober.clone()).with_probe_timeout(Duration::from_millis(100)),
    );
    (prober, registry)
}

fn strict_router(registry: Arc<PeerRegistry>) -> Router {
    Router::new(registry, PreferencePolicy::default(), FailurePolicy::Strict)
}

fn fallback() -> LocalFallback {
    LocalFallback::new("http://127.0.0.1:11434", "llama3.2:3b")
}

// =============================================================================
// Scenario Tests
// =============================================================================

#[test]
fn test_empty_fleet_strict_raises() {
    let (_, registry) = fleet();
    let router = strict_router(registry);

    let err = router.for_task("hello").unwrap_err();
    assert!(matches!(err, RouterError::NoAvailableEndpoint { .. }));
    assert_eq!(router.stats().snapshot().exhaustions, 1);
}

#[test]
fn test_empty_fleet_resilient_falls_back() {
    let (_, registry) = fleet();
    let router = Router::new(
        registry,
        PreferencePolicy::default(),
        FailurePolicy::Resilient(fallback()),
    );

    let result = router.for_task("hello").unwrap();
    assert_eq!(
        result,
        RoutingResult {
            endpoint_url: "http://127.0.0.1:11434".to_string(),
            peer_id: FALLBACK_PEER_ID.to_string(),
            model_id: "llama3.2:3b".to_string(),
            is_fallback: true,
        }
    );
    assert_eq!(router.stats().snapshot().fallbacks, 1);
}

#[tokio::test]
async fn test_coding_prompt_falls_to_second_tier() {
    let (prober, registry) = fleet();
    prober.serve("nodeA:11434", &["llama3.1:8b"], 30.0);
    let router = strict_router(registry);

    router.add_peer("nodeA", 11434, None).await.unwrap();

    let result = router.for_task("write python code").unwrap();
    assert_eq!(result.endpoint_url, "http://nodeA:11434");
    assert_eq!(result.peer_id, "nodeA");
    assert_eq!(result.model_id, "llama3.1:8b");
    assert!(!result.is_fallback);
    assert_eq!(router.stats().snapshot().later_tier_hits, 1);
}

#[tokio::test]
async fn test_least_loaded_peer_wins_then_exclusion() {
    let (prober, registry) = fleet();
    prober.serve("nodeA:11434", &["llama3.1:8b"], 80.0);
    prober.serve("nodeB:11434", &["llama3.1:8b"], 10.0);
    let router = strict_router(registry);
    router.add_peer("nodeA", 11434, None).await.unwrap();
    router.add_peer("nodeB", 11434, None).await.unwrap();

    let result = router.for_task("hello").unwrap();
    assert_eq!(result.peer_id, "nodeB");

    let excluded: BTreeSet<String> = ["nodeB".to_string()].into_iter().collect();
    let result = router.select("hello", &excluded, None).unwrap();
    assert_eq!(result.peer_id, "nodeA");
}

#[tokio::test]
async fn test_timed_out_peer_leaves_selection() {
    let (prober, registry) = fleet();
    prober.serve("nodeC:11434", &["llama3.1:8b"], 0.0);
    prober.serve("nodeD:11434", &["llama3.1:8b"], 90.0);
    let router = strict_router(registry.clone());
    router.add_peer("nodeC", 11434, None).await.unwrap();
    router.add_peer("nodeD", 11434, None).await.unwrap();
    assert_eq!(router.for_task("hello").unwrap().peer_id, "nodeC");

    prober.hang("nodeC:11434");
    let monitor = HealthMonitor::new(registry.clone(), MonitorConfig::for_testing());
    let report = monitor.run_cycle().await;

    assert_eq!(report.failed, 1);
    assert!(!registry.get("nodeC").unwrap().is_available());
    assert_eq!(monitor.recent_errors()[0].peer_id, "nodeC");

    for _ in 0..5 {
        assert_eq!(router.for_task("hello").unwrap().peer_id, "nodeD");
    }
}

// =============================================================================
// Property Tests
// =============================================================================

#[tokio::test]
async fn test_local_node_wins_within_tier() {
    let (prober, registry) = fleet();
    prober.serve("idle:11434", &["mistral:7b"], 0.0);
    *prober.local.lock() = Capability::with_models(["mistral:7b"], 99.0);

    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        MonitorConfig::for_testing().with_local(PeerAddr::new("127.0.0.1", 11434)),
    ));
    let router = strict_router(registry).with_monitor(monitor.clone());
    router.add_peer("idle", 11434, None).await.unwrap();
    monitor.run_cycle().await;

    let request = RoutingRequest::new("hello").with_preferences(["mistral:7b"]);
    let result = router.route(&request).unwrap();
    assert_eq!(result.peer_id, LOCAL_PEER_ID);
    assert_eq!(result.endpoint_url, "http://127.0.0.1:11434");
}

#[tokio::test]
async fn test_earlier_preference_beats_idle_peer() {
    let (prober, registry) = fleet();
    prober.serve("busy:11434", &["codellama:13b"], 99.0);
    prober.serve("idle:11434", &["llama3.1:8b"], 0.0);
    let router = strict_router(registry);
    router.add_peer("busy", 11434, None).await.unwrap();
    router.add_peer("idle", 11434, None).await.unwrap();

    let result = router.for_task("debug this function").unwrap();
    assert_eq!(result.peer_id, "busy");
    assert_eq!(result.model_id, "codellama:13b");
}

#[tokio::test]
async fn test_role_routing_uses_role_category() {
    let (prober, registry) = fleet();
    prober.serve("writer-box:11434", &["mistral:7b"], 40.0);
    prober.serve("general-box:11434", &["llama3.1:8b"], 0.0);
    let router = strict_router(registry);
    router.add_peer("writer-box", 11434, None).await.unwrap();
    router.add_peer("general-box", 11434, None).await.unwrap();

    assert_eq!(router.for_role("writer").unwrap().peer_id, "writer-box");
    assert_eq!(router.for_role("assistant").unwrap().peer_id, "general-box");
}

#[tokio::test]
async fn test_retry_loop_walks_the_fleet_then_falls_back() {
    let (prober, registry) = fleet();
    prober.serve("nodeA:11434", &["llama3.1:8b"], 10.0);
    prober.serve("nodeB:11434", &["llama3.1:8b"], 20.0);
    let router = Router::new(
        registry,
        PreferencePolicy::default(),
        FailurePolicy::Resilient(fallback()),
    );
    router.add_peer("nodeA", 11434, None).await.unwrap();
    router.add_peer("nodeB", 11434, None).await.unwrap();

    let mut attempts = AttemptContext::new(RoutingRequest::new("hello"), 5);
    let mut served_by = Vec::new();
    while let Some(request) = attempts.next_request() {
        let result = router.route(&request).unwrap();
        served_by.push(result.peer_id.clone());
        attempts.record_failure(&result);
    }

    assert_eq!(served_by, vec!["nodeA", "nodeB", FALLBACK_PEER_ID]);
}

#[tokio::test]
async fn test_unreachable_peer_admitted_unavailable() {
    let (_, registry) = fleet();
    let router = strict_router(registry.clone());

    let id = router.add_peer("10.0.0.99", 11434, Some("ghost")).await.unwrap();
    assert_eq!(id, "ghost");
    assert!(!registry.get("ghost").unwrap().is_available());
    assert!(router.for_task("hello").is_err());

    let status = router.get_status();
    assert_eq!(status.peers_total, 1);
    assert_eq!(status.peers_available, 0);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_startup_discovery_finds_seed() {
    let (prober, registry) = fleet();
    prober.serve("10.0.0.12:11434", &["llama3.1:8b"], 5.0);

    let config = MonitorConfig::for_testing().with_seeds(vec![PeerAddr::new("10.0.0.12", 11434)]);
    let monitor = Arc::new(HealthMonitor::new(registry.clone(), config));
    let router = strict_router(registry).with_monitor(monitor);

    let report = router.start().await.unwrap();
    assert_eq!(report.discovered, 1);
    assert_eq!(router.for_task("hello").unwrap().peer_id, "10.0.0.12");

    // Non-empty registry: no second forced cycle
    assert!(router.start().await.is_none());
}

#[tokio::test]
async fn test_peers_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("peers.json");

    let (prober, registry) = fleet();
    prober.serve("nodeA:11434", &["llama3.1:8b"], 10.0);
    registry.add_peer("nodeA", 11434, Some("alpha")).await.unwrap();
    let monitor = HealthMonitor::new(
        registry.clone(),
        MonitorConfig::for_testing().with_peers_file(path.clone()),
    );
    monitor.run_cycle().await;
    assert!(path.exists());

    let (_, restored) = fleet();
    let report = restored.load(&path).unwrap();
    assert_eq!(report.loaded, 1);

    let router = strict_router(restored);
    let result = router.for_task("hello").unwrap();
    assert_eq!(result.peer_id, "alpha");
    assert_eq!(result.endpoint_url, "http://nodeA:11434");
}

#[tokio::test]
async fn test_spawned_monitor_marks_peer_down() {
    let (prober, registry) = fleet();
    prober.serve("nodeA:11434", &["llama3.1:8b"], 10.0);
    registry.add_peer("nodeA", 11434, None).await.unwrap();

    let monitor = Arc::new(HealthMonitor::new(registry.clone(), MonitorConfig::for_testing()));
    let handle = monitor.spawn();

    prober.answers.lock().remove("nodeA:11434");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!registry.get("nodeA").unwrap().is_available());
    assert!(monitor.cycles_completed() >= 1);
    handle.shutdown().await;
}
