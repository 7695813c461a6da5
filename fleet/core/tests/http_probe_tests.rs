//! HTTP prober tests against a minimal in-process responder
//!
//! Each test binds a loopback listener that answers fixed bodies per path and
//! points [`HttpProber`] at it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use fleet_core::{
    CapabilityProber, ErrorClass, HttpProber, LocalEndpoint, PeerAddr, PeerRegistry,
};

// =============================================================================
// Responder
// =============================================================================

#[derive(Clone)]
enum Reply {
    Json(u16, &'static str),
    Stall,
}

/// Serve `routes` on an ephemeral port; unknown paths get 404
async fn serve(routes: Vec<(&'static str, Reply)>) -> PeerAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let routes: Arc<HashMap<&'static str, Reply>> = Arc::new(routes.into_iter().collect());

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                loop {
                    let Ok(n) = socket.read(&mut buf[read..]).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
                        break;
                    }
                }

                let head = String::from_utf8_lossy(&buf[..read]);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                let (status, body) = match routes.get(path.as_str()) {
                    Some(Reply::Json(status, body)) => (*status, *body),
                    Some(Reply::Stall) => {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        return;
                    }
                    None => (404, r#"{"error":"not found"}"#),
                };
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    PeerAddr::new("127.0.0.1", port)
}

const TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Remote Probe Tests
// =============================================================================

#[tokio::test]
async fn test_capability_document_is_parsed() {
    let addr = serve(vec![(
        "/api/capabilities",
        Reply::Json(
            200,
            r#"{"cpu_cores":16,"memory_gb":64.0,"gpu_memory_gb":24.0,"models":["codellama:13b","llama3.1:8b"],"load_avg":37.5}"#,
        ),
    )])
    .await;

    let cap = HttpProber::default().probe_remote(&addr, TIMEOUT).await.unwrap();
    assert!(cap.available);
    assert_eq!(cap.cpu_cores, 16);
    assert!((cap.gpu_memory_gb - 24.0).abs() < f64::EPSILON);
    assert!((cap.load_avg - 37.5).abs() < f64::EPSILON);
    assert!(cap.serves("codellama:13b"));
    assert!(cap.serves("llama3.1:8b"));
}

#[tokio::test]
async fn test_missing_capability_endpoint_falls_back_to_tags() {
    let addr = serve(vec![(
        "/api/tags",
        Reply::Json(
            200,
            r#"{"models":[{"name":"mistral:7b","size":4109865159},{"name":"llama3.2:3b"}]}"#,
        ),
    )])
    .await;

    let cap = HttpProber::default().probe_remote(&addr, TIMEOUT).await.unwrap();
    assert!(cap.available);
    assert_eq!(cap.models.len(), 2);
    assert!(cap.serves("mistral:7b"));
    assert_eq!(cap.cpu_cores, 0);
}

#[tokio::test]
async fn test_malformed_payload_is_validation_error() {
    let addr = serve(vec![(
        "/api/capabilities",
        Reply::Json(200, r#"{"models":"llama3.1:8b"}"#),
    )])
    .await;

    let err = HttpProber::default().probe_remote(&addr, TIMEOUT).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
}

#[tokio::test]
async fn test_out_of_range_load_is_validation_error() {
    let addr = serve(vec![(
        "/api/capabilities",
        Reply::Json(200, r#"{"models":["llama3.1:8b"],"load_avg":250.0}"#),
    )])
    .await;

    let err = HttpProber::default().probe_remote(&addr, TIMEOUT).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
}

#[tokio::test]
async fn test_server_error_is_network_error() {
    let addr = serve(vec![(
        "/api/capabilities",
        Reply::Json(500, r#"{"error":"boom"}"#),
    )])
    .await;

    let err = HttpProber::default().probe_remote(&addr, TIMEOUT).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Network);
}

#[tokio::test]
async fn test_stalled_peer_times_out() {
    let addr = serve(vec![("/api/capabilities", Reply::Stall)]).await;

    let err = HttpProber::default()
        .probe_remote(&addr, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Timeout);
    assert_eq!(err.addr(), addr.to_string());
}

// =============================================================================
// Local Probe and Registry Tests
// =============================================================================

#[tokio::test]
async fn test_local_probe_reads_model_list() {
    let addr = serve(vec![(
        "/api/tags",
        Reply::Json(200, r#"{"models":[{"name":"llama3.1:8b"}]}"#),
    )])
    .await;

    let prober = HttpProber::new(LocalEndpoint {
        host: addr.ip.clone(),
        port: addr.port,
        timeout: TIMEOUT,
    });
    let cap = prober.probe_local().await;
    assert!(cap.available);
    assert!(cap.serves("llama3.1:8b"));
    assert!((0.0..=100.0).contains(&cap.load_avg));
}

#[tokio::test]
async fn test_registry_admits_probed_peer() {
    let addr = serve(vec![(
        "/api/capabilities",
        Reply::Json(200, r#"{"models":["llama3.1:8b"],"load_avg":5.0}"#),
    )])
    .await;

    let registry = PeerRegistry::new(Arc::new(HttpProber::default()));
    let id = registry
        .add_peer(&addr.ip, addr.port, Some("loopback"))
        .await
        .unwrap();

    let peer = registry.get(&id).unwrap();
    assert!(peer.is_available());
    assert!(peer.serves("llama3.1:8b"));
    assert_eq!(peer.endpoint_url(), addr.base_url());
}
