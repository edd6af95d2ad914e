mod common;

use common::{connect_as, recv, server_config, Fleet};
use imcore::net::wire::CloseNotice;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn fleet_with_admin() -> (Fleet, SocketAddr) {
    let mut fleet = Fleet::new();
    let mut config = server_config("s1");
    config.telemetry.metrics_bind = Some("127.0.0.1:0".into());
    let s1 = fleet.start(config).await;
    let addr = fleet.servers[s1].http_addr().expect("admin endpoint bound");
    (fleet, addr)
}

#[tokio::test]
async fn health_endpoints_track_store_and_drain() {
    let (fleet, admin) = fleet_with_admin().await;

    let (status, body) = get(admin, "/readyz").await;
    assert_eq!(status, 200);
    let ready: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(ready["ready"], true);
    assert_eq!(ready["server"], "s1");

    fleet.store.set_unavailable(true);
    let (status, _) = get(admin, "/readyz").await;
    assert_eq!(status, 503);
    let (status, _) = get(admin, "/livez").await;
    assert_eq!(status, 200);
    fleet.store.set_unavailable(false);

    let (status, _) = get(admin, "/nope").await;
    assert_eq!(status, 404);
    fleet.shutdown().await;
}

#[tokio::test]
async fn metrics_report_connections_and_pools() {
    let (fleet, admin) = fleet_with_admin().await;
    let _alice = fleet.connect(0, "alice").await;

    let (status, body) = get(admin, "/metrics").await;
    assert_eq!(status, 200);
    assert!(body.contains("imcore_connections_local 1"));
    assert!(body.contains("imcore_pool_pending{pool=\"dispatch\"}"));
    assert!(body.contains("imcore_retry_pending 0"));
    fleet.shutdown().await;
}

#[tokio::test]
async fn admission_controls_over_http() {
    let (fleet, admin) = fleet_with_admin().await;

    let (status, _) = get(admin, "/v1/admission/block").await;
    assert_eq!(status, 400);
    let (status, _) = get(admin, "/v1/admission/block?ip=127.0.0.1&seconds=x").await;
    assert_eq!(status, 400);

    let (status, body) = get(admin, "/v1/admission/block?ip=127.0.0.1&seconds=60").await;
    assert_eq!(status, 200);
    let blocked: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(blocked["seconds"], 60);

    let mut client = connect_as(&fleet.ws_url(0), Some("alice")).await.unwrap();
    let reason: CloseNotice = recv(&mut client).await.payload_as().unwrap();
    assert_eq!(reason.reason, "blocked");

    let (_, body) = get(admin, "/v1/admission/stats?ip=127.0.0.1").await;
    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["connections"]["ip"]["blocked"], true);
    assert_eq!(stats["flow"]["throttled"], false);

    let (_, body) = get(admin, "/v1/admission/unblock?ip=127.0.0.1").await;
    let unblocked: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(unblocked["unblocked"], true);

    let (_, body) = get(admin, "/v1/admission/throttle?ip=127.0.0.1").await;
    let throttled: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(throttled["throttled"], true);
    let (_, body) = get(admin, "/v1/admission/stats?ip=127.0.0.1").await;
    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["flow"]["throttled"], true);

    let _alice = fleet.connect(0, "alice").await;
    fleet.shutdown().await;
}

#[tokio::test]
async fn loglevel_without_subscriber_is_unchanged() {
    let (fleet, admin) = fleet_with_admin().await;
    let (status, body) = get(admin, "/v1/loglevel?level=debug").await;
    assert_eq!(status, 200);
    assert!(body.contains("unchanged"));
    fleet.shutdown().await;
}
