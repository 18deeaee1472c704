//! Integration tests for ProxyDialer
//!
//! Each supported scheme is dialed through an in-process mock proxy to an
//! echo server, and the tunnel must carry arbitrary bytes unchanged.

mod common;

use common::*;
use proxyssh::models::{Destination, ProxyEndpoint};
use proxyssh::services::proxy_dialer::ProxyDialer;
use proxyssh::utils::error::ProxySshError;
use std::time::Duration;

/// Every byte value plus something that looks like an SSH banner
fn payload() -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..=255u8).collect();
    bytes.extend_from_slice(b"SSH-2.0-OpenSSH_9.6\r\n");
    bytes
}

async fn assert_round_trip(proxy_url: &str, destination: &Destination) {
    let proxy = ProxyEndpoint::parse(proxy_url).unwrap();
    let mut stream = ProxyDialer::default().dial(&proxy, destination).await.unwrap();

    let data = payload();
    assert_eq!(round_trip(&mut stream, &data).await, data);
    // The tunnel stays usable for further traffic
    assert_eq!(round_trip(&mut stream, b"second").await, b"second");
}

// =============================================================================
// Byte fidelity per scheme
// =============================================================================

#[tokio::test]
async fn test_direct_round_trip() {
    let echo = spawn_echo_server().await;
    let destination = Destination::new("127.0.0.1", echo.port());
    assert_round_trip("direct://", &destination).await;
}

#[tokio::test]
async fn test_http_connect_round_trip() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_http_proxy(None).await;
    let destination = Destination::new("127.0.0.1", echo.port());
    assert_round_trip(&format!("http://{}", proxy), &destination).await;
}

#[tokio::test]
async fn test_http_connect_with_credentials() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_http_proxy(Some("Basic YWxpY2U6cEBzcw==")).await;
    let destination = Destination::new("127.0.0.1", echo.port());
    assert_round_trip(&format!("http://alice:p%40ss@{}", proxy), &destination).await;
}

#[tokio::test]
async fn test_http_connect_wrong_credentials_rejected() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_http_proxy(Some("Basic YWxpY2U6cEBzcw==")).await;
    let destination = Destination::new("127.0.0.1", echo.port());

    let endpoint = ProxyEndpoint::parse(&format!("http://alice:wrong@{}", proxy)).unwrap();
    let err = ProxyDialer::default().dial(&endpoint, &destination).await.unwrap_err();
    match err {
        ProxySshError::TunnelRejected(reason) => assert!(reason.contains("407")),
        other => panic!("expected TunnelRejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_socks5_round_trip() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_socks5_proxy(None).await;
    let destination = Destination::new("127.0.0.1", echo.port());
    assert_round_trip(&format!("socks5://{}", proxy), &destination).await;
}

#[tokio::test]
async fn test_socks5h_round_trip_with_hostname() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_socks5_proxy(None).await;
    let destination = Destination::new("localhost", echo.port());
    assert_round_trip(&format!("socks5h://{}", proxy), &destination).await;
}

#[tokio::test]
async fn test_socks5_with_credentials() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_socks5_proxy(Some(("bob", "hunter2"))).await;
    let destination = Destination::new("127.0.0.1", echo.port());
    assert_round_trip(&format!("socks5://bob:hunter2@{}", proxy), &destination).await;
}

#[tokio::test]
async fn test_socks5_bad_credentials() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_socks5_proxy(Some(("bob", "hunter2"))).await;
    let destination = Destination::new("127.0.0.1", echo.port());

    let endpoint = ProxyEndpoint::parse(&format!("socks5://bob:nope@{}", proxy)).unwrap();
    let err = ProxyDialer::default().dial(&endpoint, &destination).await.unwrap_err();
    assert!(matches!(err, ProxySshError::TunnelRejected(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_socks4_round_trip() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_socks4_proxy().await;
    let destination = Destination::new("127.0.0.1", echo.port());
    assert_round_trip(&format!("socks4://{}", proxy), &destination).await;
}

#[tokio::test]
async fn test_socks4a_round_trip_with_hostname() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_socks4_proxy().await;
    let destination = Destination::new("localhost", echo.port());
    assert_round_trip(&format!("socks4a://{}", proxy), &destination).await;
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_unreachable_proxy() {
    let dead = closed_port().await;
    let endpoint = ProxyEndpoint::parse(&format!("http://{}", dead)).unwrap();
    let destination = Destination::new("127.0.0.1", 22);

    let err = ProxyDialer::default().dial(&endpoint, &destination).await.unwrap_err();
    assert!(matches!(err, ProxySshError::ProxyUnreachable(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_unreachable_destination_through_proxy() {
    let dead = closed_port().await;
    let proxy = spawn_socks5_proxy(None).await;
    let destination = Destination::new("127.0.0.1", dead.port());

    let endpoint = ProxyEndpoint::parse(&format!("socks5://{}", proxy)).unwrap();
    let err = ProxyDialer::default().dial(&endpoint, &destination).await.unwrap_err();
    assert!(matches!(err, ProxySshError::TunnelRejected(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_silent_proxy_times_out() {
    let (silent, _handle) = spawn_silent_listener().await;
    let endpoint = ProxyEndpoint::parse(&format!("socks5://{}", silent)).unwrap();
    let destination = Destination::new("127.0.0.1", 22);

    let dialer = ProxyDialer::new(Some(Duration::from_millis(200)));
    let err = tokio::time::timeout(Duration::from_secs(5), dialer.dial(&endpoint, &destination))
        .await
        .expect("dial must honour the connect timeout")
        .unwrap_err();
    assert!(matches!(err, ProxySshError::ProxyUnreachable(_)), "got {:?}", err);
}
