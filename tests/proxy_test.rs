//! End-to-end tests: SOCKS5 client -> front end -> pool -> mock relay -> target

mod common;

use common::*;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tunsocks::config::{Config, FrontEndConfig, ProxyConfig, SelectorStrategy};
use tunsocks::pool::PoolKey;
use tunsocks::socks::{encode_udp_packet, parse_udp_header, TargetAddr};
use tunsocks::AppContext;

async fn start_proxy(proxies: Vec<ProxyConfig>) -> (Arc<AppContext>, SocketAddr) {
    start_proxy_with(proxies, SelectorStrategy::First).await
}

async fn start_proxy_with(
    proxies: Vec<ProxyConfig>,
    map: SelectorStrategy,
) -> (Arc<AppContext>, SocketAddr) {
    let ctx = AppContext::new(&Config {
        proxies,
        ..Default::default()
    });
    let mut front_end = FrontEndConfig::new("127.0.0.1", 0);
    front_end.map = map;
    let addr = ctx
        .start_front_end(&front_end)
        .unwrap()
        .wait_bound()
        .await
        .unwrap();
    (ctx, addr)
}

#[tokio::test]
async fn test_tcp_connect_through_shared_tunnel() {
    let relay = MockRelay::start().await;
    let echo = start_echo_server().await;
    let (ctx, proxy) = start_proxy(vec![relay.proxy_config("default")]).await;

    let (mut first, code) = socks_connect(proxy, &TargetAddr::from(echo)).await;
    assert_eq!(code, 0x00);
    assert_echo(&mut first, b"hello through the tunnel").await;

    let (mut second, code) = socks_connect(proxy, &TargetAddr::from(echo)).await;
    assert_eq!(code, 0x00);
    assert_echo(&mut second, b"second stream").await;

    // Both streams share the `default` tunnel
    assert_eq!(relay.carriers(), 1);
    let pool = ctx.proxies().get("default").unwrap();
    assert_eq!(pool.keys(), vec![PoolKey::default_key()]);

    ctx.shutdown().await;
    assert_eq!(pool.tunnel_count(), 0);
}

#[tokio::test]
async fn test_connection_per_tcp_closes_tunnel_with_stream() {
    let relay = MockRelay::start().await;
    let echo = start_echo_server().await;
    let mut profile = relay.proxy_config("default");
    profile.routing.connection_per_tcp = true;
    let (ctx, proxy) = start_proxy(vec![profile]).await;
    let pool = ctx.proxies().get("default").unwrap();

    for round in 0..2u8 {
        let (mut stream, code) = socks_connect(proxy, &TargetAddr::from(echo)).await;
        assert_eq!(code, 0x00);
        assert_echo(&mut stream, &[round; 32]).await;
        assert!(pool.keys()[0].as_str().starts_with("TCP:"));
        drop(stream);
        assert!(wait_until(|| pool.tunnel_count() == 0).await);
    }

    assert_eq!(relay.carriers(), 2);
    assert!(relay
        .modes()
        .iter()
        .all(|mode| *mode == tunsocks::protocol::SharingMode::Exclusive));
    assert!(wait_until(|| pool.stats().tunnels_closed == 2).await);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_connection_per_target_reuses_tunnel_per_target() {
    let relay = MockRelay::start().await;
    let echo_a = start_echo_server().await;
    let echo_b = start_echo_server().await;
    let mut profile = relay.proxy_config("default");
    profile.routing.connection_per_target = true;
    let (ctx, proxy) = start_proxy(vec![profile]).await;

    let mut streams = Vec::new();
    for target in [echo_a, echo_a, echo_b] {
        let (mut stream, code) = socks_connect(proxy, &TargetAddr::from(target)).await;
        assert_eq!(code, 0x00);
        assert_echo(&mut stream, b"ping").await;
        streams.push(stream);
    }

    assert_eq!(relay.carriers(), 2);
    let mut keys: Vec<_> = ctx
        .proxies()
        .get("default")
        .unwrap()
        .keys()
        .iter()
        .map(|key| key.to_string())
        .collect();
    keys.sort();
    let mut expected = vec![
        format!("Target:127.0.0.1@{}", echo_a.port()),
        format!("Target:127.0.0.1@{}", echo_b.port()),
    ];
    expected.sort();
    assert_eq!(keys, expected);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_target_gets_general_failure() {
    let relay = MockRelay::start().await;
    let (ctx, proxy) = start_proxy(vec![relay.proxy_config("default")]).await;

    // Nothing listens on port 1
    let (_stream, code) = socks_connect(proxy, &TargetAddr::from(SocketAddr::from(([127, 0, 0, 1], 1)))).await;
    assert_eq!(code, 0x01);

    // The tunnel itself is fine and stays registered
    let pool = ctx.proxies().get("default").unwrap();
    assert_eq!(pool.tunnel_count(), 1);
    assert_eq!(pool.stats().streams_failed, 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_relay_down_gets_general_failure() {
    let relay = MockRelay::start().await;
    let mut profile = relay.proxy_config("default");
    // Point at a port nobody listens on
    profile.tunnel.server = "127.0.0.1:1".to_string();
    let (ctx, proxy) = start_proxy(vec![profile]).await;

    let echo = start_echo_server().await;
    let (_stream, code) = socks_connect(proxy, &TargetAddr::from(echo)).await;
    assert_eq!(code, 0x01);

    let pool = ctx.proxies().get("default").unwrap();
    assert!(wait_until(|| pool.tunnel_count() == 0).await);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_no_proxy_gets_general_failure() {
    let (ctx, proxy) = start_proxy(Vec::new()).await;
    let echo = start_echo_server().await;
    let (_stream, code) = socks_connect(proxy, &TargetAddr::from(echo)).await;
    assert_eq!(code, 0x01);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_rule_strategy_gets_general_failure() {
    let relay = MockRelay::start().await;
    let (ctx, proxy) = start_proxy_with(
        vec![relay.proxy_config("default")],
        SelectorStrategy::Rule {
            rule: "geo".to_string(),
        },
    )
    .await;

    let echo = start_echo_server().await;
    let (_stream, code) = socks_connect(proxy, &TargetAddr::from(echo)).await;
    assert_eq!(code, 0x01);
    assert_eq!(relay.carriers(), 0);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_name_strategy_picks_named_pool() {
    let main = MockRelay::start().await;
    let backup = MockRelay::start().await;
    let echo = start_echo_server().await;
    let (ctx, proxy) = start_proxy_with(
        vec![main.proxy_config("main"), backup.proxy_config("backup")],
        SelectorStrategy::Name {
            name: "backup".to_string(),
        },
    )
    .await;

    let (mut stream, code) = socks_connect(proxy, &TargetAddr::from(echo)).await;
    assert_eq!(code, 0x00);
    assert_echo(&mut stream, b"via backup").await;
    assert_eq!(main.carriers(), 0);
    assert_eq!(backup.carriers(), 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_udp_associate_roundtrip() {
    let relay = MockRelay::start().await;
    let echo = start_udp_echo().await;
    let (ctx, proxy) = start_proxy(vec![relay.proxy_config("default")]).await;

    let (control, code, relay_addr) = socks_udp_associate(proxy).await;
    assert_eq!(code, 0x00);
    assert_ne!(relay_addr.port(), 0);

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let frame = encode_udp_packet(&TargetAddr::from(echo), b"dns query");
    client.send_to(&frame, relay_addr).await.unwrap();

    let mut buf = [0u8; 1024];
    let (n, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no UDP reply")
        .unwrap();
    assert_eq!(from, relay_addr);
    assert_eq!(&buf[..3], &[0, 0, 0]);
    let header = parse_udp_header(&buf[..n]).unwrap();
    assert_eq!(header.addr, TargetAddr::from(echo));
    assert_eq!(&buf[header.len..n], b"dns query");

    // Closing the control connection ends the association
    drop(control);
    let pool = ctx.proxies().get("default").unwrap();
    assert!(wait_until(|| pool.stats().active_streams == 0).await);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_udp_fragments_are_dropped() {
    let relay = MockRelay::start().await;
    let echo = start_udp_echo().await;
    let (ctx, proxy) = start_proxy(vec![relay.proxy_config("default")]).await;

    let (_control, code, relay_addr) = socks_udp_associate(proxy).await;
    assert_eq!(code, 0x00);

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut fragment = encode_udp_packet(&TargetAddr::from(echo), b"part");
    fragment[2] = 1;
    client.send_to(&fragment, relay_addr).await.unwrap();
    client
        .send_to(&encode_udp_packet(&TargetAddr::from(echo), b"whole"), relay_addr)
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no UDP reply")
        .unwrap();
    let header = parse_udp_header(&buf[..n]).unwrap();
    assert_eq!(&buf[header.len..n], b"whole");
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_udp_associate_fails_when_tunnel_fails() {
    let connector = Arc::new(FailingConnector::default());
    let relay = MockRelay::start().await;
    let ctx = AppContext::with_connector(
        &Config {
            proxies: vec![relay.proxy_config("default")],
            ..Default::default()
        },
        connector.clone(),
    );
    let proxy = ctx
        .start_front_end(&FrontEndConfig::new("127.0.0.1", 0))
        .unwrap()
        .wait_bound()
        .await
        .unwrap();

    let (_control, code, _) = socks_udp_associate(proxy).await;
    assert_eq!(code, 0x01);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    ctx.shutdown().await;
}
