//! Pool caching and invalidation in `ProxyBuilder`.

mod common;

use bifrost_fastproxy::config::TransportSettings;
use bifrost_fastproxy::proxy_env::FixedProxy;
use bifrost_fastproxy::transport::StaticTransportManager;
use bifrost_fastproxy::{ProxyBuilder, ProxyError};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Request, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

fn settings_map(entries: &[(&str, TransportSettings)]) -> HashMap<String, TransportSettings> {
    entries
        .iter()
        .map(|(name, settings)| (name.to_string(), settings.clone()))
        .collect()
}

#[tokio::test]
async fn test_same_target_shares_pool() {
    let builder = common::default_builder();
    let target = Url::parse("http://backend.test:8080/app").unwrap();

    let first = builder.build("default", &target, false, false).unwrap();
    let second = builder.build("default", &target, true, true).unwrap();
    assert!(Arc::ptr_eq(first.pool(), second.pool()));

    let other = Url::parse("http://other.test:8080").unwrap();
    let third = builder.build("default", &other, false, false).unwrap();
    assert!(!Arc::ptr_eq(first.pool(), third.pool()));
    assert_eq!(builder.pool_count("default"), 2);
}

#[tokio::test]
async fn test_tls_and_plain_targets_get_separate_pools() {
    let builder = common::default_builder();
    let plain = builder
        .build("default", &Url::parse("http://backend.test:8443").unwrap(), false, false)
        .unwrap();
    let secure = builder
        .build("default", &Url::parse("https://backend.test:8443").unwrap(), false, false)
        .unwrap();
    assert!(!Arc::ptr_eq(plain.pool(), secure.pool()));
}

#[tokio::test]
async fn test_unknown_transport_is_rejected() {
    let builder = common::default_builder();
    let target = Url::parse("http://backend.test").unwrap();
    let err = builder.build("missing", &target, false, false).err().unwrap();
    assert!(matches!(err, ProxyError::Config(_)));
}

#[tokio::test]
async fn test_update_drops_changed_and_removed_transports() {
    let fast = TransportSettings {
        dial_timeout_secs: 5,
        ..TransportSettings::default()
    };
    let initial = settings_map(&[("default", TransportSettings::default()), ("fast", fast.clone())]);
    let manager = Arc::new(StaticTransportManager::new(initial.clone()));
    let builder = ProxyBuilder::new(manager.clone(), Arc::new(bifrost_fastproxy::proxy_env::NoProxy), false);
    builder.update(&initial);

    let target = Url::parse("http://backend.test").unwrap();
    let default_proxy = builder.build("default", &target, false, false).unwrap();
    let fast_proxy = builder.build("fast", &target, false, false).unwrap();

    // Identical snapshot: nothing is touched.
    builder.update(&initial);
    assert_eq!(builder.pool_count("default"), 1);
    assert_eq!(builder.pool_count("fast"), 1);

    // "default" changes, "fast" disappears.
    let changed = TransportSettings {
        idle_timeout_secs: 30,
        ..TransportSettings::default()
    };
    let next = settings_map(&[("default", changed)]);
    manager.replace(next.clone());
    builder.update(&next);

    assert_eq!(builder.pool_count("default"), 0);
    assert_eq!(builder.pool_count("fast"), 0);
    assert!(default_proxy.pool().is_closed());
    assert!(fast_proxy.pool().is_closed());

    let rebuilt = builder.build("default", &target, false, false).unwrap();
    assert!(!Arc::ptr_eq(rebuilt.pool(), default_proxy.pool()));
    assert!(!rebuilt.pool().is_closed());
}

#[tokio::test]
async fn test_plain_http_forward_proxy_uses_absolute_form() {
    let (proxy_addr, mut heads) = common::spawn_raw_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        false,
    )
    .await;

    let mut transports = HashMap::new();
    transports.insert("default".to_string(), TransportSettings::default());
    let forward = Url::parse(&format!("http://user:secret@{}", proxy_addr)).unwrap();
    let builder = ProxyBuilder::new(
        Arc::new(StaticTransportManager::new(transports)),
        Arc::new(FixedProxy(forward)),
        true,
    );

    let target = Url::parse("http://backend.test:8080").unwrap();
    let proxy = builder.build("default", &target, false, false).unwrap();
    let response = proxy
        .serve(Request::get("/path?q=1").body(Empty::<Bytes>::new()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let head = heads.recv().await.unwrap();
    assert!(head.starts_with("GET http://backend.test:8080/path?q=1 HTTP/1.1\r\n"), "{}", head);
    assert!(head.contains("Host: backend.test:8080\r\n"));
    // user:secret
    assert!(head.contains("Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n"));
    assert!(head.contains("X-Bifrost-Fast-Proxy: true\r\n"));
}
