//! End-to-end pipeline tests over real sockets: real listeners, real
//! upstream servers, the real upstream client. Only the control plane and
//! TLS issuance are absent; domain configs are published directly into the
//! store the way the loader would.
use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::Request,
    http::{StatusCode, header},
    response::Response,
    routing::any,
};
use http_body_util::BodyExt;
use proxy_engine::{
    CertificateManager, ConfigStore, HttpClientAdapter, MetricsAggregator, ProxyHandler,
    RateLimiterRegistry, SessionTracker,
    config::models::AcmeSettings,
    core::{
        balancer::RrState,
        domain::{Backend, BackendScheme, DomainConfig, HealthState},
    },
    ports::HttpClient,
    server,
    utils::GracefulShutdown,
};
use tokio::net::TcpListener;

/// Minimal upstream origin: answers 200, tags the response with its marker,
/// and echoes the request's Host and X-Real-IP headers back for inspection.
async fn spawn_backend(marker: &'static str) -> SocketAddr {
    let app = Router::new().fallback(any(move |req: Request| async move {
        let seen_host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let seen_real_ip = req
            .headers()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        Response::builder()
            .status(StatusCode::OK)
            .header("x-backend", marker)
            .header("x-seen-host", seen_host)
            .header("x-seen-real-ip", seen_real_ip)
            .body(Body::from(marker))
            .unwrap()
    }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

struct Proxy {
    addr: SocketAddr,
    store: Arc<ConfigStore>,
    metrics: Arc<MetricsAggregator>,
    client: HttpClientAdapter,
    _shutdown: GracefulShutdown,
    _tmp: tempfile::TempDir,
}

async fn spawn_proxy() -> Proxy {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(ConfigStore::new());
    let metrics = Arc::new(MetricsAggregator::new());
    let certificates = Arc::new(
        CertificateManager::new(AcmeSettings {
            email: "ops@example.com".to_string(),
            data_dir: tmp.path().to_string_lossy().to_string(),
            production: false,
            tls_alpn: false,
        })
        .unwrap(),
    );
    let upstream_client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new().unwrap());

    let handler = Arc::new(ProxyHandler::new(
        store.clone(),
        Arc::new(RateLimiterRegistry::new()),
        metrics.clone(),
        certificates,
        upstream_client,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = GracefulShutdown::new();
    let token = shutdown.shutdown_token();
    let sessions = SessionTracker::new();
    tokio::spawn(async move {
        let _ = server::run_http_listener(listener, handler, sessions, token).await;
    });

    Proxy {
        addr,
        store,
        metrics,
        client: HttpClientAdapter::new().unwrap(),
        _shutdown: shutdown,
        _tmp: tmp,
    }
}

fn http_backend(id: i64, addr: SocketAddr) -> Backend {
    Backend {
        id,
        scheme: BackendScheme::Http,
        ip: addr.ip(),
        port: addr.port(),
        weight: 1,
        active: true,
        health: HealthState::Healthy,
    }
}

async fn publish(store: &ConfigStore, key: &str, ssl: bool, backends: Vec<Backend>) {
    let rr = Arc::new(RrState::for_backends(&backends));
    let mut snapshot = HashMap::new();
    store.scan(|k, v| {
        snapshot.insert(k.to_string(), Arc::clone(v));
    });
    snapshot.insert(
        key.to_string(),
        Arc::new(DomainConfig {
            routing_key: key.to_string(),
            display_name: key.to_string(),
            ssl_enabled: ssl,
            health_check_enabled: false,
            health_check_interval: 30,
            backends,
            ip_rules: Vec::new(),
            rate_limit: None,
            rr,
        }),
    );
    store.publish(snapshot).await;
}

async fn get(proxy: &Proxy, host: &str, path: &str) -> Response<axum::body::Body> {
    let req = hyper::Request::builder()
        .uri(format!("http://{}{}", proxy.addr, path))
        .header(header::HOST, host)
        .body(axum::body::Body::empty())
        .unwrap();
    proxy.client.send_request(req).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_spreads_requests_evenly() {
    let alpha = spawn_backend("alpha").await;
    let beta = spawn_backend("beta").await;

    let proxy = spawn_proxy().await;
    publish(
        &proxy.store,
        "a.example",
        false,
        vec![http_backend(1, alpha), http_backend(2, beta)],
    )
    .await;

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..10 {
        let response = get(&proxy, "a.example", "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let marker = response
            .headers()
            .get("x-backend")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        *counts.entry(marker).or_default() += 1;
    }

    assert_eq!(counts.get("alpha"), Some(&5));
    assert_eq!(counts.get("beta"), Some(&5));

    // Ten successes, ten records, zero errors.
    let drained = proxy.metrics.drain().await;
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].1.http_count, 10);
    assert_eq!(drained[0].1.error_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_sees_client_host_and_real_ip() {
    let backend = spawn_backend("origin").await;
    let proxy = spawn_proxy().await;
    publish(
        &proxy.store,
        "a.example",
        false,
        vec![http_backend(1, backend)],
    )
    .await;

    let response = get(&proxy, "a.example", "/v1/items?page=2").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-seen-host").unwrap(),
        "a.example",
        "Host header must be the client-visible host, not the backend address"
    );
    assert_eq!(response.headers().get("x-seen-real-ip").unwrap(), "127.0.0.1");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"origin");
}

#[tokio::test(flavor = "multi_thread")]
async fn ssl_domain_redirects_plain_requests() {
    let proxy = spawn_proxy().await;
    publish(&proxy.store, "b.example", true, Vec::new()).await;

    let response = get(&proxy, "b.example", "/x").await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "https://b.example/x"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_host_gets_404() {
    let proxy = spawn_proxy().await;
    let response = get(&proxy, "nobody.example", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_domain_stops_resolving() {
    let backend = spawn_backend("origin").await;
    let proxy = spawn_proxy().await;
    publish(
        &proxy.store,
        "e.example",
        false,
        vec![http_backend(1, backend)],
    )
    .await;

    assert_eq!(get(&proxy, "e.example", "/").await.status(), StatusCode::OK);

    // Next reload no longer lists the domain.
    proxy.store.publish(HashMap::new()).await;
    assert_eq!(
        get(&proxy, "e.example", "/").await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_backend_yields_502_and_an_error_record() {
    // Reserve a port, then close it so dials are refused.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = reserved.local_addr().unwrap();
    drop(reserved);

    let proxy = spawn_proxy().await;
    publish(
        &proxy.store,
        "a.example",
        false,
        vec![http_backend(1, dead)],
    )
    .await;

    let response = get(&proxy, "a.example", "/").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let drained = proxy.metrics.drain().await;
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].1.error_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn all_backends_unhealthy_yields_503() {
    let backend = spawn_backend("origin").await;
    let proxy = spawn_proxy().await;

    let mut down = http_backend(1, backend);
    down.health = HealthState::Unhealthy;
    publish(&proxy.store, "a.example", false, vec![down]).await;

    let response = get(&proxy, "a.example", "/").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // The backend comes back; traffic flows again.
    publish(
        &proxy.store,
        "a.example",
        false,
        vec![http_backend(1, backend)],
    )
    .await;
    assert_eq!(get(&proxy, "a.example", "/").await.status(), StatusCode::OK);
}
