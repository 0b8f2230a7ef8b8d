//! Active backend health probing.
//!
//! A single global ticker probes every active backend of every domain that
//! has health checks enabled, then writes the verdict back to the
//! control-plane store. The data plane never reads these writes directly;
//! it observes them through the next loader tick, which bounds staleness to
//! one reload interval. The per-domain `health_check_interval` column is
//! carried in the config but the cadence is global.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::{sleep, timeout};

use crate::{
    core::{
        domain::{Backend, BackendScheme, HealthState},
        store::ConfigStore,
    },
    ports::{control_plane::ControlPlane, http_client::HttpClient},
    utils::graceful_shutdown::ShutdownToken,
};

const PROBE_TIMEOUT_SECS: u64 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Health checker loop probing backends and persisting verdicts.
pub struct HealthChecker {
    control_plane: Arc<dyn ControlPlane>,
    store: Arc<ConfigStore>,
    http_client: Arc<dyn HttpClient>,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        store: Arc<ConfigStore>,
        http_client: Arc<dyn HttpClient>,
        interval: Duration,
    ) -> Self {
        Self {
            control_plane,
            store,
            http_client,
            interval,
        }
    }

    /// Run the health checker loop until shutdown.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Starting health checker"
        );

        let mut ticker = tokio::time::interval(self.interval);
        // The loader has usually just published fresh state at startup;
        // consume the immediate tick so the first cycle runs after one full
        // interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                _ = shutdown.wait_for_shutdown() => {
                    tracing::info!("Health checker shutting down");
                    break;
                }
            }
        }
    }

    /// Probe every health-checked backend once and persist the verdicts.
    pub async fn run_cycle(&self) {
        let mut targets: Vec<(String, Backend)> = Vec::new();
        self.store.scan(|key, config| {
            if !config.health_check_enabled {
                return;
            }
            for backend in config.backends.iter().filter(|b| b.active) {
                targets.push((key.to_string(), backend.clone()));
            }
        });

        tracing::debug!(backends = targets.len(), "Running health check cycle");

        for (routing_key, backend) in targets {
            let verdict = self.probe_backend(&backend).await;

            if verdict != backend.health {
                tracing::info!(
                    domain = %routing_key,
                    backend = %backend.addr(),
                    from = backend.health.as_str(),
                    to = verdict.as_str(),
                    "Backend health changed"
                );
            }

            if let Err(e) = self
                .control_plane
                .update_backend_health(backend.id, verdict.as_str(), Utc::now())
                .await
            {
                tracing::warn!(
                    backend = %backend.addr(),
                    error = %e,
                    "Failed to persist health verdict"
                );
            }
        }
    }

    /// Probe one backend. HTTP family backends answer `GET /`; any response
    /// at all counts as healthy, so an origin serving 500s is still
    /// reachable and keeps receiving traffic. Transport failures retry once
    /// before the backend is declared unhealthy. TCP backends only need to
    /// accept a connection.
    pub async fn probe_backend(&self, backend: &Backend) -> HealthState {
        match backend.scheme {
            BackendScheme::Http | BackendScheme::Https => self.probe_http(backend).await,
            BackendScheme::Tcp => self.probe_tcp(backend).await,
        }
    }

    async fn probe_http(&self, backend: &Backend) -> HealthState {
        let url = format!("{}/", backend.origin());

        match self.http_client.probe(&url, PROBE_TIMEOUT_SECS).await {
            Ok(_status) => HealthState::Healthy,
            Err(first_err) => {
                tracing::debug!(
                    backend = %backend.addr(),
                    error = %first_err,
                    "First probe attempt failed; retrying"
                );
                sleep(RETRY_DELAY).await;

                match self.http_client.probe(&url, PROBE_TIMEOUT_SECS).await {
                    Ok(_status) => HealthState::Healthy,
                    Err(second_err) => {
                        tracing::debug!(
                            backend = %backend.addr(),
                            error = %second_err,
                            "Second probe attempt failed"
                        );
                        HealthState::Unhealthy
                    }
                }
            }
        }
    }

    async fn probe_tcp(&self, backend: &Backend) -> HealthState {
        let addr = backend.addr();
        match timeout(
            Duration::from_secs(PROBE_TIMEOUT_SECS),
            tokio::net::TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(_stream)) => HealthState::Healthy,
            Ok(Err(e)) => {
                tracing::debug!(backend = %addr, error = %e, "TCP probe failed");
                HealthState::Unhealthy
            }
            Err(_) => {
                tracing::debug!(backend = %addr, "TCP probe timed out");
                HealthState::Unhealthy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use axum::body::Body as AxumBody;
    use chrono::{DateTime, Utc};
    use hyper::{Request, Response};

    use super::*;
    use crate::{
        core::{balancer::RrState, domain::DomainConfig},
        ports::{
            control_plane::{
                BackendRecord, ControlPlaneResult, DomainRecord, IpRuleRecord, RateLimitRecord,
                RequestMetricsRow, TcpMetricsRow,
            },
            http_client::{HttpClientError, HttpClientResult},
        },
    };

    // Mock HTTP client: either always answers `status` or always fails.
    struct MockHttpClient {
        status: Option<u16>,
        probes: AtomicUsize,
    }

    impl MockHttpClient {
        fn answering(status: u16) -> Self {
            Self {
                status: Some(status),
                probes: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                status: None,
                probes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn send_request(
            &self,
            _req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            Err(HttpClientError::ConnectionError(
                "not used in tests".to_string(),
            ))
        }

        async fn probe(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<u16> {
            self.probes.fetch_add(1, Ordering::Relaxed);
            match self.status {
                Some(status) => Ok(status),
                None => Err(HttpClientError::ConnectionError("refused".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingControlPlane {
        health_writes: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ControlPlane for RecordingControlPlane {
        async fn fetch_domains(&self) -> ControlPlaneResult<Vec<DomainRecord>> {
            Ok(Vec::new())
        }

        async fn fetch_backends(&self, _domain_id: i64) -> ControlPlaneResult<Vec<BackendRecord>> {
            Ok(Vec::new())
        }

        async fn fetch_ip_rules(&self, _domain_id: i64) -> ControlPlaneResult<Vec<IpRuleRecord>> {
            Ok(Vec::new())
        }

        async fn fetch_rate_limit(
            &self,
            _domain_id: i64,
        ) -> ControlPlaneResult<Option<RateLimitRecord>> {
            Ok(None)
        }

        async fn update_backend_health(
            &self,
            backend_id: i64,
            status: &str,
            _checked_at: DateTime<Utc>,
        ) -> ControlPlaneResult<()> {
            self.health_writes
                .lock()
                .unwrap()
                .push((backend_id, status.to_string()));
            Ok(())
        }

        async fn append_request_metrics(&self, _row: RequestMetricsRow) -> ControlPlaneResult<()> {
            Ok(())
        }

        async fn append_tcp_metrics(&self, _row: TcpMetricsRow) -> ControlPlaneResult<()> {
            Ok(())
        }
    }

    fn backend(id: i64, scheme: BackendScheme, active: bool) -> Backend {
        Backend {
            id,
            scheme,
            ip: "127.0.0.1".parse().unwrap(),
            port: 8080,
            weight: 1,
            active,
            health: HealthState::Unknown,
        }
    }

    async fn publish_domain(store: &ConfigStore, key: &str, enabled: bool, backends: Vec<Backend>) {
        let rr = Arc::new(RrState::for_backends(&backends));
        let mut snapshot = HashMap::new();
        snapshot.insert(
            key.to_string(),
            Arc::new(DomainConfig {
                routing_key: key.to_string(),
                display_name: key.to_string(),
                ssl_enabled: false,
                health_check_enabled: enabled,
                health_check_interval: 30,
                backends,
                ip_rules: Vec::new(),
                rate_limit: None,
                rr,
            }),
        );
        store.publish(snapshot).await;
    }

    fn checker(
        control_plane: Arc<RecordingControlPlane>,
        store: Arc<ConfigStore>,
        client: Arc<dyn HttpClient>,
    ) -> HealthChecker {
        HealthChecker::new(control_plane, store, client, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn responding_backend_is_healthy_even_with_500() {
        let cp = Arc::new(RecordingControlPlane::default());
        let store = Arc::new(ConfigStore::new());
        let client = Arc::new(MockHttpClient::answering(500));
        let hc = checker(cp, store, client.clone());

        let verdict = hc
            .probe_backend(&backend(1, BackendScheme::Http, true))
            .await;
        assert_eq!(verdict, HealthState::Healthy);
        assert_eq!(client.probes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transport_failure_retries_then_marks_unhealthy() {
        let cp = Arc::new(RecordingControlPlane::default());
        let store = Arc::new(ConfigStore::new());
        let client = Arc::new(MockHttpClient::failing());
        let hc = checker(cp, store, client.clone());

        let verdict = hc
            .probe_backend(&backend(1, BackendScheme::Http, true))
            .await;
        assert_eq!(verdict, HealthState::Unhealthy);
        assert_eq!(client.probes.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn tcp_backend_dial_success_is_healthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let cp = Arc::new(RecordingControlPlane::default());
        let store = Arc::new(ConfigStore::new());
        let hc = checker(cp, store, Arc::new(MockHttpClient::failing()));

        let mut b = backend(1, BackendScheme::Tcp, true);
        b.port = port;
        assert_eq!(hc.probe_backend(&b).await, HealthState::Healthy);
    }

    #[tokio::test]
    async fn tcp_backend_refused_dial_is_unhealthy() {
        // Bind then drop to find a port that refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cp = Arc::new(RecordingControlPlane::default());
        let store = Arc::new(ConfigStore::new());
        let hc = checker(cp, store, Arc::new(MockHttpClient::failing()));

        let mut b = backend(1, BackendScheme::Tcp, true);
        b.port = port;
        assert_eq!(hc.probe_backend(&b).await, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn cycle_writes_verdicts_for_active_backends_only() {
        let cp = Arc::new(RecordingControlPlane::default());
        let store = Arc::new(ConfigStore::new());
        publish_domain(
            &store,
            "a.example",
            true,
            vec![
                backend(1, BackendScheme::Http, true),
                backend(2, BackendScheme::Http, false),
            ],
        )
        .await;

        let hc = checker(cp.clone(), store, Arc::new(MockHttpClient::answering(200)));
        hc.run_cycle().await;

        let writes = cp.health_writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], (1, "healthy".to_string()));
    }

    #[tokio::test]
    async fn cycle_skips_domains_with_checks_disabled() {
        let cp = Arc::new(RecordingControlPlane::default());
        let store = Arc::new(ConfigStore::new());
        publish_domain(
            &store,
            "a.example",
            false,
            vec![backend(1, BackendScheme::Http, true)],
        )
        .await;

        let hc = checker(cp.clone(), store, Arc::new(MockHttpClient::answering(200)));
        hc.run_cycle().await;

        assert!(cp.health_writes.lock().unwrap().is_empty());
    }
}
