//! HTTP/HTTPS request pipeline.
//!
//! Owns the full request flow for both web listeners: ACME challenge
//! interception (plain listener only), domain lookup by `Host`, the
//! HTTP-to-HTTPS redirect, IP access rules, token-bucket rate limiting,
//! weighted backend selection, and upstream dispatch. Every response for a
//! matched domain produces exactly one metrics record.
//!
//! The handler reads the config store only; it never talks to the
//! control-plane store. All policy failures surface as plain status
//! responses (403 / 404 / 429 / 502 / 503), never as errors across the
//! listener boundary.
use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    body::Body as AxumBody,
    http::{HeaderValue, StatusCode, header},
};
use hyper::{Request, Response};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    adapters::acme::CertificateManager,
    core::{
        balancer::{SchemeFilter, select_backend},
        domain::strip_host_port,
        ip_filter::{self, Access},
        metrics::MetricsAggregator,
        rate_limiter::RateLimiterRegistry,
        store::ConfigStore,
    },
    ports::http_client::HttpClient,
    tracing_setup,
};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Which listener a request arrived on. Drives the ACME challenge check and
/// the HTTPS redirect, both of which only apply to the plain listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Https,
}

/// Primary façade handling inbound requests on both web listeners.
pub struct ProxyHandler {
    store: Arc<ConfigStore>,
    limiters: Arc<RateLimiterRegistry>,
    metrics: Arc<MetricsAggregator>,
    certificates: Arc<CertificateManager>,
    http_client: Arc<dyn HttpClient>,
}

impl ProxyHandler {
    pub fn new(
        store: Arc<ConfigStore>,
        limiters: Arc<RateLimiterRegistry>,
        metrics: Arc<MetricsAggregator>,
        certificates: Arc<CertificateManager>,
        http_client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            store,
            limiters,
            metrics,
            certificates,
            http_client,
        }
    }

    /// Entry point for both listeners. Always produces a response.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: SocketAddr,
        listener: ListenerKind,
    ) -> Response<AxumBody> {
        let start_time = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = Uuid::new_v4().to_string();
        let client_ip = client_addr.ip();

        let span = tracing_setup::create_request_span(
            method.as_str(),
            &path,
            &request_id,
            &client_ip.to_string(),
        );

        async {
            let (routing_key, response) = self.route_request(req, client_addr, listener).await;

            let duration = start_time.elapsed();
            let status = response.status();
            tracing::Span::current().record("http.status_code", status.as_u16());
            tracing::Span::current().record("duration_ms", duration.as_millis() as u64);
            tracing::info!(
                status = status.as_u16(),
                duration_ms = duration.as_millis(),
                "request completed"
            );

            match routing_key {
                Outcome::Routed(key) => {
                    self.metrics
                        .record_http(&key, status.as_u16(), duration)
                        .await;
                }
                Outcome::UpstreamFailed(key) => {
                    self.metrics.record_error(&key).await;
                }
                Outcome::Unrouted => {}
            }

            response
        }
        .instrument(span)
        .await
    }

    async fn route_request(
        &self,
        req: Request<AxumBody>,
        client_addr: SocketAddr,
        listener: ListenerKind,
    ) -> (Outcome, Response<AxumBody>) {
        // ACME challenges are served before any routing; the requested name
        // may not even be published yet when the first order runs.
        if listener == ListenerKind::Http && req.uri().path().starts_with(ACME_CHALLENGE_PREFIX) {
            let response = match self.certificates.serve_challenge(req).await {
                Some(response) => response,
                None => status_response(StatusCode::NOT_FOUND, "Unknown challenge"),
            };
            return (Outcome::Unrouted, response);
        }

        // Host header for HTTP/1.1, :authority for HTTP/2.
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string));

        let Some(raw_host) = host else {
            return (
                Outcome::Unrouted,
                status_response(StatusCode::NOT_FOUND, "Missing host"),
            );
        };
        let lookup_host = strip_host_port(&raw_host).to_string();

        let Some(config) = self.store.get(&lookup_host) else {
            tracing::info!(host = %lookup_host, "no domain for host");
            return (
                Outcome::Unrouted,
                status_response(StatusCode::NOT_FOUND, "Unknown host"),
            );
        };
        tracing::Span::current().record("domain", &config.routing_key);
        let key = config.routing_key.clone();

        if listener == ListenerKind::Http && config.ssl_enabled {
            return (Outcome::Routed(key), redirect_to_https(&raw_host, &req));
        }

        let client_ip = client_addr.ip();
        if ip_filter::evaluate(&config.ip_rules, client_ip) == Access::Deny {
            tracing::info!(client = %client_ip, "client denied by IP rules");
            return (
                Outcome::Routed(key),
                status_response(StatusCode::FORBIDDEN, "Forbidden"),
            );
        }

        if let Some(policy) = &config.rate_limit
            && !self.limiters.check(&key, client_ip, policy).await
        {
            return (
                Outcome::Routed(key),
                status_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"),
            );
        }

        let Some(backend) = select_backend(&config, SchemeFilter::HttpPlane) else {
            tracing::warn!(domain = %key, "no healthy backend available");
            return (
                Outcome::Routed(key),
                status_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"),
            );
        };
        tracing::Span::current().record("backend.url", backend.origin());

        let upstream_req = match build_upstream_request(req, &backend.origin(), &raw_host, client_addr)
        {
            Ok(upstream_req) => upstream_req,
            Err(e) => {
                tracing::error!(error = %e, "failed to build upstream request");
                return (
                    Outcome::UpstreamFailed(key),
                    status_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
                );
            }
        };

        match self.http_client.send_request(upstream_req).await {
            Ok(response) => (Outcome::Routed(key), response),
            Err(e) => {
                tracing::error!(domain = %key, backend = %backend.origin(), error = %e,
                    "upstream request failed");
                (
                    Outcome::UpstreamFailed(key),
                    status_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
                )
            }
        }
    }
}

/// How a request left the pipeline, for metrics accounting.
enum Outcome {
    /// Matched a domain and got a response (from upstream or originated
    /// here); records status and latency.
    Routed(String),
    /// Matched a domain but the upstream transport failed; records an error.
    UpstreamFailed(String),
    /// Never matched a domain; nothing to record against.
    Unrouted,
}

fn status_response(status: StatusCode, message: &'static str) -> Response<AxumBody> {
    Response::builder()
        .status(status)
        .body(AxumBody::from(message))
        .unwrap_or_else(|_| Response::new(AxumBody::from(message)))
}

/// 307 preserving method, path, and query on the https scheme.
fn redirect_to_https(raw_host: &str, req: &Request<AxumBody>) -> Response<AxumBody> {
    let host = strip_host_port(raw_host);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{host}{path_and_query}");

    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(header::LOCATION, location)
        .body(AxumBody::empty())
        .unwrap_or_else(|_| Response::new(AxumBody::empty()))
}

/// Rebuild the request for the chosen backend: same method, path, query,
/// and body; `Host` pinned to the client-visible host; `X-Real-IP` carrying
/// the best client-address source we have.
fn build_upstream_request(
    req: Request<AxumBody>,
    origin: &str,
    raw_host: &str,
    client_addr: SocketAddr,
) -> Result<Request<AxumBody>, http::Error> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: http::Uri = format!("{origin}{path_and_query}").parse()?;
    parts.uri = uri;

    if let Ok(host_value) = HeaderValue::from_str(raw_host) {
        parts.headers.insert(header::HOST, host_value);
    }

    // A client behind another proxy arrives with X-Forwarded-For; surface
    // that chain to the backend, otherwise the peer address.
    let real_ip = parts
        .headers
        .get(X_FORWARDED_FOR)
        .cloned()
        .unwrap_or_else(|| {
            HeaderValue::from_str(&client_addr.ip().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
        });
    parts.headers.insert(X_REAL_IP, real_ip);

    Ok(Request::from_parts(parts, body))
}
