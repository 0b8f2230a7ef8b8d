use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

const PROBE_USER_AGENT: &str = "ProxyEngine-HealthCheck";

/// Upstream HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
///
/// One shared client dispatches to every backend. Transport tuning:
/// * 30 s connect timeout, 30 s TCP keep-alive
/// * connection pool of up to 100 idle connections, 90 s idle timeout
/// * ALPN negotiates h2 when the backend offers it
///
/// The adapter never retries: a dial or transfer failure surfaces to the
/// pipeline, which answers 502 and records the error.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a new upstream client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(Duration::from_secs(30)));
        http_connector.set_keepalive(Some(Duration::from_secs(30)));

        // Backends with HTTPS schemes present certificates signed by
        // whatever the host trusts.
        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        // ALPN advertises h2 and http/1.1; the backend picks.
        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(100)
            .build::<_, AxumBody>(https_connector);

        tracing::info!("Created upstream HTTP client (HTTP/1.1 + HTTP/2 via ALPN)");
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        let client = self.client.clone();

        let backend_identifier = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let request_method = req.method().to_string();

        let span = tracing::info_span!(
            "backend_request",
            backend.url = %backend_identifier,
            http.method = %request_method,
            http.status_code = tracing::field::Empty,
        );
        let _enter = span.enter();

        let (mut parts, body) = req.into_parts();
        // Advertise 1.1; ALPN upgrades to h2 on the wire when negotiated.
        parts.version = Version::HTTP_11;
        let outgoing_request = Request::from_parts(parts, body);

        let method_for_error_log = outgoing_request.method().clone();
        let uri_for_error_log = outgoing_request.uri().clone();

        match client.request(outgoing_request).await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                tracing::Span::current().record("http.status_code", status_code);

                let (mut parts, hyper_body) = response.into_parts();

                // The body is re-framed on the way out; stale hop-by-hop
                // framing headers would desynchronize the client.
                parts.headers.remove(header::TRANSFER_ENCODING);

                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::error!(
                    "Error making request to backend {} ({} {}): {}",
                    backend_identifier,
                    method_for_error_log,
                    uri_for_error_log,
                    e
                );

                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method_for_error_log} {uri_for_error_log} failed: {e}"
                )))
            }
        }
    }

    async fn probe(&self, url: &str, timeout_secs: u64) -> HttpClientResult<u16> {
        let client = self.client.clone();

        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .header(header::USER_AGENT, HeaderValue::from_static(PROBE_USER_AGENT))
            .header(header::CONNECTION, HeaderValue::from_static("close"))
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        tracing::debug!("Probing URL: {}", url);
        let timeout_duration = Duration::from_secs(timeout_secs);

        match timeout(timeout_duration, client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                tracing::debug!("Probe for {} answered {}", url, status);
                Ok(status)
            }
            Ok(Err(err)) => {
                tracing::debug!("Probe error for {}: {}", url, err);
                Err(HttpClientError::ConnectionError(err.to_string()))
            }
            Err(_) => {
                tracing::debug!("Probe timeout for {}", url);
                Err(HttpClientError::Timeout(timeout_secs))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        let client = HttpClientAdapter::new();
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn probe_unreachable_backend_is_an_error() {
        let client = HttpClientAdapter::new().unwrap();
        // TEST-NET-1 is guaranteed unroutable; the dial fails or times out.
        let result = client.probe("http://192.0.2.1:9/", 1).await;
        assert!(result.is_err());
    }
}
