//! Port for the authoritative control-plane store.
//!
//! The data plane never talks to the store on the request path; only the
//! loader, the health checker, and the metrics flusher go through this
//! trait. Records mirror the consumed columns, not whole admin-side rows.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Error type for control-plane operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ControlPlaneError {
    /// A query failed (connection loss, timeout, malformed row).
    #[error("control-plane query failed: {0}")]
    Query(String),

    /// The store is unreachable.
    #[error("control-plane unavailable: {0}")]
    Unavailable(String),
}

pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

/// Projection of a `domains` row.
#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub id: i64,
    pub name: String,
    pub target_url: String,
    pub ssl_enabled: bool,
    pub health_check_enabled: bool,
    pub health_check_interval: i32,
}

/// Projection of a `backend_servers` row.
#[derive(Debug, Clone)]
pub struct BackendRecord {
    pub id: i64,
    pub scheme: String,
    pub ip: String,
    pub port: i32,
    pub weight: i32,
    pub is_active: bool,
    pub health_status: Option<String>,
}

/// Projection of an `ip_rules` row, in administrator-defined order.
#[derive(Debug, Clone)]
pub struct IpRuleRecord {
    pub ip_range: String,
    pub rule_type: String,
    pub description: Option<String>,
}

/// Projection of a `rate_limits` row.
#[derive(Debug, Clone)]
pub struct RateLimitRecord {
    pub requests_per_second: i32,
    pub burst_size: i32,
    pub per_ip: bool,
}

/// One flushed window of HTTP traffic for a domain.
#[derive(Debug, Clone)]
pub struct RequestMetricsRow {
    pub domain_id: i64,
    pub request_count: i64,
    pub error_count: i64,
    pub avg_response_time_ms: f64,
    pub p95_response_time_ms: i64,
    pub p99_response_time_ms: i64,
    pub window_end: DateTime<Utc>,
}

/// One flushed window of TCP traffic for a domain.
#[derive(Debug, Clone)]
pub struct TcpMetricsRow {
    pub domain_id: i64,
    pub connection_count: i64,
    pub avg_session_time_ms: f64,
    pub p95_session_time_ms: i64,
    pub p99_session_time_ms: i64,
    pub window_end: DateTime<Utc>,
}

/// ControlPlane defines the port for reading routing configuration and
/// writing health / metrics results back.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// List all configured domains.
    async fn fetch_domains(&self) -> ControlPlaneResult<Vec<DomainRecord>>;

    /// List the backends of one domain.
    async fn fetch_backends(&self, domain_id: i64) -> ControlPlaneResult<Vec<BackendRecord>>;

    /// List the IP rules of one domain, in evaluation order.
    async fn fetch_ip_rules(&self, domain_id: i64) -> ControlPlaneResult<Vec<IpRuleRecord>>;

    /// The effective rate limit of one domain. When an administrator created
    /// several rows, the most recently created wins.
    async fn fetch_rate_limit(&self, domain_id: i64)
    -> ControlPlaneResult<Option<RateLimitRecord>>;

    /// Record a probe verdict for a backend.
    async fn update_backend_health(
        &self,
        backend_id: i64,
        status: &str,
        checked_at: DateTime<Utc>,
    ) -> ControlPlaneResult<()>;

    /// Append one windowed HTTP metrics row.
    async fn append_request_metrics(&self, row: RequestMetricsRow) -> ControlPlaneResult<()>;

    /// Append one windowed TCP metrics row.
    async fn append_tcp_metrics(&self, row: TcpMetricsRow) -> ControlPlaneResult<()>;
}
