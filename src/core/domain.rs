//! Domain model for the routing plane.
//!
//! A `DomainConfig` is the unit of routing configuration: everything the
//! request pipeline needs to serve one tenant (backends, IP rules, rate
//! limit policy) bundled into a single immutable value keyed by its routing
//! key. The loader assembles these from control-plane rows; the pipeline
//! only ever reads whole values, so a reload can never expose a half-built
//! configuration.
use std::{net::IpAddr, sync::Arc};

use crate::core::{balancer::RrState, ip_filter::IpNetwork};

/// Upstream protocol spoken to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendScheme {
    Http,
    Https,
    Tcp,
}

impl BackendScheme {
    /// Parse the control-plane `scheme` column. Unknown values are rejected
    /// so a typo in the admin UI cannot silently downgrade HTTPS to HTTP.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Tcp => "tcp",
        }
    }

    /// Whether this backend can serve an HTTP-plane request.
    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }
}

/// Probe verdict for a backend, as last written by the health checker.
///
/// `Unknown` means the backend has never been probed (freshly added or the
/// checker has not completed a cycle yet). Selection treats it as healthy so
/// a new backend receives traffic before its first probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthState {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("healthy") => Self::Healthy,
            Some("unhealthy") => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    /// Fail-open policy: only a confirmed-unhealthy backend is excluded.
    pub fn selectable(&self) -> bool {
        !matches!(self, Self::Unhealthy)
    }
}

/// One upstream origin of a domain.
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: i64,
    pub scheme: BackendScheme,
    pub ip: IpAddr,
    pub port: u16,
    /// Relative share of traffic. The loader clamps this to >= 1.
    pub weight: u32,
    pub active: bool,
    pub health: HealthState,
}

impl Backend {
    /// Address string used for dialing (`ip:port`, v6 bracketed).
    pub fn addr(&self) -> String {
        match self.ip {
            IpAddr::V4(v4) => format!("{}:{}", v4, self.port),
            IpAddr::V6(v6) => format!("[{}]:{}", v6, self.port),
        }
    }

    /// Base URL for HTTP dispatch, e.g. `https://10.0.0.2:8443`.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.addr())
    }
}

/// Access rule kind. The first rule whose CIDR contains the client IP is
/// authoritative; a whitelist hit permits, a blacklist hit forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Whitelist,
    Blacklist,
}

impl RuleKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whitelist" => Some(Self::Whitelist),
            "blacklist" => Some(Self::Blacklist),
            _ => None,
        }
    }
}

/// Ordered IP access rule.
#[derive(Debug, Clone)]
pub struct IpRule {
    pub cidr: IpNetwork,
    pub kind: RuleKind,
    pub description: String,
}

/// Token-bucket parameters for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub requests_per_second: u32,
    pub burst_size: u32,
    /// Key the bucket by client IP instead of one bucket for the domain.
    pub per_client: bool,
}

/// Complete routing configuration for one domain.
pub struct DomainConfig {
    /// Host value this config is looked up by. Bare host for HTTP/S domains,
    /// administrative name for TCP-only domains.
    pub routing_key: String,
    pub display_name: String,
    pub ssl_enabled: bool,
    pub health_check_enabled: bool,
    /// Advisory per-domain interval (seconds). The health checker currently
    /// probes on a single global cadence.
    pub health_check_interval: u32,
    pub backends: Vec<Backend>,
    pub ip_rules: Vec<IpRule>,
    pub rate_limit: Option<RateLimitPolicy>,
    /// Round-robin state; the loader carries the cursor over from the
    /// previous generation of this config so it does not reset on every
    /// reload tick.
    pub rr: Arc<RrState>,
}

impl DomainConfig {
    /// True when at least one backend speaks raw TCP and is worth dialing.
    pub fn has_selectable_tcp_backend(&self) -> bool {
        self.backends
            .iter()
            .any(|b| b.scheme == BackendScheme::Tcp && b.active && b.health.selectable())
    }
}

impl std::fmt::Debug for DomainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainConfig")
            .field("routing_key", &self.routing_key)
            .field("display_name", &self.display_name)
            .field("ssl_enabled", &self.ssl_enabled)
            .field("backends", &self.backends.len())
            .field("ip_rules", &self.ip_rules.len())
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

/// Derive the routing key for a domain row.
///
/// TCP domains have no HTTP host to match, so the administrative name is
/// authoritative. HTTP/S domains are matched by the `Host` header the client
/// sends, so the key is the bare host of the target URL with any scheme and
/// port stripped.
pub fn routing_key(name: &str, target_url: &str) -> String {
    if target_url.starts_with("tcp://") {
        return name.to_string();
    }

    if let Ok(parsed) = url::Url::parse(target_url)
        && let Some(host) = parsed.host_str()
    {
        return host.to_string();
    }

    // Not an absolute URL; treat the value as `host[:port]`.
    let stripped = target_url
        .strip_prefix("https://")
        .or_else(|| target_url.strip_prefix("http://"))
        .unwrap_or(target_url);
    let host = stripped.split('/').next().unwrap_or(stripped);
    match host.rsplit_once(':') {
        // Keep the colon when it is part of a bare IPv6 address.
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !h.is_empty() => h.to_string(),
        _ => host.to_string(),
    }
}

/// Strip an optional `:port` suffix from a `Host` header value.
pub fn strip_host_port(host: &str) -> &str {
    if host.starts_with('[') {
        // Bracketed IPv6 literal, possibly with a port after the bracket.
        return host.split_once(']').map_or(host, |(h, _)| &host[1..h.len()]);
    }
    match host.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}
