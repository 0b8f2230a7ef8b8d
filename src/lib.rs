//! proxy-engine - A multi-tenant L7/L4 reverse proxy and load balancer.
//!
//! The engine accepts HTTP (port 80), HTTPS (port 443), and raw TCP traffic
//! on configured protocol ports, routes each connection by the requested
//! domain to one of several backends, enforces per-domain access and rate
//! policies, terminates TLS with automatically obtained certificates, and
//! continuously reloads its routing configuration from an authoritative
//! control-plane database.
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) and keeps the pure routing logic inside `core`:
//! * `core` — domain model, config snapshot store, weighted round-robin
//!   selection, IP rules, token-bucket limiters, metrics buffers. No I/O.
//! * `ports` — `ControlPlane` (the configuration database) and `HttpClient`
//!   (upstream dispatch and probing).
//! * `adapters` — PostgreSQL control plane, hyper upstream client, the
//!   reload / health-check / metrics-flush loops, the ACME certificate
//!   manager, and the HTTP and TCP request pipelines.
//! * `server` — listener wiring for the three listener families.
//!
//! The request path reads only the in-memory snapshot; the control-plane
//! store is consulted exclusively by the timer-driven background loops.
//!
//! # Error Handling
//! All fallible APIs return `eyre::Result<T>` or a domain specific error
//! type. Policy failures on the request path surface as status codes, never
//! as errors across the listener boundary.
//!
//! # Concurrency & Data Structures
//! For shared mutable maps the project uses `scc::HashMap` to maintain
//! predictable performance characteristics under contention; the only
//! per-request lock is the round-robin cursor of the matched domain.
pub mod config;
pub mod ports;
pub mod server;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{
        CertificateManager, ConfigLoader, HealthChecker, HttpClientAdapter, ListenerKind,
        MetricsFlusher, PgControlPlane, ProxyHandler, TcpProxy,
    },
    core::{ConfigStore, MetricsAggregator, RateLimiterRegistry},
    ports::{ControlPlane, HttpClient},
    utils::{GracefulShutdown, SessionTracker},
};
