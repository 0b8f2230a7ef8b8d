pub mod acme;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;
pub mod loader;
pub mod metrics_flusher;
pub mod postgres;
pub mod tcp_proxy;

/// Re-export commonly used types from adapters
pub use acme::CertificateManager;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_handler::{ListenerKind, ProxyHandler};
pub use loader::ConfigLoader;
pub use metrics_flusher::MetricsFlusher;
pub use postgres::PgControlPlane;
pub use tcp_proxy::TcpProxy;
