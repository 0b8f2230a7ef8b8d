pub mod balancer;
pub mod domain;
pub mod ip_filter;
pub mod metrics;
pub mod rate_limiter;
pub mod store;

pub use balancer::{SchemeFilter, select_backend};
pub use domain::{Backend, BackendScheme, DomainConfig, HealthState, IpRule, RateLimitPolicy};
pub use metrics::MetricsAggregator;
pub use rate_limiter::RateLimiterRegistry;
pub use store::ConfigStore;
