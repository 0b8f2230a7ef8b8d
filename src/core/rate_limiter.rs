//! Token-bucket rate limiting built atop `governor`.
//!
//! Limiters live in a process-wide registry keyed by routing key (and client
//! IP when the policy is per-client), deliberately outside the domain config
//! values: a loader tick must not reset bucket state, otherwise clients
//! could bypass limits by timing requests across reloads. Entries are
//! created lazily with load-or-store semantics so two concurrent requests
//! for the same key observe the same bucket. A stale entry for a deleted
//! domain is harmless.
use std::{net::IpAddr, num::NonZeroU32, sync::Arc};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use scc::HashMap as ConcurrentMap;

use crate::core::domain::RateLimitPolicy;

type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Registry key: one bucket per domain, or per (domain, client).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LimiterKey {
    Domain(String),
    Client(String, IpAddr),
}

struct LimiterEntry {
    /// Policy the bucket was built from; a policy change on reload replaces
    /// the bucket on next use instead of silently keeping stale parameters.
    policy: RateLimitPolicy,
    limiter: DirectRateLimiterImpl,
}

impl LimiterEntry {
    fn new(policy: RateLimitPolicy) -> Self {
        let rate =
            NonZeroU32::new(policy.requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(policy.burst_size.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            policy,
            limiter: RateLimiter::direct(quota),
        }
    }
}

/// Process-wide registry of token buckets.
#[derive(Default)]
pub struct RateLimiterRegistry {
    entries: ConcurrentMap<LimiterKey, Arc<LimiterEntry>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject one request for `routing_key` under `policy`.
    ///
    /// Returns `true` when a token was available. Looks up or creates the
    /// bucket for the effective key; the per-config policy decides whether
    /// the bucket is shared across clients or keyed by `client_ip`.
    pub async fn check(
        &self,
        routing_key: &str,
        client_ip: IpAddr,
        policy: &RateLimitPolicy,
    ) -> bool {
        let key = if policy.per_client {
            LimiterKey::Client(routing_key.to_string(), client_ip)
        } else {
            LimiterKey::Domain(routing_key.to_string())
        };

        let entry = match self.entries.entry_async(key).await {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                if occupied.get().policy != *policy {
                    *occupied.get_mut() = Arc::new(LimiterEntry::new(*policy));
                }
                Arc::clone(occupied.get())
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                let entry = Arc::new(LimiterEntry::new(*policy));
                vacant.insert_entry(Arc::clone(&entry));
                entry
            }
        };

        entry.limiter.check().is_ok()
    }

    /// Number of live buckets (diagnostics).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
