//! In-memory snapshot of all domain configurations.
//!
//! One writer (the loader) publishes whole `Arc<DomainConfig>` values keyed
//! by routing key; many readers (the request pipeline) do single keyed
//! lookups. A reader observes either the previous or the new value for a
//! key, never a partially built one.
use std::{collections::HashMap, sync::Arc};

use scc::HashMap as ConcurrentMap;

use crate::core::domain::DomainConfig;

/// Concurrent routing table: `routing_key -> DomainConfig`.
#[derive(Default)]
pub struct ConfigStore {
    entries: ConcurrentMap<String, Arc<DomainConfig>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hot-path lookup. Lock-free read of the current value for a key.
    pub fn get(&self, routing_key: &str) -> Option<Arc<DomainConfig>> {
        self.entries
            .read_sync(routing_key, |_, config| Arc::clone(config))
    }

    /// Publish a new snapshot: upsert every entry, then drop keys that are
    /// absent from the new set. Only the loader calls this.
    pub async fn publish(&self, snapshot: HashMap<String, Arc<DomainConfig>>) {
        for (key, config) in &snapshot {
            match self.entries.entry_async(key.clone()).await {
                scc::hash_map::Entry::Occupied(mut occupied) => {
                    *occupied.get_mut() = Arc::clone(config);
                }
                scc::hash_map::Entry::Vacant(vacant) => {
                    vacant.insert_entry(Arc::clone(config));
                }
            }
        }

        self.entries
            .retain_async(|key, _| snapshot.contains_key(key))
            .await;
    }

    /// First domain with a dialable raw-TCP backend, if any. The L4 path
    /// carries no host indicator, so the deployment assumption is a single
    /// TCP-enabled domain per port.
    pub fn first_tcp_domain(&self) -> Option<Arc<DomainConfig>> {
        let mut found = None;
        self.entries.iter_sync(|_, config| {
            if found.is_none() && config.has_selectable_tcp_backend() {
                found = Some(Arc::clone(config));
            }
            true
        });
        found
    }

    /// Number of published domains.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visit every published config (diagnostics and startup logging).
    pub fn scan<F: FnMut(&str, &Arc<DomainConfig>)>(&self, mut f: F) {
        self.entries.iter_sync(|key, config| {
            f(key, config);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        balancer::RrState,
        domain::{Backend, BackendScheme, HealthState},
    };

    fn config(routing_key: &str, backends: Vec<Backend>) -> Arc<DomainConfig> {
        let rr = Arc::new(RrState::for_backends(&backends));
        Arc::new(DomainConfig {
            routing_key: routing_key.into(),
            display_name: routing_key.into(),
            ssl_enabled: false,
            health_check_enabled: false,
            health_check_interval: 30,
            backends,
            ip_rules: Vec::new(),
            rate_limit: None,
            rr,
        })
    }

    fn tcp_backend() -> Backend {
        Backend {
            id: 1,
            scheme: BackendScheme::Tcp,
            ip: "10.0.0.5".parse().unwrap(),
            port: 25565,
            weight: 1,
            active: true,
            health: HealthState::Healthy,
        }
    }

    #[tokio::test]
    async fn publish_is_visible_to_get() {
        let store = ConfigStore::new();
        let mut snapshot = HashMap::new();
        snapshot.insert("a.example".to_string(), config("a.example", Vec::new()));
        store.publish(snapshot).await;

        assert!(store.get("a.example").is_some());
        assert!(store.get("b.example").is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn removed_key_returns_absent() {
        let store = ConfigStore::new();

        let mut first = HashMap::new();
        first.insert("a.example".to_string(), config("a.example", Vec::new()));
        first.insert("b.example".to_string(), config("b.example", Vec::new()));
        store.publish(first).await;

        let mut second = HashMap::new();
        second.insert("a.example".to_string(), config("a.example", Vec::new()));
        store.publish(second).await;

        assert!(store.get("a.example").is_some());
        assert!(store.get("b.example").is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn publish_replaces_existing_value() {
        let store = ConfigStore::new();

        let mut first = HashMap::new();
        first.insert("a.example".to_string(), config("a.example", Vec::new()));
        store.publish(first).await;

        let mut second = HashMap::new();
        second.insert(
            "a.example".to_string(),
            config("a.example", vec![tcp_backend()]),
        );
        store.publish(second).await;

        let current = store.get("a.example").expect("present");
        assert_eq!(current.backends.len(), 1);
    }

    #[tokio::test]
    async fn first_tcp_domain_skips_http_only_domains() {
        let store = ConfigStore::new();
        let mut snapshot = HashMap::new();
        snapshot.insert("web.example".to_string(), config("web.example", Vec::new()));
        snapshot.insert(
            "mc.example".to_string(),
            config("mc.example", vec![tcp_backend()]),
        );
        store.publish(snapshot).await;

        let found = store.first_tcp_domain().expect("tcp domain");
        assert_eq!(found.routing_key, "mc.example");
    }

    #[tokio::test]
    async fn first_tcp_domain_ignores_unhealthy_backends() {
        let store = ConfigStore::new();
        let mut backend = tcp_backend();
        backend.health = HealthState::Unhealthy;
        let mut snapshot = HashMap::new();
        snapshot.insert(
            "mc.example".to_string(),
            config("mc.example", vec![backend]),
        );
        store.publish(snapshot).await;

        assert!(store.first_tcp_domain().is_none());
    }
}
