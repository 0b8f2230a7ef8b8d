//! Periodic configuration loader.
//!
//! Pulls domains, backends, IP rules, and rate limits from the control-plane
//! store on a fixed cadence, assembles immutable `DomainConfig` values, and
//! publishes them into the config store. The previous snapshot stays in
//! place when anything goes wrong: a store-wide query failure aborts the
//! whole cycle, a per-domain failure skips only that domain, and a malformed
//! row (bad address, unknown scheme) is dropped at row granularity.
use std::{collections::HashMap, sync::Arc, time::Duration};

use eyre::Result;

use crate::{
    adapters::acme::CertificateManager,
    core::{
        balancer::RrState,
        domain::{
            Backend, BackendScheme, DomainConfig, HealthState, IpRule, RateLimitPolicy, RuleKind,
            routing_key,
        },
        ip_filter::IpNetwork,
        store::ConfigStore,
    },
    ports::control_plane::{ControlPlane, DomainRecord},
    utils::graceful_shutdown::ShutdownToken,
};

/// Builds and publishes config snapshots from control-plane state.
pub struct ConfigLoader {
    control_plane: Arc<dyn ControlPlane>,
    store: Arc<ConfigStore>,
    interval: Duration,
}

impl ConfigLoader {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        store: Arc<ConfigStore>,
        interval: Duration,
    ) -> Self {
        Self {
            control_plane,
            store,
            interval,
        }
    }

    /// Reload loop. The caller is expected to have run one eager
    /// `reload_once` before traffic starts; this loop continues on the
    /// configured cadence until shutdown.
    pub async fn run(&self, certificates: Arc<CertificateManager>, mut shutdown: ShutdownToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reload_once().await {
                        Ok(ssl_keys) => certificates.ensure_managed(&ssl_keys),
                        Err(e) => {
                            tracing::error!(error = %e, "Configuration reload failed; keeping previous snapshot");
                        }
                    }
                }
                _ = shutdown.wait_for_shutdown() => {
                    tracing::info!("Configuration loader shutting down");
                    break;
                }
            }
        }
    }

    /// Run one reload cycle. Returns the routing keys of SSL-enabled
    /// domains in the published snapshot so certificate coverage can be
    /// requested for them.
    pub async fn reload_once(&self) -> Result<Vec<String>> {
        let records = self.control_plane.fetch_domains().await?;

        let mut snapshot: HashMap<String, Arc<DomainConfig>> = HashMap::new();
        let mut ssl_keys = Vec::new();
        let mut tcp_domains = 0usize;

        for record in records {
            let config = match self.build_domain(&record).await {
                Ok(config) => Arc::new(config),
                Err(e) => {
                    tracing::warn!(
                        domain = %record.name,
                        error = %e,
                        "Skipping domain this cycle; previous configuration stays in effect"
                    );
                    // Carry the prior generation forward so the publish
                    // below does not evict a domain that merely failed to
                    // rebuild.
                    let key = routing_key(&record.name, &record.target_url);
                    if let Some(previous) = self.store.get(&key) {
                        if previous.ssl_enabled {
                            ssl_keys.push(key.clone());
                        }
                        snapshot.insert(key, previous);
                    }
                    continue;
                }
            };

            if config
                .backends
                .iter()
                .any(|b| b.scheme == BackendScheme::Tcp)
            {
                tcp_domains += 1;
            }
            if config.ssl_enabled {
                ssl_keys.push(config.routing_key.clone());
            }

            if let Some(previous) = snapshot.insert(config.routing_key.clone(), config) {
                tracing::warn!(
                    routing_key = %previous.routing_key,
                    "Duplicate routing key; the most recently created domain wins"
                );
            }
        }

        if tcp_domains > 1 {
            // The L4 path routes by "first TCP-capable domain"; with more
            // than one such domain per port the winner is arbitrary.
            tracing::warn!(
                count = tcp_domains,
                "Multiple TCP-enabled domains configured; raw TCP routing assumes one per port"
            );
        }

        let count = snapshot.len();
        self.store.publish(snapshot).await;
        tracing::info!(domains = count, "Published configuration snapshot");

        Ok(ssl_keys)
    }

    async fn build_domain(&self, record: &DomainRecord) -> Result<DomainConfig> {
        let key = routing_key(&record.name, &record.target_url);

        let backend_rows = self.control_plane.fetch_backends(record.id).await?;
        let mut backends = Vec::with_capacity(backend_rows.len());
        for row in backend_rows {
            let Some(scheme) = BackendScheme::parse(&row.scheme) else {
                tracing::warn!(domain = %record.name, backend = row.id, scheme = %row.scheme,
                    "Unknown backend scheme; dropping row");
                continue;
            };
            let Ok(ip) = row.ip.parse() else {
                tracing::warn!(domain = %record.name, backend = row.id, ip = %row.ip,
                    "Unparseable backend address; dropping row");
                continue;
            };
            let Ok(port) = u16::try_from(row.port) else {
                tracing::warn!(domain = %record.name, backend = row.id, port = row.port,
                    "Backend port out of range; dropping row");
                continue;
            };
            if port == 0 {
                tracing::warn!(domain = %record.name, backend = row.id,
                    "Backend port is zero; dropping row");
                continue;
            }

            backends.push(Backend {
                id: row.id,
                scheme,
                ip,
                port,
                weight: u32::try_from(row.weight).unwrap_or(1).max(1),
                active: row.is_active,
                health: HealthState::parse(row.health_status.as_deref()),
            });
        }

        let rule_rows = self.control_plane.fetch_ip_rules(record.id).await?;
        let mut ip_rules = Vec::with_capacity(rule_rows.len());
        for row in rule_rows {
            let Some(kind) = RuleKind::parse(&row.rule_type) else {
                tracing::warn!(domain = %record.name, rule_type = %row.rule_type,
                    "Unknown IP rule type; dropping row");
                continue;
            };
            let cidr = match IpNetwork::parse(&row.ip_range) {
                Ok(cidr) => cidr,
                Err(e) => {
                    tracing::warn!(domain = %record.name, cidr = %row.ip_range, error = %e,
                        "Unparseable IP rule; dropping row");
                    continue;
                }
            };
            ip_rules.push(IpRule {
                cidr,
                kind,
                description: row.description.unwrap_or_default(),
            });
        }

        let rate_limit =
            self.control_plane
                .fetch_rate_limit(record.id)
                .await?
                .map(|row| RateLimitPolicy {
                    requests_per_second: u32::try_from(row.requests_per_second)
                        .unwrap_or(1)
                        .max(1),
                    burst_size: u32::try_from(row.burst_size).unwrap_or(0),
                    per_client: row.per_ip,
                });

        // Carry the round-robin cursor across reloads for a surviving key so
        // traffic does not reshuffle on every tick.
        let rr = match self.store.get(&key) {
            Some(previous) => Arc::new(RrState::carried_over(&previous.rr, &backends)),
            None => Arc::new(RrState::for_backends(&backends)),
        };

        Ok(DomainConfig {
            routing_key: key,
            display_name: record.name.clone(),
            ssl_enabled: record.ssl_enabled,
            health_check_enabled: record.health_check_enabled,
            health_check_interval: u32::try_from(record.health_check_interval).unwrap_or(30),
            backends,
            ip_rules,
            rate_limit,
            rr,
        })
    }
}
