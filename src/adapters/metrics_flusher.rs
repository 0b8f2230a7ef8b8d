//! Periodic metrics flush to the control-plane store.
//!
//! Drains the in-memory aggregator on a fixed cadence, reduces each
//! domain's window to avg/p95/p99 summaries, resolves routing keys back to
//! domain rows, and appends one row per traffic kind. A routing key that no
//! longer resolves (domain deleted or its target renamed between windows)
//! is skipped silently; windows are short enough that the loss is
//! acceptable.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use eyre::Result;

use crate::{
    core::{
        domain::routing_key,
        metrics::{DomainBuffers, MetricsAggregator, summarize},
    },
    ports::control_plane::{ControlPlane, RequestMetricsRow, TcpMetricsRow},
    utils::graceful_shutdown::ShutdownToken,
};

/// Flush loop for the metrics aggregator.
pub struct MetricsFlusher {
    control_plane: Arc<dyn ControlPlane>,
    metrics: Arc<MetricsAggregator>,
    interval: Duration,
}

impl MetricsFlusher {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        metrics: Arc<MetricsAggregator>,
        interval: Duration,
    ) -> Self {
        Self {
            control_plane,
            metrics,
            interval,
        }
    }

    /// Run the flush loop until shutdown, with one final flush on the way
    /// out so a short-lived process still reports its traffic.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_once().await {
                        tracing::warn!(error = %e, "Metrics flush failed; window dropped");
                    }
                }
                _ = shutdown.wait_for_shutdown() => {
                    tracing::info!("Metrics flusher shutting down");
                    if let Err(e) = self.flush_once().await {
                        tracing::warn!(error = %e, "Final metrics flush failed");
                    }
                    break;
                }
            }
        }
    }

    /// Flush one window. Buffers are taken first so recording never blocks
    /// on the store; a store failure loses at most this window.
    pub async fn flush_once(&self) -> Result<()> {
        let drained = self.metrics.drain().await;
        if drained.is_empty() {
            return Ok(());
        }

        // Resolve routing keys against the current domain rows using the
        // same derivation the loader applies.
        let domains = self.control_plane.fetch_domains().await?;
        let ids_by_key: std::collections::HashMap<String, i64> = domains
            .iter()
            .map(|d| (routing_key(&d.name, &d.target_url), d.id))
            .collect();

        let window_end = Utc::now();
        for (key, buffers) in drained {
            let Some(&domain_id) = ids_by_key.get(&key) else {
                tracing::debug!(routing_key = %key, "No domain row for metrics window; skipping");
                continue;
            };

            if let Err(e) = self.write_rows(domain_id, &buffers, window_end).await {
                tracing::warn!(routing_key = %key, error = %e, "Failed to append metrics rows");
            }
        }

        Ok(())
    }

    async fn write_rows(
        &self,
        domain_id: i64,
        buffers: &DomainBuffers,
        window_end: chrono::DateTime<Utc>,
    ) -> Result<()> {
        if buffers.http_count > 0 || buffers.error_count > 0 {
            let summary = summarize(&buffers.http_latency_ms);
            self.control_plane
                .append_request_metrics(RequestMetricsRow {
                    domain_id,
                    request_count: buffers.http_count as i64,
                    error_count: buffers.error_count as i64,
                    avg_response_time_ms: summary.map(|s| s.avg_ms).unwrap_or(0.0),
                    p95_response_time_ms: summary.map(|s| s.p95_ms as i64).unwrap_or(0),
                    p99_response_time_ms: summary.map(|s| s.p99_ms as i64).unwrap_or(0),
                    window_end,
                })
                .await?;
        }

        if buffers.tcp_count > 0 {
            let summary = summarize(&buffers.tcp_latency_ms);
            self.control_plane
                .append_tcp_metrics(TcpMetricsRow {
                    domain_id,
                    connection_count: buffers.tcp_count as i64,
                    avg_session_time_ms: summary.map(|s| s.avg_ms).unwrap_or(0.0),
                    p95_session_time_ms: summary.map(|s| s.p95_ms as i64).unwrap_or(0),
                    p99_session_time_ms: summary.map(|s| s.p99_ms as i64).unwrap_or(0),
                    window_end,
                })
                .await?;
        }

        Ok(())
    }
}
