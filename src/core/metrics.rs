//! Per-domain traffic counters and latency buffers.
//!
//! The request pipeline records one entry per finished request or TCP
//! session; a flush task periodically drains the buffers, reduces them to
//! windowed summaries (avg/p95/p99) and hands the rows to the control-plane
//! store. Recording must stay cheap: buffers live in a concurrent map and
//! each record touches only its own domain's entry, so a flush in progress
//! never blocks the pipeline. A record landing during a flush goes into the
//! current window or the next; both are acceptable.
use std::time::Duration;

use scc::HashMap as ConcurrentMap;

/// Counters and latency samples for one domain within the current window.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DomainBuffers {
    pub http_count: u64,
    pub error_count: u64,
    pub tcp_count: u64,
    pub http_latency_ms: Vec<u64>,
    pub tcp_latency_ms: Vec<u64>,
}

impl DomainBuffers {
    pub fn has_activity(&self) -> bool {
        self.http_count > 0 || self.error_count > 0 || self.tcp_count > 0
    }
}

/// Windowed latency summary, produced at flush time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub avg_ms: f64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// Reduce raw samples to avg/p95/p99. Percentile indices are
/// `floor(q * n)` over the sorted samples, clamped to the last element.
pub fn summarize(samples: &[u64]) -> Option<LatencySummary> {
    if samples.is_empty() {
        return None;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();

    let n = sorted.len();
    let idx = |q: f64| ((q * n as f64) as usize).min(n - 1);
    let sum: u64 = sorted.iter().sum();

    Some(LatencySummary {
        avg_ms: sum as f64 / n as f64,
        p95_ms: sorted[idx(0.95)],
        p99_ms: sorted[idx(0.99)],
    })
}

/// Process-wide metrics aggregator.
#[derive(Default)]
pub struct MetricsAggregator {
    buffers: ConcurrentMap<String, DomainBuffers>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished HTTP request. A status of 400 or above also counts
    /// as an error.
    pub async fn record_http(&self, routing_key: &str, status: u16, elapsed: Duration) {
        self.update(routing_key, |b| {
            b.http_count += 1;
            if status >= 400 {
                b.error_count += 1;
            }
            b.http_latency_ms.push(elapsed.as_millis() as u64);
        })
        .await;
    }

    /// Record an upstream failure that produced no backend response.
    pub async fn record_error(&self, routing_key: &str) {
        self.update(routing_key, |b| b.error_count += 1).await;
    }

    /// Record a finished TCP session.
    pub async fn record_tcp(&self, routing_key: &str, elapsed: Duration) {
        self.update(routing_key, |b| {
            b.tcp_count += 1;
            b.tcp_latency_ms.push(elapsed.as_millis() as u64);
        })
        .await;
    }

    async fn update<F: FnOnce(&mut DomainBuffers)>(&self, routing_key: &str, f: F) {
        match self.buffers.entry_async(routing_key.to_string()).await {
            scc::hash_map::Entry::Occupied(mut occupied) => f(occupied.get_mut()),
            scc::hash_map::Entry::Vacant(vacant) => {
                let mut buffers = DomainBuffers::default();
                f(&mut buffers);
                vacant.insert_entry(buffers);
            }
        }
    }

    /// Take all buffers with activity, leaving zeroed entries behind. Each
    /// entry's lock is held only for the swap.
    pub async fn drain(&self) -> Vec<(String, DomainBuffers)> {
        let mut drained = Vec::new();
        self.buffers
            .retain_async(|key, buffers| {
                if buffers.has_activity() {
                    drained.push((key.clone(), std::mem::take(buffers)));
                }
                true
            })
            .await;
        drained
    }
}
