//! In-flight session tracking for graceful draining.
//!
//! Every proxied HTTP request and TCP session holds a guard for its
//! lifetime. At shutdown the listeners stop accepting and the process waits
//! (bounded by the configured grace period) until the count reaches zero
//! before exiting.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::time::sleep;

/// Counts in-flight sessions across all listeners.
#[derive(Clone, Default)]
pub struct SessionTracker {
    active: Arc<AtomicU64>,
}

/// RAII guard for one in-flight session; dropping it ends the session.
pub struct SessionGuard {
    active: Arc<AtomicU64>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one session. Hold the guard for its full lifetime.
    pub fn begin(&self) -> SessionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            active: self.active.clone(),
        }
    }

    /// Number of sessions currently in flight.
    pub fn active_sessions(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Wait until all sessions finish or the timeout elapses. Returns true
    /// when fully drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut check_interval = Duration::from_millis(50);

        while start.elapsed() < timeout {
            let remaining = self.active_sessions();
            if remaining == 0 {
                tracing::info!("All sessions drained");
                return true;
            }

            tracing::debug!(
                remaining,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Waiting for sessions to drain"
            );
            sleep(check_interval).await;
            check_interval = std::cmp::min(check_interval * 2, Duration::from_secs(1));
        }

        tracing::warn!(
            remaining = self.active_sessions(),
            "Drain timeout exceeded; exiting with sessions in flight"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_lifecycle_tracks_count() {
        let tracker = SessionTracker::new();
        assert_eq!(tracker.active_sessions(), 0);

        let guard = tracker.begin();
        let other = tracker.begin();
        assert_eq!(tracker.active_sessions(), 2);

        drop(guard);
        assert_eq!(tracker.active_sessions(), 1);
        drop(other);
        assert_eq!(tracker.active_sessions(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_active_sessions() {
        let tracker = SessionTracker::new();
        let guard = tracker.begin();

        assert!(!tracker.wait_for_drain(Duration::from_millis(80)).await);

        drop(guard);
        assert!(tracker.wait_for_drain(Duration::from_millis(80)).await);
    }
}
