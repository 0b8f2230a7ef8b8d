//! Weighted round-robin backend selection.
//!
//! Each `DomainConfig` carries an `RrState`: an expanded ring in which every
//! backend index appears `weight` times, plus a cursor guarded by a mutex.
//! Over any window of `sum(weights)` selections against a fully healthy set,
//! each backend is chosen exactly `weight` times. The ring is precomputed at
//! load time so the hot path does no per-request weight arithmetic.
//!
//! The cursor is the only mutable field on the request path; the loader
//! carries the same `RrState` across reloads for a surviving routing key so
//! traffic does not reshuffle on every tick.
use std::sync::Mutex;

use crate::core::domain::{Backend, BackendScheme, DomainConfig};

/// Scheme filter applied during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeFilter {
    /// HTTP plane: http and https backends qualify.
    HttpPlane,
    /// L4 plane: only raw TCP backends qualify.
    TcpOnly,
}

impl SchemeFilter {
    fn admits(&self, scheme: BackendScheme) -> bool {
        match self {
            Self::HttpPlane => scheme.is_http(),
            Self::TcpOnly => scheme == BackendScheme::Tcp,
        }
    }
}

/// Round-robin state shared between generations of a domain config.
pub struct RrState {
    /// Backend indices, each repeated `weight` times.
    ring: Vec<usize>,
    cursor: Mutex<u64>,
}

impl RrState {
    /// Build the expanded ring for a backend list. Weights are assumed to be
    /// clamped to >= 1 by the loader; a zero weight is treated as 1 here as
    /// a second line of defense.
    pub fn for_backends(backends: &[Backend]) -> Self {
        let mut ring = Vec::new();
        for (idx, backend) in backends.iter().enumerate() {
            for _ in 0..backend.weight.max(1) {
                ring.push(idx);
            }
        }
        Self {
            ring,
            cursor: Mutex::new(0),
        }
    }

    /// Reuse the previous generation's cursor with a ring rebuilt for the
    /// new backend list.
    pub fn carried_over(previous: &RrState, backends: &[Backend]) -> Self {
        let cursor = previous.cursor.lock().map(|c| *c).unwrap_or(0);
        let mut state = Self::for_backends(backends);
        state.cursor = Mutex::new(cursor);
        state
    }

    #[cfg(test)]
    pub fn cursor_value(&self) -> u64 {
        *self.cursor.lock().expect("cursor lock")
    }
}

/// Select the next backend of `config` that is active, not confirmed
/// unhealthy, and admitted by `filter`.
///
/// Advances the cursor under the per-config lock and inspects at most one
/// full ring revolution before giving up, so a domain whose backends are all
/// down answers quickly instead of spinning.
pub fn select_backend(config: &DomainConfig, filter: SchemeFilter) -> Option<Backend> {
    let ring = &config.rr.ring;
    if ring.is_empty() {
        return None;
    }

    let mut cursor = config.rr.cursor.lock().ok()?;
    for _ in 0..ring.len() {
        let slot = (*cursor % ring.len() as u64) as usize;
        *cursor = cursor.wrapping_add(1);

        let backend = &config.backends[ring[slot]];
        if backend.active && backend.health.selectable() && filter.admits(backend.scheme) {
            return Some(backend.clone());
        }
    }
    None
}
