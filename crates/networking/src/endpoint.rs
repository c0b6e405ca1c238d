//! Endpoint selection policies
//!
//! A policy picks one of `count` configured endpoints by index and is told
//! about transport failures so it can steer away from a dead endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses which endpoint the next request goes to
pub trait EndpointSelectionPolicy: Send + Sync {
    /// Index of the endpoint to use, or `None` when there are none
    fn select(&self, count: usize) -> Option<usize>;

    /// The request to endpoint `index` failed at the transport level
    fn on_failure(&self, _index: usize, _count: usize) {}
}

/// Rotate through endpoints on every request
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    /// Start at the first endpoint
    pub fn new() -> Self {
        Self::default()
    }
}

impl EndpointSelectionPolicy for RoundRobin {
    fn select(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % count)
    }
}

/// Stick to one endpoint until it fails, then move to the next
#[derive(Debug, Default)]
pub struct Failover {
    current: AtomicUsize,
}

impl Failover {
    /// Start at the first (primary) endpoint
    pub fn new() -> Self {
        Self::default()
    }
}

impl EndpointSelectionPolicy for Failover {
    fn select(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        Some(self.current.load(Ordering::Relaxed) % count)
    }

    fn on_failure(&self, index: usize, count: usize) {
        if count == 0 {
            return;
        }
        // Only the first failure report for the current endpoint advances
        let next = (index + 1) % count;
        if self
            .current
            .compare_exchange(index, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::warn!("Endpoint {} failed, failing over to {}", index, next);
        }
    }
}
