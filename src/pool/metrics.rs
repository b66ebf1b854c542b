// ABOUTME: Counters for the service pool
//
// Tracks:
// - Acquisitions: requested, bound, failed
// - Bind rounds that timed out without confirmation
// - Releases
// - Workers: announced, provisioned, shut down

use std::sync::atomic::{AtomicU64, Ordering};

/// Pool-level counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Acquisitions that reached the round loop
    pub acquisitions: AtomicU64,
    /// Acquisitions that ended with a bound worker
    pub acquisitions_bound: AtomicU64,
    /// Acquisitions that gave up
    pub acquisitions_failed: AtomicU64,
    /// Workers discarded for not confirming a bind
    pub bind_timeouts: AtomicU64,
    /// Bindings released
    pub releases: AtomicU64,
    /// Workers queued from `serviceReady`
    pub workers_announced: AtomicU64,
    /// Growth signals that reached the provisioner
    pub workers_provisioned: AtomicU64,
    /// `shutdownService` messages sent
    pub workers_shut_down: AtomicU64,
}

impl PoolMetrics {
    /// Zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acquisition entering the round loop
    pub fn acquisition_started(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bound acquisition
    pub fn acquisition_bound(&self) {
        self.acquisitions_bound.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition that gave up
    pub fn acquisition_failed(&self) {
        self.acquisitions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a discarded worker
    pub fn bind_timed_out(&self) {
        self.bind_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a release
    pub fn released(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a queued worker
    pub fn worker_announced(&self) {
        self.workers_announced.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a growth signal
    pub fn worker_provisioned(&self) {
        self.workers_provisioned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a shutdown
    pub fn worker_shut_down(&self) {
        self.workers_shut_down.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            acquisitions_bound: self.acquisitions_bound.load(Ordering::Relaxed),
            acquisitions_failed: self.acquisitions_failed.load(Ordering::Relaxed),
            bind_timeouts: self.bind_timeouts.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            workers_announced: self.workers_announced.load(Ordering::Relaxed),
            workers_provisioned: self.workers_provisioned.load(Ordering::Relaxed),
            workers_shut_down: self.workers_shut_down.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// See [`PoolMetrics::acquisitions`]
    pub acquisitions: u64,
    /// See [`PoolMetrics::acquisitions_bound`]
    pub acquisitions_bound: u64,
    /// See [`PoolMetrics::acquisitions_failed`]
    pub acquisitions_failed: u64,
    /// See [`PoolMetrics::bind_timeouts`]
    pub bind_timeouts: u64,
    /// See [`PoolMetrics::releases`]
    pub releases: u64,
    /// See [`PoolMetrics::workers_announced`]
    pub workers_announced: u64,
    /// See [`PoolMetrics::workers_provisioned`]
    pub workers_provisioned: u64,
    /// See [`PoolMetrics::workers_shut_down`]
    pub workers_shut_down: u64,
}
