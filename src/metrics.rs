use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Point-in-time copy of [`RegistryMetrics`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Allocations committed, pool allocations and adoptions included.
    pub commits: u64,
    /// Requests rejected because the block was taken.
    pub conflicts: u64,
    /// Commit attempts that found the scope guard busy.
    pub retries: u64,
    /// Commits abandoned on deadline, attempts or cancellation.
    pub timeouts: u64,
    /// Allocations released.
    pub releases: u64,
    /// Availability checks served.
    pub checks: u64,
    /// Batches the store refused.
    pub storage_failures: u64,
}

/// Thread-safe counters for registry operations.
#[derive(Default, Debug)]
pub struct RegistryMetrics {
    commits: AtomicU64,
    conflicts: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    releases: AtomicU64,
    checks: AtomicU64,
    storage_failures: AtomicU64,
}

impl RegistryMetrics {
    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_release(&self) {
        self.releases.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_check(&self) {
        self.checks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_storage_failure(&self) {
        self.storage_failures.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits: self.commits.load(AtomicOrdering::Relaxed),
            conflicts: self.conflicts.load(AtomicOrdering::Relaxed),
            retries: self.retries.load(AtomicOrdering::Relaxed),
            timeouts: self.timeouts.load(AtomicOrdering::Relaxed),
            releases: self.releases.load(AtomicOrdering::Relaxed),
            checks: self.checks.load(AtomicOrdering::Relaxed),
            storage_failures: self.storage_failures.load(AtomicOrdering::Relaxed),
        }
    }
}
