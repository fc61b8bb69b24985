//! Client-side transaction counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of client counters at a point in time.
pub struct StatsSnapshot {
    /// Transactions opened, across all attempts.
    pub tx_opened: u64,
    /// Writable transactions durably committed.
    pub tx_committed: u64,
    /// Transactions explicitly discarded.
    pub tx_discarded: u64,
    /// Commits rejected with a conflict.
    pub commit_conflicts: u64,
    /// Attempts started after a conflict.
    pub retries: u64,
    /// Transaction bodies that failed with a non-retryable error.
    pub failures: u64,
    /// Requests sent on transaction streams.
    pub requests_sent: u64,
}

/// Thread-safe counters shared by every transaction of one client.
#[derive(Default)]
pub struct ClientStats {
    tx_opened: AtomicU64,
    tx_committed: AtomicU64,
    tx_discarded: AtomicU64,
    commit_conflicts: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    requests_sent: AtomicU64,
}

impl std::fmt::Debug for ClientStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ClientStats {
    /// Counters starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `tx_opened`.
    pub fn inc_tx_opened(&self) {
        self.tx_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments `tx_committed`.
    pub fn inc_tx_committed(&self) {
        self.tx_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments `tx_discarded`.
    pub fn inc_tx_discarded(&self) {
        self.tx_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments `commit_conflicts`.
    pub fn inc_commit_conflicts(&self) {
        self.commit_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments `retries`.
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments `failures`.
    pub fn inc_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments `requests_sent`.
    pub fn inc_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters. Counters are read one by one, so the snapshot
    /// is not atomic across them.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_opened: self.tx_opened.load(Ordering::Relaxed),
            tx_committed: self.tx_committed.load(Ordering::Relaxed),
            tx_discarded: self.tx_discarded.load(Ordering::Relaxed),
            commit_conflicts: self.commit_conflicts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ClientStats::new();
        stats.inc_tx_opened();
        stats.inc_tx_opened();
        stats.inc_commit_conflicts();
        stats.inc_retries();
        stats.inc_tx_committed();
        let snap = stats.snapshot();
        assert_eq!(snap.tx_opened, 2);
        assert_eq!(snap.commit_conflicts, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.tx_committed, 1);
        assert_eq!(snap.failures, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ClientStats::new();
        stats.inc_requests_sent();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"requests_sent\":1"));
    }
}
