//! Counters for the reconciliation scheduler.
//!
//! Same shape as the syncer's counters: atomics incremented silently and
//! emitted together by [`ReconcileMetrics::flush`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ReconcileMetrics {
    reconciled: AtomicU64,
    not_ready: AtomicU64,
    failures: AtomicU64,
    requeues: AtomicU64,
    declarations_scanned: AtomicU64,
    declaration_errors: AtomicU64,
    store_writes: AtomicU64,
    commits: AtomicU64,
}

impl ReconcileMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A certificate converged.
    pub fn inc_reconciled(&self) {
        self.reconciled.fetch_add(1, Ordering::Relaxed);
    }

    /// An attempt ended because issuance is still pending.
    pub fn inc_not_ready(&self) {
        self.not_ready.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requeues(&self) {
        self.requeues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_declarations_scanned(&self) {
        self.declarations_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_declaration_errors(&self) {
        self.declaration_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_store_writes(&self) {
        self.store_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commits(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconciled(&self) -> u64 {
        self.reconciled.load(Ordering::Relaxed)
    }

    pub fn not_ready(&self) -> u64 {
        self.not_ready.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn requeues(&self) -> u64 {
        self.requeues.load(Ordering::Relaxed)
    }

    pub fn declarations_scanned(&self) -> u64 {
        self.declarations_scanned.load(Ordering::Relaxed)
    }

    pub fn declaration_errors(&self) -> u64 {
        self.declaration_errors.load(Ordering::Relaxed)
    }

    pub fn store_writes(&self) -> u64 {
        self.store_writes.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "reconcile.flush",
            reconciled = self.reconciled(),
            not_ready = self.not_ready(),
            failures = self.failures(),
            requeues = self.requeues(),
            declarations_scanned = self.declarations_scanned(),
            declaration_errors = self.declaration_errors(),
            store_writes = self.store_writes(),
            commits = self.commits(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = ReconcileMetrics::new();
        assert_eq!(m.reconciled(), 0);
        m.inc_reconciled();
        m.inc_not_ready();
        m.inc_not_ready();
        assert_eq!(m.reconciled(), 1);
        assert_eq!(m.not_ready(), 2);
        m.flush();
    }
}
