//! Counters for the repository syncer.
//!
//! One [`SyncMetrics`] is created at startup and handed to the syncer as an
//! `Arc`. Counters are incremented silently; [`SyncMetrics::flush`] emits the
//! current values as a single `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Which step of the sync protocol failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Fetch,
    Pull,
    Push,
}

/// Lightweight atomic counters for git synchronization.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    commits: AtomicU64,
    syncs: AtomicU64,
    sync_failures: AtomicU64,
    conflict_retries: AtomicU64,
    fetch_errors: AtomicU64,
    pull_errors: AtomicU64,
    push_errors: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_commits(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// One sync protocol execution finished successfully.
    pub fn inc_syncs(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    /// One sync protocol execution failed after all retries.
    pub fn inc_sync_failures(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conflict_retries(&self) {
        self.conflict_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_step_error(&self, step: SyncStep) {
        let counter = match step {
            SyncStep::Fetch => &self.fetch_errors,
            SyncStep::Pull => &self.pull_errors,
            SyncStep::Push => &self.push_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "synchronization_errors_total", ?step, "counter incremented");
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    pub fn sync_failures(&self) -> u64 {
        self.sync_failures.load(Ordering::Relaxed)
    }

    pub fn conflict_retries(&self) -> u64 {
        self.conflict_retries.load(Ordering::Relaxed)
    }

    pub fn step_errors(&self, step: SyncStep) -> u64 {
        match step {
            SyncStep::Fetch => self.fetch_errors.load(Ordering::Relaxed),
            SyncStep::Pull => self.pull_errors.load(Ordering::Relaxed),
            SyncStep::Push => self.push_errors.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "git.flush",
            commits = self.commits(),
            syncs = self.syncs(),
            sync_failures = self.sync_failures(),
            conflict_retries = self.conflict_retries(),
            fetch_errors = self.step_errors(SyncStep::Fetch),
            pull_errors = self.step_errors(SyncStep::Pull),
            push_errors = self.step_errors(SyncStep::Push),
        );
    }
}
