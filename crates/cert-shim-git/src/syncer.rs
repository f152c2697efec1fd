//! Repository syncer: the single owner of the local clone.
//!
//! All repository-mutating work (the initial clone, commits, sync attempts)
//! runs under one exclusive lock, so no two git processes ever touch the
//! working copy at the same time. Callers never see the lock.
//!
//! Commits arm a single-slot sync trigger. The background loop wakes on the
//! trigger or on a fixed-period tick and runs the sync protocol once:
//!
//! 1. fetch and record the remote-tracking head
//! 2. pull with rebase
//! 3. compare the local head with the recorded remote head
//! 4. push if they differ (unless dry-run)
//!
//! A push rejected because the remote moved ahead retries the whole protocol
//! under a bounded backoff. Any failure re-arms the trigger, so the next tick
//! tries again and a commit is never dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::client::GitClient;
use crate::error::GitError;
use crate::metrics::{SyncMetrics, SyncStep};
use crate::options::GitConfig;
use crate::repository::Repository;
use crate::Result;

/// Observable syncer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing to commit, nothing to sync.
    Idle,
    /// The sync trigger is armed.
    SyncPending,
    /// A sync attempt holds the lock.
    Syncing,
}

/// Result of one sync protocol execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local head already equals the remote head.
    UpToDate,
    /// Local commits were pushed.
    Pushed,
    /// Local commits exist but dry-run suppressed the push.
    DryRun,
}

/// Result of a commit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Nothing changed; no commit was created.
    NoChanges,
}

/// Snapshot of the local clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalClone {
    pub path: PathBuf,
    pub branch: String,
    pub head: String,
}

/// Syncer tuning.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Period of the guaranteed resync tick.
    pub period: Duration,
    /// Commit locally but never push.
    pub dry_run: bool,
    /// Retry policy for rejected pushes.
    pub retry: RetryPolicy,
}

impl SyncSettings {
    pub fn from_config(config: &GitConfig) -> Self {
        SyncSettings {
            period: config.sync_period,
            dry_run: config.dry_run,
            retry: RetryPolicy::default(),
        }
    }
}

struct Inner<R> {
    repo: R,
    lock: Mutex<()>,
    trigger: Notify,
    pending: AtomicBool,
    syncing: AtomicBool,
    settings: SyncSettings,
    metrics: Arc<SyncMetrics>,
}

/// Owns exactly one local clone and keeps it in sync with the remote.
pub struct RepositorySyncer<R = GitClient> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for RepositorySyncer<R> {
    fn clone(&self) -> Self {
        RepositorySyncer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RepositorySyncer<GitClient> {
    /// Build the git client from `config` and clone the remote.
    pub async fn from_config(config: GitConfig, metrics: Arc<SyncMetrics>) -> Result<Self> {
        let settings = SyncSettings::from_config(&config);
        info!(
            repository = %config.remote_url,
            path = %config.local_path.display(),
            "cloning repository. this might take a while"
        );
        let client = GitClient::new(config).await?;
        Self::init(client, settings, metrics).await
    }
}

impl<R: Repository> RepositorySyncer<R> {
    /// Clone the remote into `repo`'s local path and return an idle syncer.
    pub async fn init(repo: R, settings: SyncSettings, metrics: Arc<SyncMetrics>) -> Result<Self> {
        if settings.period.is_zero() {
            return Err(GitError::InvalidOption("sync period must be positive".to_string()));
        }
        let syncer = RepositorySyncer {
            inner: Arc::new(Inner {
                repo,
                lock: Mutex::new(()),
                trigger: Notify::new(),
                pending: AtomicBool::new(false),
                syncing: AtomicBool::new(false),
                settings,
                metrics,
            }),
        };

        let start = Instant::now();
        {
            let _guard = syncer.inner.lock.lock().await;
            syncer.inner.repo.clone_remote().await?;
        }
        info!(
            path = %syncer.inner.repo.local_path().display(),
            took = ?start.elapsed(),
            "successfully initialized repository syncer"
        );
        Ok(syncer)
    }

    /// Root of the working copy.
    pub fn local_path(&self) -> &Path {
        self.inner.repo.local_path()
    }

    pub fn state(&self) -> SyncState {
        if self.inner.syncing.load(Ordering::SeqCst) {
            SyncState::Syncing
        } else if self.inner.pending.load(Ordering::SeqCst) {
            SyncState::SyncPending
        } else {
            SyncState::Idle
        }
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.inner.metrics
    }

    /// Path, branch and current head of the clone.
    pub async fn local_clone(&self) -> Result<LocalClone> {
        let _guard = self.inner.lock.lock().await;
        Ok(LocalClone {
            path: self.inner.repo.local_path().to_path_buf(),
            branch: self.inner.repo.branch().to_string(),
            head: self.inner.repo.head_commit_hash().await?,
        })
    }

    /// Stage `files` and commit them, then arm the sync trigger.
    ///
    /// A clean working tree, or staged content identical to HEAD, is a no-op.
    pub async fn add_files_and_commit<P: AsRef<Path>>(
        &self,
        message: &str,
        files: &[P],
    ) -> Result<CommitOutcome> {
        let _guard = self.inner.lock.lock().await;
        let repo = &self.inner.repo;

        repo.clear_stale_index_lock().await?;
        if repo.status().await?.is_empty() {
            debug!("no changes to commit");
            return Ok(CommitOutcome::NoChanges);
        }

        let files: Vec<PathBuf> = files.iter().map(|f| f.as_ref().to_path_buf()).collect();
        repo.add(&files).await?;
        if repo.staged_files().await?.is_empty() {
            debug!(?files, "given files are unchanged, nothing to commit");
            return Ok(CommitOutcome::NoChanges);
        }

        repo.commit(message).await?;
        self.inner.metrics.inc_commits();
        info!(%message, "committed changes");

        self.request_sync();
        Ok(CommitOutcome::Committed)
    }

    /// Arm the sync trigger. Repeated calls before the loop wakes collapse.
    pub fn request_sync(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        self.inner.trigger.notify_one();
    }

    /// Run the sync protocol once, with conflict retries, under the lock.
    ///
    /// On failure the trigger is re-armed and the error returned.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let _guard = self.inner.lock.lock().await;
        self.inner.syncing.store(true, Ordering::SeqCst);
        // This attempt observes every commit made so far.
        self.inner.pending.store(false, Ordering::SeqCst);

        let result = self.sync_with_retry().await;

        match &result {
            Ok(outcome) => {
                self.inner.metrics.inc_syncs();
                info!(?outcome, "successfully synced");
            }
            Err(e) => {
                self.inner.metrics.inc_sync_failures();
                self.inner.pending.store(true, Ordering::SeqCst);
                warn!(error = %e, "failed to sync, will retry");
            }
        }
        self.inner.syncing.store(false, Ordering::SeqCst);
        result
    }

    async fn sync_with_retry(&self) -> Result<SyncOutcome> {
        let retry = self.inner.settings.retry;
        let mut attempt = 0;
        loop {
            match self.sync_once().await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if retry.should_retry(attempt, &e) => {
                    let delay = retry.delay(attempt);
                    info!(attempt, ?delay, error = %e, "remote moved ahead, retrying sync");
                    self.inner.metrics.inc_conflict_retries();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sync_once(&self) -> Result<SyncOutcome> {
        let repo = &self.inner.repo;
        let metrics = &self.inner.metrics;

        repo.fetch().await.inspect_err(|_| metrics.inc_step_error(SyncStep::Fetch))?;
        let remote_head = repo.remote_tracking_hash().await?;

        repo.pull_rebase()
            .await
            .inspect_err(|_| metrics.inc_step_error(SyncStep::Pull))?;
        let local_head = repo.head_commit_hash().await?;
        debug!(%remote_head, %local_head, "compared heads");

        if local_head == remote_head {
            return Ok(SyncOutcome::UpToDate);
        }
        if self.inner.settings.dry_run {
            info!(%local_head, "dry run, not pushing");
            return Ok(SyncOutcome::DryRun);
        }

        debug!("pushing changes to repository");
        repo.push()
            .await
            .inspect_err(|_| metrics.inc_step_error(SyncStep::Push))?;
        Ok(SyncOutcome::Pushed)
    }

    /// Run the background loop until `shutdown` turns true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.inner.settings.period;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(?period, "repository syncer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.inner.trigger.notified() => {
                    // A permit left over from a commit that an earlier sync already covered.
                    if !self.inner.pending.load(Ordering::SeqCst) {
                        continue;
                    }
                }
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            // Errors are logged and re-armed inside.
            let _ = self.sync().await;
        }
        info!("repository syncer stopped");
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let syncer = self.clone();
        tokio::spawn(async move { syncer.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRepository;
    use std::path::PathBuf;

    fn settings() -> SyncSettings {
        SyncSettings {
            period: Duration::from_secs(3600),
            dry_run: false,
            retry: RetryPolicy::default(),
        }
    }

    async fn syncer_with(settings: SyncSettings) -> (RepositorySyncer<FakeRepository>, FakeRepository) {
        let repo = FakeRepository::new("/clone");
        let handle = repo.clone();
        let syncer = RepositorySyncer::init(repo, settings, Arc::new(SyncMetrics::new()))
            .await
            .unwrap();
        (syncer, handle)
    }

    fn cert_files() -> Vec<PathBuf> {
        vec![PathBuf::from("/clone/a.pem"), PathBuf::from("/clone/a-key.pem")]
    }

    #[tokio::test]
    async fn init_clones_once_and_is_idle() {
        let (syncer, repo) = syncer_with(settings()).await;
        assert_eq!(repo.clones(), 1);
        assert_eq!(syncer.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn zero_period_is_rejected() {
        let repo = FakeRepository::new("/clone");
        let handle = repo.clone();
        let zero = SyncSettings {
            period: Duration::ZERO,
            ..settings()
        };
        let err = RepositorySyncer::init(repo, zero, Arc::new(SyncMetrics::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GitError::InvalidOption(_)));
        assert_eq!(handle.clones(), 0);
    }

    #[tokio::test]
    async fn clean_tree_creates_no_commit() {
        let (syncer, repo) = syncer_with(settings()).await;
        let outcome = syncer.add_files_and_commit("msg", &cert_files()).await.unwrap();
        assert_eq!(outcome, CommitOutcome::NoChanges);
        assert!(repo.commit_log().is_empty());
        assert_eq!(syncer.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn unrelated_changes_are_not_committed() {
        let (syncer, repo) = syncer_with(settings()).await;
        repo.modify("/clone/README.md");
        let outcome = syncer.add_files_and_commit("msg", &cert_files()).await.unwrap();
        assert_eq!(outcome, CommitOutcome::NoChanges);
        assert!(repo.commit_log().is_empty());
    }

    #[tokio::test]
    async fn commit_arms_trigger_and_sync_pushes() {
        let (syncer, repo) = syncer_with(settings()).await;
        for f in cert_files() {
            repo.modify(f);
        }
        let outcome = syncer.add_files_and_commit("added certificate for a", &cert_files()).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(syncer.state(), SyncState::SyncPending);
        assert_eq!(repo.commit_log()[0].files, cert_files());

        assert_eq!(syncer.sync().await.unwrap(), SyncOutcome::Pushed);
        assert_eq!(syncer.state(), SyncState::Idle);
        assert_eq!(repo.pushes(), 1);
        assert_eq!(repo.remote_commits().len(), 2);
    }

    #[tokio::test]
    async fn sync_without_local_commits_does_not_push() {
        let (syncer, repo) = syncer_with(settings()).await;
        repo.advance_remote();
        assert_eq!(syncer.sync().await.unwrap(), SyncOutcome::UpToDate);
        assert_eq!(repo.pushes(), 0);
        assert_eq!(repo.pull_rebases(), 1);
    }

    #[tokio::test]
    async fn rejected_push_retries_whole_protocol() {
        let (syncer, repo) = syncer_with(settings()).await;
        repo.modify("/clone/a.pem");
        syncer.add_files_and_commit("m", &["/clone/a.pem"]).await.unwrap();
        repo.reject_next_pushes(2);

        assert_eq!(syncer.sync().await.unwrap(), SyncOutcome::Pushed);
        assert_eq!(repo.pushes(), 3);
        assert_eq!(repo.fetches(), 3);
        assert_eq!(syncer.metrics().conflict_retries(), 2);
        // Two foreign commits, the initial one and ours.
        assert_eq!(repo.remote_commits().len(), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_commit_and_rearm() {
        let (syncer, repo) = syncer_with(settings()).await;
        repo.modify("/clone/a.pem");
        syncer.add_files_and_commit("m", &["/clone/a.pem"]).await.unwrap();
        repo.reject_next_pushes(10);

        let err = syncer.sync().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(repo.pushes(), 4);
        assert_eq!(syncer.state(), SyncState::SyncPending);
        assert_eq!(syncer.metrics().sync_failures(), 1);

        repo.reject_next_pushes(0);
        assert_eq!(syncer.sync().await.unwrap(), SyncOutcome::Pushed);
        assert!(repo.remote_commits().iter().any(|c| c.starts_with("local-")));
    }

    #[tokio::test]
    async fn fatal_push_error_is_not_retried() {
        let (syncer, repo) = syncer_with(settings()).await;
        repo.modify("/clone/a.pem");
        syncer.add_files_and_commit("m", &["/clone/a.pem"]).await.unwrap();
        repo.fail_next_push(GitError::WriteNotAllowed);

        let err = syncer.sync().await.unwrap_err();
        assert!(matches!(err.root(), GitError::WriteNotAllowed));
        assert_eq!(repo.pushes(), 1);
        assert_eq!(syncer.state(), SyncState::SyncPending);
    }

    #[tokio::test]
    async fn dry_run_never_pushes() {
        let mut s = settings();
        s.dry_run = true;
        let (syncer, repo) = syncer_with(s).await;
        repo.modify("/clone/a.pem");
        syncer.add_files_and_commit("m", &["/clone/a.pem"]).await.unwrap();

        assert_eq!(syncer.sync().await.unwrap(), SyncOutcome::DryRun);
        assert_eq!(repo.pushes(), 0);
    }

    #[tokio::test]
    async fn commits_before_loop_drains_collapse_into_one_sync() {
        let (syncer, repo) = syncer_with(settings()).await;
        for i in 0..3 {
            let file = format!("/clone/cert-{i}.pem");
            repo.modify(&file);
            syncer.add_files_and_commit("m", &[file]).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let handle = syncer.spawn(rx);

        let deadline = Instant::now() + Duration::from_secs(5);
        while syncer.metrics().syncs() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(syncer.metrics().syncs(), 1);
        assert_eq!(repo.pushes(), 1);
        assert_eq!(repo.remote_commits().len(), 4);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let (syncer, _repo) = syncer_with(settings()).await;
        let (tx, rx) = watch::channel(false);
        let handle = syncer.spawn(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn local_clone_reports_head() {
        let (syncer, _repo) = syncer_with(settings()).await;
        let clone = syncer.local_clone().await.unwrap();
        assert_eq!(clone.path, PathBuf::from("/clone"));
        assert_eq!(clone.branch, "master");
        assert_eq!(clone.head, "remote-0");
    }
}
