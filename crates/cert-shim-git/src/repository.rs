//! The repository operations the syncer relies on.
//!
//! [`GitClient`](crate::GitClient) implements this against the git binary;
//! [`FakeRepository`](crate::fakes::FakeRepository) implements it in memory
//! for tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::Result;

/// Typed operations on one local clone.
///
/// Implementations are not internally serialized; the syncer's lock is what
/// keeps two operations from interleaving on the same working copy.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Absolute path of the working copy.
    fn local_path(&self) -> &Path;

    /// Branch being synchronized.
    fn branch(&self) -> &str;

    /// Shallow, single-branch clone of the configured branch.
    async fn clone_remote(&self) -> Result<()>;

    /// Short working-tree status; empty when clean.
    async fn status(&self) -> Result<String>;

    /// Stage the given files.
    async fn add(&self, files: &[PathBuf]) -> Result<()>;

    /// Paths currently staged for commit.
    async fn staged_files(&self) -> Result<Vec<String>>;

    /// Commit staged changes with the configured author.
    async fn commit(&self, message: &str) -> Result<()>;

    /// Push the branch to the remote.
    async fn push(&self) -> Result<()>;

    /// Fetch the branch, updating its remote-tracking ref.
    async fn fetch(&self) -> Result<()>;

    /// Abort any stale rebase, then pull with rebase.
    async fn pull_rebase(&self) -> Result<()>;

    /// Hash of the local HEAD.
    async fn head_commit_hash(&self) -> Result<String>;

    /// Hash of the remote-tracking ref as of the last fetch.
    async fn remote_tracking_hash(&self) -> Result<String>;

    /// Remove an index lock left behind by a killed git process.
    ///
    /// Returns whether a lock was removed.
    async fn clear_stale_index_lock(&self) -> Result<bool>;
}
