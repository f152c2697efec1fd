//! cert-shim-git: Git Access for cert-shim
//!
//! This crate owns the local clone of the certificate repository. It drives
//! the `git` binary as a subprocess and keeps the clone synchronized with its
//! remote.
//!
//! ## Layer 0 - Repository Access
//!
//! Focus: serialized access to one working copy, bounded subprocesses and
//! conflict-tolerant pushes.
//!
//! ## Key Components
//!
//! - `CommandRunner`: Runs a binary with default args, env and a hard timeout
//! - `GitClient`: Typed git operations on one clone (`Repository` impl)
//! - `RepositorySyncer`: Serializes commits and runs the fetch/rebase/push loop
//! - `GitOptions` / `GitConfig`: Operator options and their validated form

mod backoff;
mod client;
mod error;
mod exec;
pub mod fakes;
mod metrics;
mod options;
mod repository;
mod syncer;

pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use client::{push_url, GitClient};
pub use error::{is_push_conflict, GitError};
pub use exec::{CommandRunner, CLONE_TIMEOUT, DEFAULT_TIMEOUT};
pub use metrics::{SyncMetrics, SyncStep};
pub use options::{
    default_local_path, is_local_remote, Author, GitAuth, GitConfig, GitOptions, DEFAULT_BRANCH,
    DEFAULT_SYNC_PERIOD, REMOTE_NAME, REMOTE_URL_ENV, SSH_KEY_FILE_ENV, TOKEN_ENV,
};
pub use repository::Repository;
pub use syncer::{
    CommitOutcome, LocalClone, RepositorySyncer, SyncOutcome, SyncSettings, SyncState,
};

/// Result type for cert-shim-git operations
pub type Result<T> = std::result::Result<T, GitError>;
