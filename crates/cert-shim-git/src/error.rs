//! Error types for cert-shim-git

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving the git binary
#[derive(Error, Debug)]
pub enum GitError {
    /// The binary is missing or did not answer the version check
    #[error("command not installed: {0}")]
    NotInstalled(String),

    /// The subprocess exceeded its timeout and was killed
    #[error("{command} timed out after {elapsed:?}")]
    TimedOut { command: String, elapsed: Duration },

    /// The subprocess exited with a non-zero status
    #[error("{command} exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Commit or push attempted without an author identity
    #[error("write not allowed: missing author name and/or email")]
    WriteNotAllowed,

    /// No remote URL was given and none was found in the environment
    #[error("git remote has no remote configured")]
    NoRemote,

    /// The remote URL does not fit the chosen authentication method
    #[error("remote URL {url} cannot be used with {auth} authentication")]
    InvalidRemoteUrl { url: String, auth: &'static str },

    /// Credential material is missing or unusable
    #[error("invalid credentials: {0}")]
    Credentials(String),

    /// An option has a value the syncer cannot work with
    #[error("invalid git option: {0}")]
    InvalidOption(String),

    /// The local clone path is relative
    #[error("requires an absolute path, cannot use: {0}")]
    RelativePath(PathBuf),

    /// A named git operation failed
    #[error("{op} failed: {source}")]
    Operation {
        op: String,
        #[source]
        source: Box<GitError>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Wrap this error with the name of the git operation that produced it.
    pub fn context(self, op: impl Into<String>) -> Self {
        GitError::Operation {
            op: op.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping operation wrappers.
    pub fn root(&self) -> &GitError {
        match self {
            GitError::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether a fresh fetch + rebase can make this error go away.
    ///
    /// Only a push rejected because the remote moved ahead qualifies.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            GitError::CommandFailed { stderr, .. } => is_push_conflict(stderr),
            _ => false,
        }
    }

    /// Whether this error can never be resolved by retrying.
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self.root(),
            GitError::NotInstalled(_)
                | GitError::NoRemote
                | GitError::InvalidRemoteUrl { .. }
                | GitError::Credentials(_)
                | GitError::RelativePath(_)
                | GitError::InvalidOption(_)
                | GitError::WriteNotAllowed
        )
    }
}

/// Classify git output as a rejected push caused by newer remote commits.
pub fn is_push_conflict(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("failed to push some refs")
        || message.contains("non-fast-forward")
        || message.contains("(fetch first)")
}
