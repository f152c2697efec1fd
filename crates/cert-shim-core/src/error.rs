//! Error types for cert-shim-core

use std::path::PathBuf;

use cert_shim_backends::BackendError;
use cert_shim_git::GitError;
use thiserror::Error;

/// Errors that can occur while reconciling certificates
#[derive(Error, Debug)]
pub enum ShimError {
    /// A declaration file is not valid YAML or misses required fields
    #[error("failed to parse declaration {path}: {source}")]
    Declaration {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The secret-store path template of a declaration cannot be rendered
    #[error("while evaluating vault.path template of {path}: {message}")]
    Template { path: PathBuf, message: String },

    /// Controller options are incomplete
    #[error("invalid controller options: {0}")]
    Config(String),

    /// The authority has not issued the certificate yet
    #[error("certificate {0} not (yet) ready")]
    NotReady(String),

    /// Refused to write an artifact without content
    #[error("will not write an empty file: {0}")]
    EmptyArtifact(PathBuf),

    /// Walking the clone for declarations failed
    #[error("failed to find declarations: {0}")]
    Walk(#[from] walkdir::Error),

    /// Git error
    #[error(transparent)]
    Git(#[from] GitError),

    /// Authority or secret backend error
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShimError {
    /// Whether this is the expected "issuance still pending" condition.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, ShimError::NotReady(_))
    }

    /// Whether retrying can never succeed, so the controller should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShimError::Git(e) if e.is_fatal_setup())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_author_is_fatal() {
        let err = ShimError::from(GitError::WriteNotAllowed.context("git commit"));
        assert!(err.is_fatal());
        assert!(!err.is_not_ready());
    }

    #[test]
    fn transient_errors_are_not_fatal() {
        assert!(!ShimError::NotReady("kube-system/a".to_string()).is_fatal());
        let failed = GitError::CommandFailed {
            command: "git push".to_string(),
            code: 1,
            stderr: "connection reset".to_string(),
        };
        assert!(!ShimError::from(failed).is_fatal());
    }
}
