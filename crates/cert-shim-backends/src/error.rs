//! Error types for cert-shim-backends

use thiserror::Error;

/// Errors that can occur while talking to the issuance authority, the
/// secret source or the secret store
#[derive(Error, Debug)]
pub enum BackendError {
    /// The requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// A secret has no data at all
    #[error("secret {0} is empty")]
    EmptySecret(String),

    /// A required entry is absent from a secret, or has no content
    #[error("{key} missing in secret data of {secret}")]
    MissingKey { secret: String, key: &'static str },

    /// Missing or invalid adapter configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Authentication against the backend failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The backend answered with an unexpected status
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    /// Transport-level HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding error
    #[error("base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Http(err.to_string())
    }
}
