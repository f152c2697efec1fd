//! cert-shim-core: Certificate Reconciliation
//!
//! Turns declaration files in the certificate repository into issued
//! certificates, copies them into the secret store and commits them back to
//! the repository.
//!
//! ## Layer 2 - Reconciliation
//!
//! Focus: every declared certificate converges eventually. Failures are
//! retried with per-item backoff and a periodic full rescan bounds staleness.
//!
//! ## Key Components
//!
//! - `CertificateRequest`: One declared certificate and its derived names
//! - `RateLimitedQueue`: Deduplicating delay queue with per-item backoff
//! - `Scheduler`: Workers converging requests, plus the periodic rescan
//! - `ControllerOptions`: Namespace, issuer and renewal settings
//! - `telemetry::init_tracing`: Global subscriber setup for binaries

mod certificate;
mod config;
mod declaration;
mod discovery;
mod error;
mod metrics;
mod queue;
mod scheduler;
pub mod telemetry;

pub use certificate::{normalize_sans, path_safe_common_name, safe_name, CertificateRequest};
pub use config::{
    ControllerOptions, DEFAULT_NAMESPACE, DEFAULT_RENEW_BEFORE, NAMESPACE_ENV,
};
pub use declaration::{parse_declaration, read_declaration, render_store_path, PATH_SAFE_COMMON_NAME};
pub use discovery::{find_declarations, DEFAULT_DECLARATION_FILE};
pub use error::ShimError;
pub use metrics::ReconcileMetrics;
pub use queue::{RateLimitedQueue, DEFAULT_BACKOFF};
pub use scheduler::{write_artifacts, Collaborators, CommitSink, Scheduler};

/// Result type for cert-shim-core operations
pub type Result<T> = std::result::Result<T, ShimError>;
