//! cert-shim-backends: External Collaborators for cert-shim
//!
//! Traits for everything the reconciler talks to besides git, the REST
//! adapters implementing them, and in-memory fakes for tests.
//!
//! ## Layer 1 - Collaborators
//!
//! Focus: idempotent writes. A resource is only patched, and a secret only
//! rewritten, when the desired state differs from what is stored.
//!
//! ## Key Components
//!
//! - `IssuanceAuthority`: Certificate resources and their readiness
//! - `SecretSource`: Issued TLS material
//! - `SecretStore`: Versioned key/value store the material is copied into
//! - `KubeClient`: cert-manager and core secrets over the Kubernetes API
//! - `VaultClient`: Vault KV v2 with AppRole login

pub mod authority;
mod error;
pub mod fakes;
mod http;
pub mod kube;
pub mod secrets;
pub mod vault;

pub use authority::{
    ensure_certificate, go_duration, CertificateResource, CertificateSpec, CertificateStatus,
    Condition, EnsureOutcome, IssuanceAuthority, IssuerRef,
};
pub use error::BackendError;
pub use http::{CONNECT_TIMEOUT, REQUEST_TIMEOUT};
pub use kube::{KubeClient, KubeConfig};
pub use secrets::{
    update_certificate, CertificateData, SecretData, SecretSource, SecretStore, StoreMetadata,
    StorePayload, StoreUpdate, TlsMaterial, Validity, CA_CERT_KEY, TLS_CERT_KEY, TLS_KEY_KEY,
};
pub use vault::{VaultClient, VaultConfig};

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;
