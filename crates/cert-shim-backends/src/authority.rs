//! Issuance authority model and trait
//!
//! The authority is modelled on cert-manager's `Certificate` resource: we
//! declare a desired spec and poll the resource until it reports a `Ready`
//! condition. [`ensure_certificate`] is the idempotent get-or-create-or-patch
//! used by the reconciler.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::BackendResult;

/// Reference to the issuer that signs a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerRef {
    pub name: String,
    pub kind: String,
    pub group: String,
}

/// Desired state of a certificate resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub common_name: String,
    #[serde(default)]
    pub dns_names: Vec<String>,
    pub secret_name: String,
    pub issuer_ref: IssuerRef,
    /// Go duration string, e.g. `720h0m0s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_before: Option<String>,
}

/// One status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn ready(status: bool) -> Self {
        Condition {
            kind: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: None,
            message: None,
        }
    }
}

/// Observed state of a certificate resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_time: Option<DateTime<Utc>>,
}

/// A certificate resource as seen by the issuance authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateResource {
    pub namespace: String,
    pub name: String,
    pub spec: CertificateSpec,
    pub status: CertificateStatus,
}

impl CertificateResource {
    /// Whether the resource has a `Ready` condition with status `True`.
    pub fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }

    /// `namespace/name`, for logging.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// What [`ensure_certificate`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Patched,
    Unchanged,
}

/// Issuance authority holding certificate resources.
#[async_trait]
pub trait IssuanceAuthority: Send + Sync {
    /// Fetch a resource. Returns `BackendError::NotFound` if absent.
    async fn get(&self, namespace: &str, name: &str) -> BackendResult<CertificateResource>;

    /// Create a resource from its spec.
    async fn create(&self, resource: &CertificateResource) -> BackendResult<CertificateResource>;

    /// Replace the spec fields we own on an existing resource.
    async fn patch(&self, resource: &CertificateResource) -> BackendResult<CertificateResource>;
}

/// Make sure a resource with `desired`'s spec exists.
///
/// No patch is issued when the observed spec already equals the desired one.
pub async fn ensure_certificate<A>(
    authority: &A,
    desired: CertificateResource,
) -> BackendResult<(CertificateResource, EnsureOutcome)>
where
    A: IssuanceAuthority + ?Sized,
{
    let observed = match authority.get(&desired.namespace, &desired.name).await {
        Ok(observed) => observed,
        Err(e) if e.is_not_found() => {
            let created = authority.create(&desired).await?;
            info!(certificate = %desired.key(), "created certificate");
            return Ok((created, EnsureOutcome::Created));
        }
        Err(e) => return Err(e),
    };

    if observed.spec == desired.spec {
        debug!(certificate = %observed.key(), "certificate is up to date");
        return Ok((observed, EnsureOutcome::Unchanged));
    }

    let patched = authority.patch(&desired).await?;
    info!(certificate = %desired.key(), "patched certificate");
    Ok((patched, EnsureOutcome::Patched))
}

/// Render a duration the way Go's `time.Duration.String` does for whole
/// seconds, which is how the authority stores `renewBefore`.
pub fn go_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}
