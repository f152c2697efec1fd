//! Secret source and secret store
//!
//! - `SecretSource`: where the issuance authority leaves the issued material
//! - `SecretStore`: a versioned key/value store the material is copied into
//!
//! [`update_certificate`] only writes a new store version when the payload
//! actually differs, and only patches metadata when it actually changed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::BackendError;
use crate::BackendResult;

/// Secret entry holding the certificate chain.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret entry holding the private key.
pub const TLS_KEY_KEY: &str = "tls.key";
/// Optional secret entry holding the issuing CA.
pub const CA_CERT_KEY: &str = "ca.crt";

/// Raw secret data, entry name to bytes.
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Issued TLS material. Certificate and key are never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca: Option<Vec<u8>>,
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
}

impl TlsMaterial {
    /// Extract the material from the data of secret `name`.
    pub fn from_secret_data(name: &str, data: &SecretData) -> BackendResult<Self> {
        if data.is_empty() {
            return Err(BackendError::EmptySecret(name.to_string()));
        }
        let required = |key: &'static str| {
            data.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| BackendError::MissingKey {
                    secret: name.to_string(),
                    key,
                })
        };
        Ok(TlsMaterial {
            certificate: required(TLS_CERT_KEY)?,
            key: required(TLS_KEY_KEY)?,
            ca: data.get(CA_CERT_KEY).filter(|v| !v.is_empty()).cloned(),
        })
    }
}

/// Where issued certificates can be read from.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Raw data of a secret. Returns `BackendError::NotFound` if absent.
    async fn get_secret(&self, namespace: &str, name: &str) -> BackendResult<SecretData>;

    /// Read a secret and extract its TLS material.
    async fn tls_material(&self, namespace: &str, name: &str) -> BackendResult<TlsMaterial> {
        let data = self.get_secret(namespace, name).await?;
        TlsMaterial::from_secret_data(name, &data)
    }
}

/// Payload stored under one secret-store path.
pub type StorePayload = BTreeMap<String, Value>;

/// Custom metadata stored next to a secret-store entry.
pub type StoreMetadata = BTreeMap<String, String>;

/// Versioned key/value secret store. Paths are relative to the store's engine.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Address identifying the store, recorded in metadata.
    fn address(&self) -> &str;

    /// Current payload, or `None` if nothing is stored at `path`.
    async fn read(&self, path: &str) -> BackendResult<Option<StorePayload>>;

    /// Write a new version of `path`.
    async fn write(&self, path: &str, payload: &StorePayload) -> BackendResult<()>;

    /// Custom metadata of `path`; empty if there is none.
    async fn read_metadata(&self, path: &str) -> BackendResult<StoreMetadata>;

    /// Merge `fields` into the custom metadata of `path`.
    async fn patch_metadata(&self, path: &str, fields: &StoreMetadata) -> BackendResult<()>;
}

/// Validity window reported by the issuance authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_after: Option<DateTime<Utc>>,
    pub renewal_time: Option<DateTime<Utc>>,
    pub renew_before: Duration,
}

impl Validity {
    fn fallback(now: DateTime<Utc>) -> NaiveDate {
        (now + Duration::days(365)).date_naive()
    }

    /// Date the certificate expires.
    pub fn expiry_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.not_after
            .map(|t| t.date_naive())
            .unwrap_or_else(|| Self::fallback(now))
    }

    /// Date the certificate is due for renewal.
    pub fn review_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.renewal_time
            .or_else(|| self.not_after.map(|t| t - self.renew_before))
            .map(|t| t.date_naive())
            .unwrap_or_else(|| Self::fallback(now))
    }
}

/// One certificate to copy into the secret store.
#[derive(Debug, Clone)]
pub struct CertificateData {
    pub path: String,
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
    pub validity: Validity,
}

impl CertificateData {
    pub fn payload(&self) -> StorePayload {
        let mut payload = StorePayload::new();
        payload.insert(
            "certificate".to_string(),
            Value::String(String::from_utf8_lossy(&self.certificate).into_owned()),
        );
        payload.insert(
            "private-key".to_string(),
            Value::String(String::from_utf8_lossy(&self.key).into_owned()),
        );
        payload
    }

    pub fn metadata(&self, address: &str, now: DateTime<Utc>) -> StoreMetadata {
        let date = |d: NaiveDate| d.format("%Y-%m-%d").to_string();
        [
            ("accessed_resource", address.to_string()),
            ("application_criticality", "high".to_string()),
            ("expiry_date", date(self.validity.expiry_date(now))),
            ("review_date", date(self.validity.review_date(now))),
            ("is_privileged", "false".to_string()),
            ("is_single_factor", "false".to_string()),
            ("username", "UNLINKED".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// What [`update_certificate`] had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUpdate {
    pub written: bool,
    pub metadata_patched: bool,
}

/// Copy a certificate into `store`, writing and patching only on change.
pub async fn update_certificate<S>(
    store: &S,
    data: &CertificateData,
    now: DateTime<Utc>,
) -> BackendResult<StoreUpdate>
where
    S: SecretStore + ?Sized,
{
    let mut update = StoreUpdate::default();

    let payload = data.payload();
    if store.read(&data.path).await?.as_ref() != Some(&payload) {
        store.write(&data.path, &payload).await?;
        info!(path = %data.path, "wrote certificate to secret store");
        update.written = true;
    }

    let desired = data.metadata(store.address(), now);
    let current = store.read_metadata(&data.path).await?;
    let changed = desired.iter().any(|(k, v)| current.get(k) != Some(v));
    if changed {
        store.patch_metadata(&data.path, &desired).await?;
        debug!(path = %data.path, "patched secret store metadata");
        update.metadata_patched = true;
    }
    Ok(update)
}
