//! In-memory fakes for backend traits (testing only)
//!
//! Provides `FakeAuthority`, `FakeSecretSource`, and `FakeSecretStore`
//! that satisfy the trait contracts without any external dependencies.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::authority::{CertificateResource, CertificateStatus, Condition, IssuanceAuthority};
use crate::error::BackendError;
use crate::secrets::{SecretData, SecretSource, SecretStore, StoreMetadata, StorePayload};
use crate::BackendResult;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

// ---------------------------------------------------------------------------
// FakeAuthority
// ---------------------------------------------------------------------------

/// In-memory issuance authority backed by a `HashMap<namespace/name, resource>`.
///
/// Created resources are not ready until [`FakeAuthority::mark_ready`] is
/// called, unless the fake was built with [`FakeAuthority::issuing`].
#[derive(Debug, Default)]
pub struct FakeAuthority {
    resources: Mutex<HashMap<String, CertificateResource>>,
    issue_immediately: bool,
    next_error: Mutex<Option<BackendError>>,
    creates: AtomicUsize,
    patches: AtomicUsize,
}

impl FakeAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fake that marks every resource ready as soon as it is created.
    pub fn issuing() -> Self {
        FakeAuthority {
            issue_immediately: true,
            ..Self::default()
        }
    }

    /// Mark a resource ready with the given validity window.
    pub fn mark_ready(&self, namespace: &str, name: &str, not_after: Option<DateTime<Utc>>) {
        if let Some(res) = lock(&self.resources).get_mut(&key(namespace, name)) {
            res.status = CertificateStatus {
                conditions: vec![Condition::ready(true)],
                not_after,
                renewal_time: None,
            };
        }
    }

    /// Fail the next call with `err`.
    pub fn fail_next(&self, err: BackendError) {
        *lock(&self.next_error) = Some(err);
    }

    pub fn resource(&self, namespace: &str, name: &str) -> Option<CertificateResource> {
        lock(&self.resources).get(&key(namespace, name)).cloned()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn patches(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    fn take_error(&self) -> BackendResult<()> {
        match lock(&self.next_error).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl IssuanceAuthority for FakeAuthority {
    async fn get(&self, namespace: &str, name: &str) -> BackendResult<CertificateResource> {
        self.take_error()?;
        self.resource(namespace, name)
            .ok_or_else(|| BackendError::NotFound {
                kind: "certificate",
                name: key(namespace, name),
            })
    }

    async fn create(&self, resource: &CertificateResource) -> BackendResult<CertificateResource> {
        self.take_error()?;
        let mut created = resource.clone();
        if self.issue_immediately {
            created.status.conditions = vec![Condition::ready(true)];
        }
        lock(&self.resources).insert(resource.key(), created.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn patch(&self, resource: &CertificateResource) -> BackendResult<CertificateResource> {
        self.take_error()?;
        let mut resources = lock(&self.resources);
        let existing = resources
            .get_mut(&resource.key())
            .ok_or_else(|| BackendError::NotFound {
                kind: "certificate",
                name: resource.key(),
            })?;
        existing.spec = resource.spec.clone();
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(existing.clone())
    }
}

// ---------------------------------------------------------------------------
// FakeSecretSource
// ---------------------------------------------------------------------------

/// In-memory secret source backed by a `HashMap<namespace/name, data>`.
#[derive(Debug, Default)]
pub struct FakeSecretSource {
    secrets: Mutex<HashMap<String, SecretData>>,
}

impl FakeSecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, name: &str, entries: &[(&str, &[u8])]) {
        let data = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect();
        lock(&self.secrets).insert(key(namespace, name), data);
    }
}

#[async_trait]
impl SecretSource for FakeSecretSource {
    async fn get_secret(&self, namespace: &str, name: &str) -> BackendResult<SecretData> {
        lock(&self.secrets)
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                kind: "secret",
                name: key(namespace, name),
            })
    }
}

// ---------------------------------------------------------------------------
// FakeSecretStore
// ---------------------------------------------------------------------------

/// In-memory secret store that counts writes and metadata patches.
#[derive(Debug, Default)]
pub struct FakeSecretStore {
    address: String,
    payloads: Mutex<BTreeMap<String, StorePayload>>,
    metadata: Mutex<BTreeMap<String, StoreMetadata>>,
    writes: AtomicUsize,
    metadata_patches: AtomicUsize,
}

impl FakeSecretStore {
    pub fn new(address: &str) -> Self {
        FakeSecretStore {
            address: address.to_string(),
            ..Self::default()
        }
    }

    pub fn payload(&self, path: &str) -> Option<StorePayload> {
        lock(&self.payloads).get(path).cloned()
    }

    pub fn metadata(&self, path: &str) -> StoreMetadata {
        lock(&self.metadata).get(path).cloned().unwrap_or_default()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn metadata_patches(&self) -> usize {
        self.metadata_patches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    fn address(&self) -> &str {
        &self.address
    }

    async fn read(&self, path: &str) -> BackendResult<Option<StorePayload>> {
        Ok(self.payload(path))
    }

    async fn write(&self, path: &str, payload: &StorePayload) -> BackendResult<()> {
        lock(&self.payloads).insert(path.to_string(), payload.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_metadata(&self, path: &str) -> BackendResult<StoreMetadata> {
        Ok(self.metadata(path))
    }

    async fn patch_metadata(&self, path: &str, fields: &StoreMetadata) -> BackendResult<()> {
        lock(&self.metadata)
            .entry(path.to_string())
            .or_default()
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.metadata_patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
