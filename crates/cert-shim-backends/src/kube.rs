//! Kubernetes REST adapter
//!
//! Talks to the API server with the pod's service-account token:
//! cert-manager `Certificate` resources for the issuance authority and core
//! `Secret`s for the issued material.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::authority::{CertificateResource, CertificateSpec, CertificateStatus, IssuanceAuthority};
use crate::error::BackendError;
use crate::http::{check, http_client, REQUEST_TIMEOUT};
use crate::secrets::{SecretData, SecretSource};
use crate::BackendResult;

/// Directory the service-account credentials are mounted into.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const CERTIFICATE_API: &str = "apis/cert-manager.io/v1";
const CORE_API: &str = "api/v1";

/// API server location and credentials.
#[derive(Clone)]
pub struct KubeConfig {
    pub api_server: String,
    pub token: String,
    pub ca_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for KubeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeConfig")
            .field("api_server", &self.api_server)
            .field("ca_pem", &self.ca_pem.is_some())
            .finish_non_exhaustive()
    }
}

impl KubeConfig {
    /// In-cluster configuration from the service environment and the
    /// mounted service account.
    pub fn in_cluster() -> BackendResult<Self> {
        Self::in_cluster_with(Path::new(SERVICE_ACCOUNT_DIR), |key| std::env::var(key).ok())
    }

    pub fn in_cluster_with<F>(sa_dir: &Path, env: F) -> BackendResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = env("KUBERNETES_SERVICE_HOST").ok_or_else(|| {
            BackendError::Config("KUBERNETES_SERVICE_HOST is not set, not running in a cluster".to_string())
        })?;
        let port = env("KUBERNETES_SERVICE_PORT").unwrap_or_else(|| "443".to_string());
        let host = if host.contains(':') { format!("[{host}]") } else { host };

        let token_path: PathBuf = sa_dir.join("token");
        let token = std::fs::read_to_string(&token_path)
            .map_err(|e| BackendError::Config(format!("{}: {e}", token_path.display())))?
            .trim()
            .to_string();
        let ca_pem = std::fs::read(sa_dir.join("ca.crt")).ok();

        Ok(KubeConfig {
            api_server: format!("https://{host}:{port}"),
            token,
            ca_pem,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMeta {
    name: String,
    namespace: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    metadata: ObjectMeta,
    spec: CertificateSpec,
    #[serde(default, skip_serializing)]
    status: Option<CertificateStatus>,
}

impl From<CertificateObject> for CertificateResource {
    fn from(obj: CertificateObject) -> Self {
        CertificateResource {
            namespace: obj.metadata.namespace,
            name: obj.metadata.name,
            spec: obj.spec,
            status: obj.status.unwrap_or_default(),
        }
    }
}

impl From<&CertificateResource> for CertificateObject {
    fn from(res: &CertificateResource) -> Self {
        CertificateObject {
            api_version: Some("cert-manager.io/v1".to_string()),
            kind: Some("Certificate".to_string()),
            metadata: ObjectMeta {
                name: res.name.clone(),
                namespace: res.namespace.clone(),
            },
            spec: res.spec.clone(),
            status: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: Option<std::collections::BTreeMap<String, String>>,
}

/// Decode the base64 `data` map of a secret.
fn decode_secret(obj: SecretObject) -> BackendResult<SecretData> {
    obj.data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| -> BackendResult<(String, Vec<u8>)> { Ok((k, STANDARD.decode(v.as_bytes())?)) })
        .collect()
}

/// Issuance authority and secret source backed by the Kubernetes API.
pub struct KubeClient {
    config: KubeConfig,
    http_client: reqwest::Client,
}

impl KubeClient {
    pub fn new(config: KubeConfig) -> BackendResult<Self> {
        Self::with_timeout(config, REQUEST_TIMEOUT)
    }

    /// Like [`KubeClient::new`] with a custom per-request timeout.
    pub fn with_timeout(config: KubeConfig, timeout: Duration) -> BackendResult<Self> {
        let http_client = http_client(config.ca_pem.as_deref(), timeout)?;
        Ok(KubeClient { config, http_client })
    }

    pub fn in_cluster() -> BackendResult<Self> {
        Self::new(KubeConfig::in_cluster()?)
    }

    fn certificates_url(&self, namespace: &str) -> String {
        format!(
            "{}/{CERTIFICATE_API}/namespaces/{namespace}/certificates",
            self.config.api_server
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http_client
            .request(method, url)
            .bearer_auth(&self.config.token)
    }

    async fn get_object(&self, url: &str, kind: &'static str, name: String) -> BackendResult<reqwest::Response> {
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound { kind, name });
        }
        check(response, "GET", url).await
    }
}

#[async_trait]
impl IssuanceAuthority for KubeClient {
    async fn get(&self, namespace: &str, name: &str) -> BackendResult<CertificateResource> {
        let url = format!("{}/{name}", self.certificates_url(namespace));
        let response = self
            .get_object(&url, "certificate", format!("{namespace}/{name}"))
            .await?;
        let obj: CertificateObject = response.json().await?;
        Ok(obj.into())
    }

    async fn create(&self, resource: &CertificateResource) -> BackendResult<CertificateResource> {
        let url = self.certificates_url(&resource.namespace);
        let response = self
            .request(Method::POST, &url)
            .json(&CertificateObject::from(resource))
            .send()
            .await?;
        let obj: CertificateObject = check(response, "POST", &url).await?.json().await?;
        Ok(obj.into())
    }

    async fn patch(&self, resource: &CertificateResource) -> BackendResult<CertificateResource> {
        let url = format!("{}/{}", self.certificates_url(&resource.namespace), resource.name);
        let body = json!({ "spec": resource.spec });
        debug!(certificate = %resource.key(), "merge-patching certificate spec");
        let response = self
            .request(Method::PATCH, &url)
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(body.to_string())
            .send()
            .await?;
        let obj: CertificateObject = check(response, "PATCH", &url).await?.json().await?;
        Ok(obj.into())
    }
}

#[async_trait]
impl SecretSource for KubeClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> BackendResult<SecretData> {
        let url = format!(
            "{}/{CORE_API}/namespaces/{namespace}/secrets/{name}",
            self.config.api_server
        );
        let response = self
            .get_object(&url, "secret", format!("{namespace}/{name}"))
            .await?;
        decode_secret(response.json().await?)
    }
}
