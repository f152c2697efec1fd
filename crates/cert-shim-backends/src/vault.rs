//! Vault KV v2 client
//!
//! Authenticates with AppRole and caches the client token until its lease
//! runs out. The first login happens in [`VaultClient::connect`], so bad
//! credentials surface at startup.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::BackendError;
use crate::http::{check, http_client, REQUEST_TIMEOUT};
use crate::secrets::{SecretStore, StoreMetadata, StorePayload};
use crate::BackendResult;

/// Environment variable holding the Vault address.
pub const ADDR_ENV: &str = "VAULT_ADDR";
/// Environment variable holding the AppRole role id.
pub const ROLE_ID_ENV: &str = "VAULT_ROLE_ID";
/// Environment variable holding the AppRole secret id.
pub const SECRET_ID_ENV: &str = "VAULT_SECRET_ID";

/// Vault connection settings.
#[derive(Clone)]
pub struct VaultConfig {
    pub address: String,
    pub kv_engine: String,
    pub role_id: String,
    pub secret_id: String,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("address", &self.address)
            .field("kv_engine", &self.kv_engine)
            .finish_non_exhaustive()
    }
}

impl VaultConfig {
    /// Read address and AppRole credentials from the process environment.
    pub fn from_env(kv_engine: &str) -> BackendResult<Self> {
        Self::from_env_with(kv_engine, |key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with `env` for lookups.
    pub fn from_env_with<F>(kv_engine: &str, env: F) -> BackendResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if kv_engine.trim().is_empty() {
            return Err(BackendError::Config(
                "no value given for --vault-kv-engine".to_string(),
            ));
        }
        let required = |key: &str| {
            env(key).filter(|v| !v.is_empty()).ok_or_else(|| {
                BackendError::Config(format!("missing required environment variable: {key}"))
            })
        };
        Ok(VaultConfig {
            address: required(ADDR_ENV)?.trim_end_matches('/').to_string(),
            kv_engine: kv_engine.trim_matches('/').to_string(),
            role_id: required(ROLE_ID_ENV)?,
            secret_id: required(SECRET_ID_ENV)?,
        })
    }
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    valid_until: Instant,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    lease_duration: u64,
}

#[derive(Deserialize)]
struct DataResponse {
    data: DataEnvelope,
}

#[derive(Deserialize)]
struct DataEnvelope {
    #[serde(default)]
    data: Option<StorePayload>,
}

#[derive(Deserialize)]
struct MetadataResponse {
    data: MetadataEnvelope,
}

#[derive(Deserialize)]
struct MetadataEnvelope {
    #[serde(default)]
    custom_metadata: Option<StoreMetadata>,
}

/// Secret store backed by a Vault KV v2 engine.
pub struct VaultClient {
    config: VaultConfig,
    http_client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl VaultClient {
    /// Build the client and log in once.
    pub async fn connect(config: VaultConfig) -> BackendResult<Self> {
        Self::connect_with_timeout(config, REQUEST_TIMEOUT).await
    }

    /// Like [`VaultClient::connect`] with a custom per-request timeout.
    pub async fn connect_with_timeout(config: VaultConfig, timeout: Duration) -> BackendResult<Self> {
        let http_client = http_client(None, timeout)?;
        let client = VaultClient {
            config,
            http_client,
            token: Mutex::new(None),
        };
        client.client_token().await?;
        info!(address = %client.config.address, engine = %client.config.kv_engine, "authenticated against vault");
        Ok(client)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Valid client token, logging in again if the cached one expired.
    async fn client_token(&self) -> BackendResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(t) = cached.as_ref().filter(|t| t.valid_until > Instant::now()) {
            return Ok(t.token.clone());
        }

        let url = self.url("auth/approle/login");
        let response = self
            .http_client
            .post(&url)
            .json(&json!({
                "role_id": self.config.role_id,
                "secret_id": self.config.secret_id,
            }))
            .send()
            .await?;
        let response = match check(response, "POST", &url).await {
            Ok(r) => r,
            Err(e) => return Err(BackendError::Auth(format!("while obtaining approle token: {e}"))),
        };
        let login: LoginResponse = response.json().await?;
        debug!(lease_secs = login.auth.lease_duration, "obtained approle token");

        let token = login.auth.client_token;
        *cached = Some(CachedToken {
            token: token.clone(),
            valid_until: Instant::now() + Duration::from_secs(login.auth.lease_duration),
        });
        Ok(token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.address, path.trim_start_matches('/'))
    }

    fn data_url(&self, path: &str) -> String {
        self.url(&format!("{}/data/{}", self.config.kv_engine, path.trim_start_matches('/')))
    }

    fn metadata_url(&self, path: &str) -> String {
        self.url(&format!("{}/metadata/{}", self.config.kv_engine, path.trim_start_matches('/')))
    }

    async fn request(&self, method: Method, url: &str) -> BackendResult<RequestBuilder> {
        let token = self.client_token().await?;
        Ok(self
            .http_client
            .request(method, url)
            .header("X-Vault-Token", token))
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    fn address(&self) -> &str {
        &self.config.address
    }

    async fn read(&self, path: &str) -> BackendResult<Option<StorePayload>> {
        let url = self.data_url(path);
        let response = self.request(Method::GET, &url).await?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: DataResponse = check(response, "GET", &url).await?.json().await?;
        Ok(body.data.data)
    }

    async fn write(&self, path: &str, payload: &StorePayload) -> BackendResult<()> {
        let url = self.data_url(path);
        let response = self
            .request(Method::POST, &url)
            .await?
            .json(&json!({ "data": payload }))
            .send()
            .await?;
        check(response, "POST", &url).await?;
        Ok(())
    }

    async fn read_metadata(&self, path: &str) -> BackendResult<StoreMetadata> {
        let url = self.metadata_url(path);
        let response = self.request(Method::GET, &url).await?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(StoreMetadata::new());
        }
        let body: MetadataResponse = check(response, "GET", &url).await?.json().await?;
        Ok(body.data.custom_metadata.unwrap_or_default())
    }

    async fn patch_metadata(&self, path: &str, fields: &StoreMetadata) -> BackendResult<()> {
        let url = self.metadata_url(path);
        let body: Value = json!({ "custom_metadata": fields });
        let response = self
            .request(Method::PATCH, &url)
            .await?
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(body.to_string())
            .send()
            .await?;
        check(response, "PATCH", &url).await?;
        Ok(())
    }
}
