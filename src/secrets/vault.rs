//! Vault-backed secret store
//!
//! Uses the KV (version 1) HTTP API: one logical path per host under the
//! configured prefix, authenticated with `X-Vault-Token`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{SecretError, SecretStore, TlsSecret};
use crate::config::WorkerConfig;

/// Vault connection settings
#[derive(Clone)]
pub struct VaultConfig {
    /// Vault base URL
    pub url: String,
    /// Token sent as `X-Vault-Token`
    pub token: Option<String>,
    /// Path prefix, e.g. `secret/windlass/`
    pub path: String,
}

impl VaultConfig {
    /// Build from worker settings
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            url: config.vault_url.trim_end_matches('/').to_string(),
            token: config.vault_token.clone(),
            path: config.vault_path.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ReadResponse {
    data: Option<serde_json::Value>,
}

/// Secret store backed by Vault
pub struct VaultStore {
    config: VaultConfig,
    http: reqwest::Client,
}

impl VaultStore {
    /// Create a store
    pub fn new(config: VaultConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, key: &str) -> String {
        let prefix = self.config.path.trim_start_matches('/');
        format!("{}/v1/{}{}", self.config.url, prefix, key)
    }

    fn request(&self, method: reqwest::Method, key: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.url(key));
        match &self.config.token {
            Some(token) => builder.header("X-Vault-Token", token),
            None => builder,
        }
    }
}

async fn api_error(response: reqwest::Response) -> SecretError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    SecretError::Api { status, message }
}

#[async_trait]
impl SecretStore for VaultStore {
    async fn push(&self, key: &str, secret: &TlsSecret) -> Result<(), SecretError> {
        let response = self
            .request(reqwest::Method::PUT, key)
            .json(secret)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        debug!(key = %key, "Stored TLS secret");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<TlsSecret, SecretError> {
        let response = self.request(reqwest::Method::GET, key).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let body: ReadResponse = response.json().await.map_err(|e| SecretError::Malformed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let data = body
            .data
            .ok_or_else(|| SecretError::NotFound(key.to_string()))?;
        serde_json::from_value(data).map_err(|e| SecretError::Malformed {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        let response = self.request(reqwest::Method::DELETE, key).send().await?;
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(api_error(response).await)
    }
}
