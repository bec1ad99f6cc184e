//! LXD container host driver
//!
//! Talks to the LXD REST API over HTTPS. Hosts are system containers created
//! from a base image that runs a container engine behind an nginx TLS proxy.
//! The proxy terminates mutual TLS with the per-host certificates pushed by
//! [`LxdDriver::push_auth_certs`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{ClientCredentials, ContainerHostDriver, DriverError};
use crate::config::WorkerConfig;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Directory on the host holding the proxy's TLS files
pub const PROXY_CERT_DIR: &str = "/etc/nginx/certs";

/// uid/gid of the proxy user (www-data)
const PROXY_UID: u32 = 33;

/// Interface whose IPv4 address identifies the host
const PRIMARY_INTERFACE: &str = "eth0";

/// Command restarting the proxy
const RESTART_PROXY_COMMAND: [&str; 3] = ["systemctl", "restart", "nginx"];

/// LXD connection and host template settings
#[derive(Clone)]
pub struct LxdConfig {
    /// LXD API base URL
    pub url: String,
    /// Client certificate followed by key, trusted by LXD
    pub client_identity_pem: Option<Zeroizing<Vec<u8>>>,
    /// Skip verification of the LXD server certificate
    pub insecure: bool,
    /// Image fingerprint hosts are created from
    pub base_image: String,
    /// Bridge the host's eth0 attaches to
    pub bridge: String,
    /// Port of the host's TLS proxy in front of the engine
    pub engine_port: u16,
    /// Server-side wait applied to asynchronous operations
    pub operation_timeout: Duration,
}

impl LxdConfig {
    /// Build from worker settings, reading the client certificate files
    pub fn from_worker_config(config: &WorkerConfig) -> Result<Self, DriverError> {
        let client_identity_pem = match (&config.lxd_client_cert, &config.lxd_client_key) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).map_err(|e| {
                    DriverError::Config(format!("reading {}: {}", cert_path.display(), e))
                })?;
                let key = Zeroizing::new(std::fs::read(key_path).map_err(|e| {
                    DriverError::Config(format!("reading {}: {}", key_path.display(), e))
                })?);
                let mut pem = Vec::with_capacity(cert.len() + key.len() + 1);
                pem.extend_from_slice(&cert);
                pem.push(b'\n');
                pem.extend_from_slice(&key);
                Some(Zeroizing::new(pem))
            }
            _ => None,
        };

        Ok(Self {
            url: config.lxd_url.trim_end_matches('/').to_string(),
            client_identity_pem,
            insecure: config.lxd_insecure,
            base_image: config.lxd_base_image.clone(),
            bridge: config.lxd_bridge.clone(),
            engine_port: config.engine_port,
            operation_timeout: Duration::from_secs(60),
        })
    }
}

/// Generic LXD response envelope
#[derive(Debug, Deserialize)]
struct LxdResponse {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    metadata: Value,
}

/// Background operation as returned by `/1.0/operations/<id>/wait`
#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    status_code: u16,
    #[serde(default)]
    err: String,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerState {
    #[serde(default)]
    network: Option<HashMap<String, NetworkState>>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkState {
    #[serde(default)]
    addresses: Vec<NetworkAddress>,
}

#[derive(Debug, Deserialize)]
struct NetworkAddress {
    family: String,
    address: String,
}

/// Map an LXD failure onto the driver taxonomy
///
/// `status` is `None` for failures reported by a background operation.
fn classify_error(name: &str, status: Option<u16>, message: &str) -> DriverError {
    let lower = message.to_ascii_lowercase();
    if status == Some(409) || lower.contains("already exists") {
        return DriverError::AlreadyExists(name.to_string());
    }
    if status == Some(404) || lower.contains("not found") {
        return DriverError::NotFound(name.to_string());
    }
    if lower.contains("already stopped") || lower.contains("is not running") {
        return DriverError::NotRunning(name.to_string());
    }
    match status {
        Some(status) => DriverError::Api {
            status,
            message: message.to_string(),
        },
        None => DriverError::Operation(message.to_string()),
    }
}

/// First IPv4 address on the primary interface
fn primary_ipv4(state: &ContainerState) -> Option<String> {
    state
        .network
        .as_ref()?
        .get(PRIMARY_INTERFACE)?
        .addresses
        .iter()
        .find(|a| a.family == "inet")
        .map(|a| a.address.clone())
}

fn engine_ping_url(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("https://[{}]:{}/_ping", ip, port)
    } else {
        format!("https://{}:{}/_ping", ip, port)
    }
}

/// Driver backed by the LXD REST API
pub struct LxdDriver {
    config: LxdConfig,
    http: reqwest::Client,
    engines: RwLock<HashMap<String, reqwest::Client>>,
    ip_retry: RetryConfig,
}

impl LxdDriver {
    /// Create a driver, building the LXD API client
    pub fn new(config: LxdConfig) -> Result<Self, DriverError> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(config.insecure);
        if let Some(pem) = &config.client_identity_pem {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| DriverError::Tls(format!("invalid LXD client identity: {}", e)))?;
            builder = builder.identity(identity);
        }
        let http = builder
            .build()
            .map_err(|e| DriverError::Tls(format!("failed to build LXD client: {}", e)))?;

        Ok(Self {
            config,
            http,
            engines: RwLock::new(HashMap::new()),
            ip_retry: RetryConfig::infinite(),
        })
    }

    /// Override the IP discovery retry policy
    pub fn with_ip_retry(mut self, retry: RetryConfig) -> Self {
        self.ip_retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url, path)
    }

    async fn parse_response(
        &self,
        name: &str,
        response: reqwest::Response,
    ) -> Result<LxdResponse, DriverError> {
        let status = response.status();
        let body = response.text().await?;
        let parsed: LxdResponse = serde_json::from_str(&body).map_err(|e| DriverError::Api {
            status: status.as_u16(),
            message: format!("unparseable response ({}): {}", e, body),
        })?;

        if parsed.kind == "error" || !status.is_success() {
            let code = if parsed.error_code != 0 {
                parsed.error_code
            } else {
                status.as_u16()
            };
            return Err(classify_error(name, Some(code), &parsed.error));
        }
        Ok(parsed)
    }

    /// Block until a background operation finishes and return its metadata
    async fn wait_operation(&self, name: &str, response: LxdResponse) -> Result<Value, DriverError> {
        if response.kind != "async" {
            return Ok(response.metadata);
        }

        let url = format!(
            "{}/wait?timeout={}",
            self.url(&response.operation),
            self.config.operation_timeout.as_secs()
        );
        let waited = self.parse_response(name, self.http.get(&url).send().await?).await?;
        let op: Operation = serde_json::from_value(waited.metadata)
            .map_err(|e| DriverError::Operation(format!("malformed operation: {}", e)))?;

        // 200 = Success
        if op.status_code != 200 {
            let message = if op.err.is_empty() {
                format!("operation ended with status {}", op.status_code)
            } else {
                op.err
            };
            return Err(classify_error(name, None, &message));
        }
        Ok(op.metadata.unwrap_or(Value::Null))
    }

    async fn change_state(&self, name: &str, body: Value) -> Result<(), DriverError> {
        let response = self
            .http
            .put(self.url(&format!("/1.0/containers/{}/state", name)))
            .json(&body)
            .send()
            .await?;
        let response = self.parse_response(name, response).await?;
        self.wait_operation(name, response).await?;
        Ok(())
    }

    async fn container_state(&self, name: &str) -> Result<ContainerState, DriverError> {
        let response = self
            .http
            .get(self.url(&format!("/1.0/containers/{}/state", name)))
            .send()
            .await?;
        let response = self.parse_response(name, response).await?;
        serde_json::from_value(response.metadata)
            .map_err(|e| DriverError::Operation(format!("malformed container state: {}", e)))
    }

    async fn current_ip(&self, name: &str) -> Result<String, DriverError> {
        let state = self.container_state(name).await?;
        primary_ipv4(&state).ok_or_else(|| DriverError::NoAddress(name.to_string()))
    }

    async fn push_file(&self, name: &str, file: &str, content: &[u8]) -> Result<(), DriverError> {
        let path = format!("{}/{}", PROXY_CERT_DIR, file);
        let response = self
            .http
            .post(self.url(&format!("/1.0/containers/{}/files", name)))
            .query(&[("path", path.as_str())])
            .header("X-LXD-uid", PROXY_UID.to_string())
            .header("X-LXD-gid", PROXY_UID.to_string())
            .header("X-LXD-mode", "0400")
            .header("X-LXD-type", "file")
            .header("X-LXD-write", "overwrite")
            .body(content.to_vec())
            .send()
            .await?;
        self.parse_response(name, response).await?;
        debug!(host = %name, path = %path, "Pushed file to host");
        Ok(())
    }

    /// Fetch a recorded exec log; empty on failure
    async fn exec_log(&self, path: &str) -> String {
        match self.http.get(self.url(path)).send().await {
            Ok(response) => response.text().await.unwrap_or_default(),
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to fetch exec output");
                String::new()
            }
        }
    }
}

#[async_trait]
impl ContainerHostDriver for LxdDriver {
    async fn ping(&self, name: &str) -> Result<(), DriverError> {
        let client = self
            .engines
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::NoIdentity(name.to_string()))?;

        let ip = self.current_ip(name).await?;
        let response = client
            .get(engine_ping_url(&ip, self.config.engine_port))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(DriverError::Api { status, message });
        }
        Ok(())
    }

    async fn create_container_host(&self, name: &str) -> Result<(), DriverError> {
        debug!(host = %name, image = %self.config.base_image, "Creating container host");

        let body = json!({
            "name": name,
            "source": {
                "type": "image",
                "fingerprint": self.config.base_image,
            },
            "config": {
                "security.nesting": "true",
            },
            "devices": {
                "eth0": {
                    "type": "nic",
                    "nictype": "bridged",
                    "name": PRIMARY_INTERFACE,
                    "parent": self.config.bridge,
                },
            },
        });

        let response = self
            .http
            .post(self.url("/1.0/containers"))
            .json(&body)
            .send()
            .await?;
        let response = self.parse_response(name, response).await?;
        self.wait_operation(name, response).await?;
        info!(host = %name, "Container host created");
        Ok(())
    }

    async fn start_container_host(&self, name: &str) -> Result<(), DriverError> {
        self.change_state(name, json!({"action": "start", "timeout": -1}))
            .await
    }

    async fn stop_container_host(&self, name: &str) -> Result<(), DriverError> {
        self.change_state(name, json!({"action": "stop", "timeout": 30, "force": true}))
            .await
    }

    async fn delete_container_host(&self, name: &str) -> Result<(), DriverError> {
        let response = self
            .http
            .delete(self.url(&format!("/1.0/containers/{}", name)))
            .send()
            .await?;
        let response = self.parse_response(name, response).await?;
        self.wait_operation(name, response).await?;
        info!(host = %name, "Container host deleted");
        Ok(())
    }

    async fn get_container_host_ip(&self, name: &str) -> Result<String, DriverError> {
        // State errors are permanent; only a missing address is retried
        let found = retry_with_backoff(&self.ip_retry, "get_container_host_ip", || async move {
            match self.container_state(name).await {
                Ok(state) => primary_ipv4(&state)
                    .map(Ok)
                    .ok_or_else(|| DriverError::NoAddress(name.to_string())),
                Err(e) => Ok(Err(e)),
            }
        })
        .await?;
        let ip = found?;
        debug!(host = %name, ip = %ip, "Container host address discovered");
        Ok(ip)
    }

    async fn push_auth_certs(
        &self,
        name: &str,
        root_cert_pem: &str,
        server_key_pem: &str,
        server_cert_pem: &str,
    ) -> Result<(), DriverError> {
        self.push_file(name, "ca.pem", root_cert_pem.as_bytes()).await?;
        self.push_file(name, "server-key.pem", server_key_pem.as_bytes())
            .await?;
        self.push_file(name, "server.pem", server_cert_pem.as_bytes())
            .await
    }

    async fn restart_proxy(&self, name: &str) -> Result<(), DriverError> {
        let body = json!({
            "command": RESTART_PROXY_COMMAND,
            "environment": {},
            "interactive": false,
            "wait-for-websocket": false,
            "record-output": true,
        });
        let response = self
            .http
            .post(self.url(&format!("/1.0/containers/{}/exec", name)))
            .json(&body)
            .send()
            .await?;
        let response = self.parse_response(name, response).await?;
        let metadata = self.wait_operation(name, response).await?;

        let code = metadata.get("return").and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            let stderr = match metadata.pointer("/output/2").and_then(Value::as_str) {
                Some(path) => self.exec_log(path).await,
                None => String::new(),
            };
            return Err(DriverError::CommandFailed {
                code,
                stderr: stderr.trim().to_string(),
            });
        }
        info!(host = %name, "Proxy restarted");
        Ok(())
    }

    async fn use_certs(
        &self,
        name: &str,
        credentials: ClientCredentials,
    ) -> Result<(), DriverError> {
        let root = reqwest::Certificate::from_pem(credentials.root_cert_pem.as_bytes())
            .map_err(|e| DriverError::Tls(format!("invalid host CA: {}", e)))?;
        let identity = reqwest::Identity::from_pem(&credentials.identity_pem())
            .map_err(|e| DriverError::Tls(format!("invalid client identity: {}", e)))?;

        let client = reqwest::Client::builder()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root)
            .identity(identity)
            .build()
            .map_err(|e| DriverError::Tls(format!("failed to build engine client: {}", e)))?;

        self.engines.write().await.insert(name.to_string(), client);
        debug!(host = %name, "Installed engine client identity");
        Ok(())
    }

    async fn forget_host(&self, name: &str) {
        if self.engines.write().await.remove(name).is_some() {
            debug!(host = %name, "Dropped engine client identity");
        }
    }
}
