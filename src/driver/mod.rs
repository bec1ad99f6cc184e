//! Container host drivers
//!
//! A driver performs imperative operations against container hosts: create,
//! start, stop and delete them, discover their address, push the proxy's TLS
//! material, restart the proxy and ping the host's container engine over
//! mutual TLS.
//!
//! One driver instance serves every host. Every call names the host it acts
//! on, and the client identity installed by [`ContainerHostDriver::use_certs`]
//! is kept per host.

pub mod lxd;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{ConfigError, WorkerConfig, DRIVER_LXD};
use crate::pki::CertificateBundle;

pub use lxd::{LxdConfig, LxdDriver};

/// Errors returned by container host drivers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// A host with this name already exists
    #[error("container host already exists: {0}")]
    AlreadyExists(String),

    /// No host with this name exists
    #[error("container host not found: {0}")]
    NotFound(String),

    /// The host is already stopped
    #[error("container host is not running: {0}")]
    NotRunning(String),

    /// The caller's deadline expired before the operation finished
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A command run on the host exited unsuccessfully
    #[error("command exited with status {code}: {stderr}")]
    CommandFailed {
        /// Exit status
        code: i64,
        /// Captured standard error
        stderr: String,
    },

    /// The host has no IPv4 address yet
    #[error("no IPv4 address for {0}")]
    NoAddress(String),

    /// No client identity has been installed for the host
    #[error("no client identity installed for {0}")]
    NoIdentity(String),

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// The driver API rejected a request
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status or API error code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Transport failure talking to the driver API or the engine
    #[error("HTTP error: {0}")]
    Http(String),

    /// An asynchronous operation finished unsuccessfully
    #[error("operation failed: {0}")]
    Operation(String),

    /// Driver settings are unusable
    #[error("driver configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        DriverError::Http(e.to_string())
    }
}

/// Client identity used to reach one host's container engine
#[derive(Clone)]
pub struct ClientCredentials {
    /// Client leaf private key (PEM)
    pub client_key_pem: Zeroizing<String>,
    /// Client leaf certificate (PEM)
    pub client_cert_pem: String,
    /// The host's root CA, the only trust anchor for its engine
    pub root_cert_pem: String,
}

impl ClientCredentials {
    /// Create credentials from PEM strings
    pub fn new(
        client_key_pem: impl Into<String>,
        client_cert_pem: impl Into<String>,
        root_cert_pem: impl Into<String>,
    ) -> Self {
        Self {
            client_key_pem: Zeroizing::new(client_key_pem.into()),
            client_cert_pem: client_cert_pem.into(),
            root_cert_pem: root_cert_pem.into(),
        }
    }

    /// Certificate followed by key, as expected by `reqwest::Identity::from_pem`
    pub fn identity_pem(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.client_cert_pem.len() + self.client_key_pem.len() + 1);
        buf.extend_from_slice(self.client_cert_pem.as_bytes());
        if !self.client_cert_pem.ends_with('\n') {
            buf.push(b'\n');
        }
        buf.extend_from_slice(self.client_key_pem.as_bytes());
        Zeroizing::new(buf)
    }
}

impl From<&CertificateBundle> for ClientCredentials {
    fn from(bundle: &CertificateBundle) -> Self {
        Self::new(
            bundle.client_key_pem.clone(),
            bundle.client_cert_pem.clone(),
            bundle.root_cert_pem.clone(),
        )
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_cert_pem", &self.client_cert_pem)
            .field("root_cert_pem", &self.root_cert_pem)
            .field("client_key_pem", &"[redacted]")
            .finish()
    }
}

/// Operations against container hosts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerHostDriver: Send + Sync {
    /// Ping the host's container engine over mutual TLS
    async fn ping(&self, name: &str) -> Result<(), DriverError>;

    /// Create a host; fails with [`DriverError::AlreadyExists`] if the name is taken
    async fn create_container_host(&self, name: &str) -> Result<(), DriverError>;

    /// Start a host
    async fn start_container_host(&self, name: &str) -> Result<(), DriverError>;

    /// Stop a host
    async fn stop_container_host(&self, name: &str) -> Result<(), DriverError>;

    /// Delete a stopped host
    async fn delete_container_host(&self, name: &str) -> Result<(), DriverError>;

    /// Wait until the host reports an IPv4 address on its primary interface
    ///
    /// Retries internally; the caller bounds the wait with a deadline.
    async fn get_container_host_ip(&self, name: &str) -> Result<String, DriverError>;

    /// Overwrite the proxy's CA, server key and server certificate on the host
    async fn push_auth_certs(
        &self,
        name: &str,
        root_cert_pem: &str,
        server_key_pem: &str,
        server_cert_pem: &str,
    ) -> Result<(), DriverError>;

    /// Restart the host's TLS proxy
    async fn restart_proxy(&self, name: &str) -> Result<(), DriverError>;

    /// Install the client identity used for subsequent calls to this host's engine
    async fn use_certs(&self, name: &str, credentials: ClientCredentials)
        -> Result<(), DriverError>;

    /// Drop any client identity held for the host
    async fn forget_host(&self, name: &str);
}

/// Build the driver selected by the configuration
///
/// An unsupported driver type is reported as a configuration error so the
/// worker can refuse to start.
pub fn build_driver(config: &WorkerConfig) -> Result<Arc<dyn ContainerHostDriver>, ConfigError> {
    match config.driver.as_str() {
        DRIVER_LXD => {
            let lxd_config = LxdConfig::from_worker_config(config).map_err(|e| {
                ConfigError::Invalid {
                    field: "driver",
                    reason: e.to_string(),
                }
            })?;
            let driver = LxdDriver::new(lxd_config).map_err(|e| ConfigError::Invalid {
                field: "driver",
                reason: e.to_string(),
            })?;
            Ok(Arc::new(driver))
        }
        other => Err(ConfigError::UnsupportedDriver(other.to_string())),
    }
}

/// Wraps a mock driver, making IP discovery hang forever
#[cfg(test)]
pub(crate) struct HangingIp(pub(crate) MockContainerHostDriver);

#[cfg(test)]
#[async_trait]
impl ContainerHostDriver for HangingIp {
    async fn ping(&self, name: &str) -> Result<(), DriverError> {
        self.0.ping(name).await
    }
    async fn create_container_host(&self, name: &str) -> Result<(), DriverError> {
        self.0.create_container_host(name).await
    }
    async fn start_container_host(&self, name: &str) -> Result<(), DriverError> {
        self.0.start_container_host(name).await
    }
    async fn stop_container_host(&self, name: &str) -> Result<(), DriverError> {
        self.0.stop_container_host(name).await
    }
    async fn delete_container_host(&self, name: &str) -> Result<(), DriverError> {
        self.0.delete_container_host(name).await
    }
    async fn get_container_host_ip(&self, _name: &str) -> Result<String, DriverError> {
        std::future::pending().await
    }
    async fn push_auth_certs(
        &self,
        name: &str,
        root_cert_pem: &str,
        server_key_pem: &str,
        server_cert_pem: &str,
    ) -> Result<(), DriverError> {
        self.0
            .push_auth_certs(name, root_cert_pem, server_key_pem, server_cert_pem)
            .await
    }
    async fn restart_proxy(&self, name: &str) -> Result<(), DriverError> {
        self.0.restart_proxy(name).await
    }
    async fn use_certs(
        &self,
        name: &str,
        credentials: ClientCredentials,
    ) -> Result<(), DriverError> {
        self.0.use_certs(name, credentials).await
    }
    async fn forget_host(&self, name: &str) {
        self.0.forget_host(name).await
    }
}
