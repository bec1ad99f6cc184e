//! Service registry client
//!
//! The worker publishes itself and every host it provisioned as services with
//! TTL health checks, and keeps small metadata records in the registry's
//! key/value store.

pub mod consul;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

pub use consul::{ConsulClient, ConsulConfig};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The TTL check (or its service) is no longer known to the registry
    #[error("check missing: {0}")]
    CheckMissing(String),

    /// The registry rejected a request
    #[error("registry error ({status}): {message}")]
    Api {
        /// HTTP status
        status: u16,
        /// Response body
        message: String,
    },

    /// Transport failure
    #[error("registry unreachable: {0}")]
    Http(String),

    /// A response could not be decoded
    #[error("undecodable registry response: {0}")]
    Decode(String),
}

impl RegistryError {
    /// Whether the error means the check must be re-registered
    pub fn is_check_missing(&self) -> bool {
        matches!(self, RegistryError::CheckMissing(_))
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        RegistryError::Http(e.to_string())
    }
}

/// TTL check status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Healthy
    Passing,
    /// Degraded
    Warning,
    /// Unhealthy
    Critical,
}

impl HealthStatus {
    /// Registry wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service with a TTL health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    /// Unique service ID
    pub id: String,
    /// Service name shared by all instances
    pub name: String,
    /// Service tags
    pub tags: Vec<String>,
    /// Advertised address
    pub address: String,
    /// Advertised port
    pub port: u16,
    /// Check TTL
    pub ttl: Duration,
}

impl ServiceRegistration {
    /// ID of the TTL check attached to this service
    pub fn check_id(&self) -> String {
        check_id(&self.id)
    }
}

/// ID of the TTL check the registry attaches to `service_id`
pub fn check_id(service_id: &str) -> String {
    format!("service:{}", service_id)
}

/// One key/value entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Full key
    pub key: String,
    /// Raw value
    pub value: Vec<u8>,
}

/// Operations against the service registry
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Register (or replace) a service and its TTL check
    async fn register_service(&self, registration: &ServiceRegistration)
        -> Result<(), RegistryError>;

    /// Remove a service and its checks; unknown services are not an error
    async fn deregister_service(&self, service_id: &str) -> Result<(), RegistryError>;

    /// Refresh a TTL check; [`RegistryError::CheckMissing`] if the check is gone
    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: HealthStatus,
    ) -> Result<(), RegistryError>;

    /// Read a raw value; `None` if the key is absent
    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, RegistryError>;

    /// Write a raw value
    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), RegistryError>;

    /// All entries under a prefix; empty if none
    async fn kv_list(&self, prefix: &str) -> Result<Vec<KvEntry>, RegistryError>;

    /// Delete a key; absent keys are not an error
    async fn kv_delete(&self, key: &str) -> Result<(), RegistryError>;
}
