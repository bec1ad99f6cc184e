//! Secret storage for per-host certificate material
//!
//! Each provisioned host has one entry, keyed by host name, holding the six
//! PEM fields of its certificate bundle. The field set is fixed; an entry
//! missing any of them is reported as malformed rather than guessed at.

pub mod vault;

use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::ClientCredentials;
use crate::pki::CertificateBundle;

pub use vault::{VaultConfig, VaultStore};

/// Secret store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// Nothing is stored under the key
    #[error("no secret stored at '{0}'")]
    NotFound(String),

    /// The stored entry lacks a required field or is not valid JSON
    #[error("malformed secret at '{key}': {reason}")]
    Malformed {
        /// Key of the entry
        key: String,
        /// What is wrong with it
        reason: String,
    },

    /// The store rejected the request
    #[error("secret store error ({status}): {message}")]
    Api {
        /// HTTP status
        status: u16,
        /// Response body
        message: String,
    },

    /// Transport failure
    #[error("secret store unreachable: {0}")]
    Http(String),
}

impl From<reqwest::Error> for SecretError {
    fn from(e: reqwest::Error) -> Self {
        SecretError::Http(e.to_string())
    }
}

/// Stored TLS material of one host
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSecret {
    /// Root CA private key
    pub root_key: String,
    /// Root CA certificate
    pub root_cert: String,
    /// Proxy server key
    pub server_key: String,
    /// Proxy server certificate
    pub server_cert: String,
    /// Worker client key
    pub client_key: String,
    /// Worker client certificate
    pub client_cert: String,
}

impl TlsSecret {
    /// Identity the worker uses to reach this host's engine
    pub fn client_credentials(&self) -> ClientCredentials {
        ClientCredentials::new(
            self.client_key.clone(),
            self.client_cert.clone(),
            self.root_cert.clone(),
        )
    }
}

impl From<&CertificateBundle> for TlsSecret {
    fn from(bundle: &CertificateBundle) -> Self {
        Self {
            root_key: bundle.root_key_pem.clone(),
            root_cert: bundle.root_cert_pem.clone(),
            server_key: bundle.server_key_pem.clone(),
            server_cert: bundle.server_cert_pem.clone(),
            client_key: bundle.client_key_pem.clone(),
            client_cert: bundle.client_cert_pem.clone(),
        }
    }
}

impl fmt::Debug for TlsSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSecret")
            .field("root_cert", &self.root_cert)
            .field("server_cert", &self.server_cert)
            .field("client_cert", &self.client_cert)
            .field("keys", &"[redacted]")
            .finish()
    }
}

/// Key-addressed persistence of certificate material
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store (or overwrite) the entry for `key`
    async fn push(&self, key: &str, secret: &TlsSecret) -> Result<(), SecretError>;

    /// Read the entry for `key`; [`SecretError::NotFound`] if absent
    async fn get(&self, key: &str) -> Result<TlsSecret, SecretError>;

    /// Remove the entry for `key`; absent entries are not an error
    async fn delete(&self, key: &str) -> Result<(), SecretError>;
}
