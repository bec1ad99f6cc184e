//! Worker process configuration
//!
//! Every setting is a command line flag that can also be supplied through a
//! `WINDLASS_*` environment variable. Tokens are never printed: the `Debug`
//! implementation redacts them so the whole config can be logged at startup.

use std::fmt;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::provision::FailurePolicy;
use crate::telemetry::LogFormat;

/// Only driver type currently implemented
pub const DRIVER_LXD: &str = "lxd";

/// Configuration errors, reported before the worker accepts requests
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The configured driver type has no implementation
    #[error("unsupported container host driver '{0}'")]
    UnsupportedDriver(String),

    /// A setting has an unusable value
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Flag name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl From<ConfigError> for crate::Error {
    fn from(e: ConfigError) -> Self {
        crate::Error::config(e.to_string())
    }
}

/// Windlass worker settings
#[derive(Parser, Clone)]
#[command(name = "windlass-worker", version, about, long_about = None)]
pub struct WorkerConfig {
    /// Address the HTTP server binds to
    #[arg(long, env = "WINDLASS_HTTP_ADDRESS", default_value = "0.0.0.0")]
    pub http_address: String,

    /// Port the HTTP server binds to and advertises
    #[arg(long, env = "WINDLASS_PORT", default_value_t = 9786)]
    pub port: u16,

    /// Hostname used in the worker's service ID (defaults to the system hostname)
    #[arg(long, env = "WINDLASS_HOSTNAME")]
    pub hostname: Option<String>,

    /// Address advertised to the registry (defaults to the hostname)
    #[arg(long, env = "WINDLASS_ADVERTISE_ADDRESS")]
    pub advertise_address: Option<String>,

    /// Consul agent URL
    #[arg(long, env = "WINDLASS_CONSUL_URL", default_value = "http://127.0.0.1:8500")]
    pub consul_url: String,

    /// Consul ACL token
    #[arg(long, env = "WINDLASS_CONSUL_TOKEN")]
    pub consul_token: Option<String>,

    /// KV prefix holding the cluster shared secret at `<path>/secret`
    #[arg(long, env = "WINDLASS_CONSUL_PATH", default_value = "windlass")]
    pub consul_path: String,

    /// TTL of the worker health check in seconds (projects use 5x this)
    #[arg(long, env = "WINDLASS_WORKER_TTL_SECS", default_value_t = 10)]
    pub worker_ttl_secs: u64,

    /// Vault URL
    #[arg(long, env = "WINDLASS_VAULT_URL", default_value = "http://127.0.0.1:8200")]
    pub vault_url: String,

    /// Vault token
    #[arg(long, env = "WINDLASS_VAULT_TOKEN")]
    pub vault_token: Option<String>,

    /// Vault path prefix for per-host certificate bundles
    #[arg(long, env = "WINDLASS_VAULT_PATH", default_value = "secret/windlass/")]
    pub vault_path: String,

    /// Container host driver type
    #[arg(long, env = "WINDLASS_DRIVER", default_value = DRIVER_LXD)]
    pub driver: String,

    /// LXD REST API URL
    #[arg(long, env = "WINDLASS_LXD_URL", default_value = "https://127.0.0.1:8443")]
    pub lxd_url: String,

    /// PEM file with the client certificate trusted by LXD
    #[arg(long, env = "WINDLASS_LXD_CLIENT_CERT")]
    pub lxd_client_cert: Option<std::path::PathBuf>,

    /// PEM file with the key for `--lxd-client-cert`
    #[arg(long, env = "WINDLASS_LXD_CLIENT_KEY")]
    pub lxd_client_key: Option<std::path::PathBuf>,

    /// Skip verification of the LXD server certificate
    #[arg(long, env = "WINDLASS_LXD_INSECURE")]
    pub lxd_insecure: bool,

    /// Image fingerprint or alias new hosts are created from
    #[arg(long, env = "WINDLASS_LXD_BASE_IMAGE", default_value = "windlass-base")]
    pub lxd_base_image: String,

    /// Bridge the host's eth0 is attached to
    #[arg(long, env = "WINDLASS_LXD_BRIDGE", default_value = "windlassbr0")]
    pub lxd_bridge: String,

    /// Port the host's TLS proxy exposes the container engine on
    #[arg(long, env = "WINDLASS_ENGINE_PORT", default_value_t = 443)]
    pub engine_port: u16,

    /// Deadline for a whole provisioning run in seconds
    #[arg(long, env = "WINDLASS_PROVISION_TIMEOUT_SECS", default_value_t = 20)]
    pub provision_timeout_secs: u64,

    /// What to do with a host whose provisioning failed midway
    #[arg(long, env = "WINDLASS_FAILURE_POLICY", value_enum, default_value_t = FailurePolicy::Destroy)]
    pub failure_policy: FailurePolicy,

    /// Log output format
    #[arg(long, env = "WINDLASS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver != DRIVER_LXD {
            return Err(ConfigError::UnsupportedDriver(self.driver.clone()));
        }
        if self.worker_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "worker-ttl-secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.provision_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "provision-timeout-secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.resolved_hostname().trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "hostname",
                reason: "must not be empty".to_string(),
            });
        }
        if self.lxd_client_cert.is_some() != self.lxd_client_key.is_some() {
            return Err(ConfigError::Invalid {
                field: "lxd-client-cert",
                reason: "client certificate and key must be given together".to_string(),
            });
        }
        Ok(())
    }

    /// Configured hostname, else the system hostname, else `localhost`
    pub fn resolved_hostname(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Address registered with Consul for the worker service
    pub fn resolved_advertise_address(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| self.resolved_hostname())
    }

    /// Service ID of this worker: `windlass-worker@<hostname>:<port>`
    pub fn worker_id(&self) -> String {
        format!("windlass-worker@{}:{}", self.resolved_hostname(), self.port)
    }

    /// TTL of the worker health check
    pub fn worker_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_ttl_secs)
    }

    /// Deadline for one provisioning run
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    /// KV key holding the cluster shared secret
    pub fn shared_secret_key(&self) -> String {
        format!("{}/secret", self.consul_path.trim_end_matches('/'))
    }
}

fn redact(value: &Option<String>) -> &'static str {
    match value {
        Some(_) => "[redacted]",
        None => "<unset>",
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("http_address", &self.http_address)
            .field("port", &self.port)
            .field("hostname", &self.hostname)
            .field("advertise_address", &self.advertise_address)
            .field("consul_url", &self.consul_url)
            .field("consul_token", &redact(&self.consul_token))
            .field("consul_path", &self.consul_path)
            .field("worker_ttl_secs", &self.worker_ttl_secs)
            .field("vault_url", &self.vault_url)
            .field("vault_token", &redact(&self.vault_token))
            .field("vault_path", &self.vault_path)
            .field("driver", &self.driver)
            .field("lxd_url", &self.lxd_url)
            .field("lxd_client_cert", &self.lxd_client_cert)
            .field("lxd_client_key", &self.lxd_client_key)
            .field("lxd_insecure", &self.lxd_insecure)
            .field("lxd_base_image", &self.lxd_base_image)
            .field("lxd_bridge", &self.lxd_bridge)
            .field("engine_port", &self.engine_port)
            .field("provision_timeout_secs", &self.provision_timeout_secs)
            .field("failure_policy", &self.failure_policy)
            .field("log_format", &self.log_format)
            .finish()
    }
}
