//! Error types for the Windlass worker
//!
//! The variants mirror how a failure is surfaced to the request layer:
//! validation failures are rejected before any side effect, a taken host
//! name is a conflict, and any pipeline failure names the step that broke.
//! Registry desync is never surfaced here; the health registry heals it
//! internally.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// One stage of the host provisioning pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionStep {
    /// Creating the container host
    CreateHost,
    /// Starting the container host
    StartHost,
    /// Waiting for the host to report an IPv4 address
    DiscoverIp,
    /// Minting the per-host CA and leaf certificates
    IssueCertificates,
    /// Writing the server certificates onto the host
    PushCertificates,
    /// Restarting the host's reverse proxy
    RestartProxy,
    /// Switching the driver to the new client identity
    InstallClientIdentity,
    /// Persisting the certificate bundle in the secret store
    StoreCertificates,
    /// Registering the project's TTL health check
    RegisterProject,
}

impl ProvisionStep {
    /// Stable label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::CreateHost => "create_host",
            ProvisionStep::StartHost => "start_host",
            ProvisionStep::DiscoverIp => "discover_ip",
            ProvisionStep::IssueCertificates => "issue_certificates",
            ProvisionStep::PushCertificates => "push_certificates",
            ProvisionStep::RestartProxy => "restart_proxy",
            ProvisionStep::InstallClientIdentity => "install_client_identity",
            ProvisionStep::StoreCertificates => "store_certificates",
            ProvisionStep::RegisterProject => "register_project",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            ProvisionStep::CreateHost => "failed to create container host",
            ProvisionStep::StartHost => "failed to start container host",
            ProvisionStep::DiscoverIp => "failed to get container host IP",
            ProvisionStep::IssueCertificates => "failed to issue TLS certificates",
            ProvisionStep::PushCertificates => "failed to push TLS certificates to host",
            ProvisionStep::RestartProxy => "failed to restart host proxy",
            ProvisionStep::InstallClientIdentity => "failed to install client TLS identity",
            ProvisionStep::StoreCertificates => "failed to store TLS certificates",
            ProvisionStep::RegisterProject => "failed to register project health check",
        };
        f.write_str(description)
    }
}

/// Main error type for worker operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or too long project identity
    #[error("validation error: {0}")]
    Validation(String),

    /// The container host already exists
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request lacks a valid auth token
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A collaborator is temporarily unreachable or not ready
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    /// A provisioning step failed after its own retries were exhausted
    #[error("{step}: {message}")]
    Provisioning {
        /// The pipeline step that failed
        step: ProvisionStep,
        /// Underlying cause
        message: String,
    },

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a forbidden error with the given message
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a provisioning error for a pipeline step
    pub fn provisioning(step: ProvisionStep, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            step,
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The pipeline step that failed, if this is a provisioning error
    pub fn step(&self) -> Option<ProvisionStep> {
        match self {
            Error::Provisioning { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// HTTP status reported to the request layer
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Provisioning { .. } | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "content": self.to_string(),
            "time": chrono::Utc::now().to_rfc3339(),
        });
        (status, Json(body)).into_response()
    }
}
