//! Windlass - worker agent for mTLS-secured container hosts
//!
//! A worker provisions isolated container hosts on request, gives each one a
//! private certificate authority so the worker and the host's container
//! engine authenticate each other, and keeps every host (and itself)
//! visible in the service registry through renewable TTL health checks.
//!
//! # Architecture
//!
//! ```text
//! HTTP (api) -> provision -> driver    (create, start, discover IP)
//!                         -> pki       (per-host CA, server + client leaves)
//!                         -> driver    (push certs, restart proxy, use certs)
//!                         -> secrets   (persist bundle)
//!                         -> health    (register project, renewal loop)
//! ```
//!
//! All collaborators are explicitly constructed handles injected where they
//! are used; there is no global connection state.
//!
//! # Modules
//!
//! - [`api`] - axum router, shared-secret middleware, project handlers
//! - [`provision`] - the provisioning pipeline and its failure policy
//! - [`health`] - worker and project TTL registrations, self-healing, re-adoption
//! - [`pki`] - per-host certificate issuance
//! - [`driver`] - container host driver contract and the LXD driver
//! - [`secrets`] - secret store contract and the Vault store
//! - [`registry`] - service registry contract and the Consul client
//! - [`project`] - project identities and request bodies
//! - [`config`] - command line and environment settings
//! - [`telemetry`] - tracing subscriber setup
//! - [`metrics`] - Prometheus metrics
//! - [`retry`] - retry with backoff
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pki;
pub mod project;
pub mod provision;
pub mod registry;
pub mod retry;
pub mod secrets;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
