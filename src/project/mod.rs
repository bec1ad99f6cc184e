//! Project descriptors accepted by the request layer
//!
//! A project is a namespace/name pair plus the containers that will later run
//! on its host. The pair is the only part validated here: it becomes the
//! container host's name, so it must be a DNS-label-style identifier.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest allowed `namespace-name` host name
pub const MAX_HOST_NAME_LEN: usize = 62;

/// Why a project identity was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The host name contains a disallowed character or has a bad first/last char
    #[error("project name bad format: {0}")]
    InvalidFormat(String),

    /// The host name exceeds [`MAX_HOST_NAME_LEN`]
    #[error("project name too long: {len} > {max}", max = MAX_HOST_NAME_LEN)]
    NameTooLong {
        /// Length of the rejected host name
        len: usize,
    },
}

impl From<IdentityError> for crate::Error {
    fn from(e: IdentityError) -> Self {
        crate::Error::validation(e.to_string())
    }
}

/// Validated `{namespace, name}` pair
///
/// Construct through [`HostIdentity::new`]; a value of this type always has a
/// valid host name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostIdentity {
    namespace: String,
    name: String,
}

impl HostIdentity {
    /// Validate and build an identity
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            namespace: namespace.into(),
            name: name.into(),
        };
        validate_host_name(&identity.host_name())?;
        Ok(identity)
    }

    /// Project namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Project name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Container host name: `<namespace>-<name>`
    pub fn host_name(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Validate a container host name.
///
/// Rules:
/// - Must start with an ASCII letter
/// - May contain ASCII letters, digits, and hyphens
/// - Must end with a letter or digit (so at least two characters)
/// - Must be at most [`MAX_HOST_NAME_LEN`] bytes
pub fn validate_host_name(s: &str) -> Result<(), IdentityError> {
    let bad_format = || IdentityError::InvalidFormat(s.to_string());

    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return Err(bad_format()),
    }

    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(bad_format());
    }

    match s.chars().last() {
        Some(c) if c.is_ascii_alphanumeric() && s.len() > 1 => {}
        _ => return Err(bad_format()),
    }

    if s.len() > MAX_HOST_NAME_LEN {
        return Err(IdentityError::NameTooLong { len: s.len() });
    }

    Ok(())
}

/// Body of `POST /projects`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRequest {
    /// Project name
    pub name: String,
    /// Project namespace
    pub namespace: String,
    /// Containers to run on the host
    #[serde(default)]
    pub containers: Vec<Container>,
}

impl ProjectRequest {
    /// Validate the request and return its identity
    pub fn identity(&self) -> Result<HostIdentity, IdentityError> {
        HostIdentity::new(&self.namespace, &self.name)
    }
}

/// A container to run on a project's host
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Container {
    /// Container name
    pub name: String,
    /// Image reference, e.g. `ubuntu:18.04`
    pub image: String,
    /// Start command, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Ports exposed outside the host
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Host paths mounted into the container
    #[serde(default)]
    pub mounts: Vec<MountMapping>,
    /// User labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Start on creation
    #[serde(default)]
    pub started: bool,
}

/// Container port to host port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Port inside the container
    pub internal_port: u16,
    /// Port on the host
    pub host_port: u16,
}

/// Host path to container path mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountMapping {
    /// Host mount point
    pub source: String,
    /// Container mount point
    pub destination: String,
    /// Read-write; read-only when false
    #[serde(default)]
    pub rw: bool,
}
