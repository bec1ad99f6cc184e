//! Per-host PKI for container engine mTLS
//!
//! Every provisioned host gets its own certificate authority. The CA signs
//! exactly two leaves:
//!
//! - a server certificate installed on the host's reverse proxy, bound to the
//!   host's IP address through an IP Subject Alternative Name
//! - a client certificate the worker presents when talking to that host
//!
//! Because the CA is per host, credentials lifted from one host cannot be used
//! to impersonate the engine of another.
//!
//! All keys are ECDSA P-256, every certificate carries a random 128-bit serial
//! and is valid for ten years from issuance. The root carries no extended key
//! usage (nginx rejects client chains whose root restricts EKU).

use std::fmt;
use std::net::IpAddr;

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Validity period of every issued certificate (10 years)
pub const CERT_VALIDITY_DAYS: i64 = 365 * 10;

/// Size of the random certificate serial in bytes (128 bits)
const SERIAL_BYTES: usize = 16;

/// Organization written into every subject
const ORGANIZATION: &str = "Windlass";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// The server address is not an IP address
    #[error("invalid server address '{0}'")]
    InvalidAddress(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Root CA plus server and client leaves for one host
///
/// Created once per provisioning run and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    /// Root CA private key (PEM)
    pub root_key_pem: String,
    /// Self-signed root CA certificate (PEM)
    pub root_cert_pem: String,
    /// Server leaf private key (PEM)
    pub server_key_pem: String,
    /// Server leaf certificate (PEM)
    pub server_cert_pem: String,
    /// Client leaf private key (PEM)
    pub client_key_pem: String,
    /// Client leaf certificate (PEM)
    pub client_cert_pem: String,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("root_cert_pem", &self.root_cert_pem)
            .field("server_cert_pem", &self.server_cert_pem)
            .field("client_cert_pem", &self.client_cert_pem)
            .field("private_keys", &"[redacted]")
            .finish()
    }
}

/// Issues a fresh CA and leaf pair for a host
#[derive(Clone, Debug, Default)]
pub struct PkiIssuer;

impl PkiIssuer {
    /// Create an issuer
    pub fn new() -> Self {
        Self
    }

    /// Issue a bundle whose server leaf is bound to `server_ip`
    ///
    /// Pure function of its input aside from key and serial randomness.
    pub fn issue(&self, server_ip: &str) -> Result<CertificateBundle> {
        let ip: IpAddr = server_ip
            .trim()
            .parse()
            .map_err(|_| PkiError::InvalidAddress(server_ip.to_string()))?;

        let root_key = generate_key("root")?;
        let root_params = root_params(&ip);
        let root_cert = root_params.self_signed(&root_key).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create root cert: {}", e))
        })?;
        let root_cert_pem = root_cert.pem();

        let issuer = Issuer::from_ca_cert_pem(&root_cert_pem, &root_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let server_key = generate_key("server")?;
        let server_cert = server_params(ip)
            .signed_by(&server_key, &issuer)
            .map_err(|e| {
                PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
            })?;

        let client_key = generate_key("client")?;
        let client_cert = client_params(&ip)
            .signed_by(&client_key, &issuer)
            .map_err(|e| {
                PkiError::CertificateGenerationFailed(format!("failed to sign client cert: {}", e))
            })?;

        Ok(CertificateBundle {
            root_key_pem: root_key.serialize_pem(),
            root_cert_pem,
            server_key_pem: server_key.serialize_pem(),
            server_cert_pem: server_cert.pem(),
            client_key_pem: client_key.serialize_pem(),
            client_cert_pem: client_cert.pem(),
        })
    }
}

fn generate_key(role: &str) -> Result<KeyPair> {
    KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", role, e))
    })
}

/// Common parameters: random serial, ten-year validity from now
fn base_params(common_name: String) -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    params.distinguished_name = dn;

    params.serial_number = Some(random_serial());

    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ::time::Duration::days(CERT_VALIDITY_DAYS);

    params
}

fn root_params(ip: &IpAddr) -> CertificateParams {
    let mut params = base_params(format!("windlass host CA {}", ip));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
    params
}

fn server_params(ip: IpAddr) -> CertificateParams {
    let mut params = base_params(format!("windlass host {}", ip));
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.subject_alt_names = vec![SanType::IpAddress(ip)];
    params
}

fn client_params(ip: &IpAddr) -> CertificateParams {
    let mut params = base_params(format!("windlass worker client {}", ip));
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params
}

/// Positive, non-zero 128-bit serial
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    if bytes.iter().all(|b| *b == 0) {
        bytes[SERIAL_BYTES - 1] = 1;
    }
    SerialNumber::from_slice(&bytes)
}

/// Facts about an issued certificate, read back from its PEM
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Raw serial bytes
    pub serial: Vec<u8>,
    /// Whether basic constraints mark this as a CA
    pub is_ca: bool,
    /// IP addresses in the Subject Alternative Name extension
    pub ip_sans: Vec<IpAddr>,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let ip_sans = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::ParseError(format!("invalid SAN extension: {}", e)))?
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::IPAddress(raw) => ip_from_bytes(raw),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            serial: cert.raw_serial().to_vec(),
            is_ca: cert.is_ca(),
            ip_sans,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }
}

fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Check that `cert_pem` carries a valid signature from the CA in `ca_cert_pem`
pub fn verify_signed_by(cert_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}
