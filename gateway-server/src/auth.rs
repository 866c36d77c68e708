//! Charge station authentication at websocket upgrade
//!
//! TLS is never terminated by the gateway itself. With proxy headers
//! trusted, a TLS-terminating proxy reports the transport and any verified
//! client certificate:
//!
//! | Header                         | Meaning                                |
//! |--------------------------------|----------------------------------------|
//! | `X-Forwarded-Proto`            | `https` marks the connection as TLS    |
//! | `X-Client-Cert-Present`        | a client certificate was presented     |
//! | `X-Client-Cert-Chain-Verified` | the certificate chain was verified     |
//! | `X-Client-Cert-Hash`           | base64 SHA-256 hash of the certificate |

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, warn};

use crate::registry::{Certificate, ChargeStation, DeviceRegistry, SecurityProfile};

pub const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";
pub const CLIENT_CERT_PRESENT_HEADER: &str = "x-client-cert-present";
pub const CLIENT_CERT_VERIFIED_HEADER: &str = "x-client-cert-chain-verified";
pub const CLIENT_CERT_HASH_HEADER: &str = "x-client-cert-hash";

/// Reasons a charge station is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("TLS not allowed for unsecured transport profile")]
    TlsNotAllowed,

    #[error("TLS required for secured transport profile")]
    TlsRequired,

    #[error("No basic auth credentials")]
    MissingCredentials,

    #[error("Invalid username")]
    InvalidUsername,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("No client certificate")]
    MissingClientCertificate,

    #[error("Unreadable client certificate: {0}")]
    InvalidCertificate(String),

    #[error("Client certificate organization not allowed: {0:?}")]
    UntrustedOrganization(Vec<String>),

    #[error("Unsupported security profile {0}")]
    UnsupportedProfile(i64),
}

/// Transport security of an incoming connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSecurity {
    pub tls: bool,
    pub client_certificate: Option<Certificate>,
}

impl ConnectionSecurity {
    /// A connection accepted directly by the gateway's plain listener
    pub fn plain() -> Self {
        Self::default()
    }

    /// Derive transport security from the headers of a TLS-terminating
    /// proxy, resolving the client certificate through the registry
    pub async fn from_proxy_headers(headers: &HeaderMap, registry: &dyn DeviceRegistry) -> Self {
        let mut security = Self::plain();

        if header_str(headers, FORWARDED_PROTO_HEADER) != Some("https") {
            return security;
        }
        security.tls = true;

        if !header_flag(headers, CLIENT_CERT_PRESENT_HEADER)
            || !header_flag(headers, CLIENT_CERT_VERIFIED_HEADER)
        {
            return security;
        }

        let Some(hash) = header_str(headers, CLIENT_CERT_HASH_HEADER) else {
            warn!("Client certificate verified but no hash forwarded");
            return security;
        };

        match registry.lookup_certificate(hash).await {
            Ok(Some(certificate)) => security.client_certificate = Some(certificate),
            Ok(None) => warn!("Certificate not found: {}", hash),
            Err(e) => error!("Lookup certificate {}: {}", hash, e),
        }

        security
    }
}

/// Username and password from an HTTP basic `Authorization` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = header_str(headers, AUTHORIZATION.as_str())?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;

        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// base64 of the SHA-256 digest of `password`, the form the registry stores
pub fn hash_password(password: &str) -> String {
    STANDARD.encode(Sha256::digest(password.as_bytes()))
}

/// Check a connection against the station's security profile.
///
/// Client certificates are only accepted when their subject names one of
/// `org_names` as organization.
pub fn authenticate(
    station: &ChargeStation,
    security: &ConnectionSecurity,
    credentials: Option<&BasicCredentials>,
    org_names: &[String],
) -> Result<(), AuthError> {
    match station.security_profile {
        SecurityProfile::UnsecuredTransportWithBasicAuth => {
            if security.tls {
                return Err(AuthError::TlsNotAllowed);
            }
            check_basic_auth(station, credentials)
        }
        SecurityProfile::TlsWithBasicAuth => {
            if !security.tls {
                return Err(AuthError::TlsRequired);
            }
            check_basic_auth(station, credentials)
        }
        SecurityProfile::TlsWithClientSideCertificates => {
            if !security.tls {
                return Err(AuthError::TlsRequired);
            }
            let certificate = security
                .client_certificate
                .as_ref()
                .ok_or(AuthError::MissingClientCertificate)?;
            check_organization(certificate, org_names)
        }
        SecurityProfile::Unsupported(level) => Err(AuthError::UnsupportedProfile(level)),
    }
}

fn check_basic_auth(
    station: &ChargeStation,
    credentials: Option<&BasicCredentials>,
) -> Result<(), AuthError> {
    let credentials = credentials.ok_or(AuthError::MissingCredentials)?;

    if credentials.username != station.client_id && !station.invalid_username_allowed {
        return Err(AuthError::InvalidUsername);
    }

    match &station.base64_sha256_password {
        Some(expected) if *expected == hash_password(&credentials.password) => Ok(()),
        _ => Err(AuthError::InvalidPassword),
    }
}

fn check_organization(certificate: &Certificate, org_names: &[String]) -> Result<(), AuthError> {
    let organizations = certificate
        .subject_organizations()
        .map_err(|e| AuthError::InvalidCertificate(e.to_string()))?;

    if organizations.iter().any(|org| org_names.contains(org)) {
        Ok(())
    } else {
        Err(AuthError::UntrustedOrganization(organizations))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Boolean header in the forms proxies commonly emit
fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    matches!(
        header_str(headers, name),
        Some("1" | "t" | "T" | "true" | "TRUE" | "True")
    )
}
