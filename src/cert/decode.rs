//! Certificate decoding.
//!
//! The CA arrives once from configuration (PEM, usually base64-wrapped so it
//! fits in a single environment variable). Client certificates arrive per
//! request as the bare base64 body of a PEM block, without the
//! `-----BEGIN CERTIFICATE-----` / `-----END CERTIFICATE-----` markers.
//! Both end up as DER plus the subject DN for audit logs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::error::PEMError;
use x509_parser::nom;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";
const PEM_LABEL: &str = "CERTIFICATE";
const PEM_LINE_WIDTH: usize = 64;

/// Certificate material could not be turned into an X.509 certificate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input was empty after trimming
    #[error("certificate value is empty")]
    Empty,

    /// Input was not valid base64
    #[error("certificate value is not valid base64: {0}")]
    Base64(String),

    /// No PEM block could be read
    #[error("no PEM certificate block found")]
    NoPemBlock,

    /// A PEM block was found but carries another label
    #[error("unexpected PEM label '{0}', expected CERTIFICATE")]
    UnexpectedLabel(String),

    /// PEM framing was readable but its payload was not
    #[error("malformed PEM block: {0}")]
    Pem(String),

    /// DER payload is not an X.509 certificate
    #[error("malformed X.509 certificate: {0}")]
    X509(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// CA certificate
// ─────────────────────────────────────────────────────────────────────────────

/// The trusted root, decoded once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct CaCertificate {
    der: CertificateDer<'static>,
    subject: String,
    fingerprint: [u8; 32],
}

impl CaCertificate {
    /// Decode the CA from its configuration value.
    ///
    /// Accepts PEM text directly, base64-encoded PEM text (the canonical
    /// deployment form), or base64-encoded DER.
    pub fn from_config_value(value: &str) -> Result<Self, DecodeError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DecodeError::Empty);
        }

        let der = if value.contains(PEM_BEGIN) {
            der_from_pem(value.as_bytes())?
        } else {
            let decoded = decode_base64(value)?;
            if contains_subslice(&decoded, PEM_BEGIN.as_bytes()) {
                der_from_pem(&decoded)?
            } else {
                decoded
            }
        };

        Self::from_der(der)
    }

    /// Wrap already-decoded DER bytes.
    pub fn from_der(der: Vec<u8>) -> Result<Self, DecodeError> {
        let subject = parse_subject(&der)?;
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&Sha256::digest(&der));
        Ok(Self {
            der: CertificateDer::from(der),
            subject,
            fingerprint,
        })
    }

    /// DER encoding of the CA certificate.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Subject distinguished name.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// SHA-256 of the DER encoding; identifies the CA in cache keys.
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client certificate
// ─────────────────────────────────────────────────────────────────────────────

/// A client certificate recovered from the forwarded header.
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    der: CertificateDer<'static>,
    subject: String,
}

impl ClientCertificate {
    /// Decode a forwarded header value.
    ///
    /// The value is the base64 body of a PEM certificate. It is stripped of
    /// whitespace (and of PEM markers, should an edge leave them in),
    /// re-wrapped into a standard PEM block, and parsed.
    pub fn from_header_value(value: &str) -> Result<Self, DecodeError> {
        let body: String = value
            .replace(PEM_BEGIN, "")
            .replace(PEM_END, "")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if body.is_empty() {
            return Err(DecodeError::Empty);
        }

        let der = der_from_pem(wrap_pem(&body).as_bytes())?;
        let subject = parse_subject(&der)?;
        Ok(Self {
            der: CertificateDer::from(der),
            subject,
        })
    }

    /// DER encoding of the client certificate.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Subject distinguished name.
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Wrap a bare base64 certificate body into a PEM block with 64-column lines.
#[must_use]
pub fn wrap_pem(body: &str) -> String {
    let mut pem = String::with_capacity(body.len() + body.len() / PEM_LINE_WIDTH + 64);
    pem.push_str(PEM_BEGIN);
    pem.push('\n');
    // base64 is ASCII, so byte chunks are char boundaries.
    for line in body.as_bytes().chunks(PEM_LINE_WIDTH) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(PEM_END);
    pem.push('\n');
    pem
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn der_from_pem(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let (_, pem) = parse_x509_pem(input).map_err(|e| match e {
        nom::Err::Error(PEMError::MissingHeader) | nom::Err::Failure(PEMError::MissingHeader) => {
            DecodeError::NoPemBlock
        }
        other => DecodeError::Pem(other.to_string()),
    })?;

    if pem.label != PEM_LABEL {
        return Err(DecodeError::UnexpectedLabel(pem.label));
    }
    Ok(pem.contents)
}

fn parse_subject(der: &[u8]) -> Result<String, DecodeError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| DecodeError::X509(e.to_string()))?;
    Ok(cert.subject().to_string())
}

fn decode_base64(value: &str) -> Result<Vec<u8>, DecodeError> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
