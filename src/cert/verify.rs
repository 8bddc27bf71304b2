//! Chain verification against a single trusted CA.
//!
//! [`WebPkiChainValidator`] runs standard X.509 path validation through
//! rustls' webpki client verifier: signature, issuer linkage, validity window
//! and client-auth usage. There are no intermediates and no revocation lists.

use std::sync::Arc;

use dashmap::DashMap;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::UnixTime;
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use rustls::RootCertStore;
use thiserror::Error;
use tracing::debug;

use super::decode::{CaCertificate, ClientCertificate};

/// Verification could not be carried out.
///
/// This is a fault, distinct from a certificate that is simply not trusted
/// (which verifies to `Ok(false)`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// The CA could not be installed as a trust anchor
    #[error("CA certificate is not a usable trust anchor: {0}")]
    TrustAnchor(String),

    /// The verifier could not be constructed
    #[error("failed to build certificate verifier: {0}")]
    Verifier(String),

    /// The crypto layer failed for a reason unrelated to trust
    #[error("cryptographic fault during chain verification: {0}")]
    Crypto(String),
}

/// Decides whether `ca` issued `client`.
pub trait ChainValidator: Send + Sync {
    /// `Ok(true)` when the chain verifies, `Ok(false)` when the certificate is
    /// untrusted, `Err` only on internal faults.
    fn verify(
        &self,
        ca: &CaCertificate,
        client: &ClientCertificate,
    ) -> Result<bool, VerificationError>;
}

/// Production validator backed by webpki with the aws-lc-rs provider.
///
/// Verifiers are built once per CA fingerprint and reused.
pub struct WebPkiChainValidator {
    provider: Arc<CryptoProvider>,
    verifiers: DashMap<[u8; 32], Arc<dyn ClientCertVerifier>>,
}

impl WebPkiChainValidator {
    /// Create a validator using the aws-lc-rs crypto provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
            verifiers: DashMap::new(),
        }
    }

    fn verifier_for(
        &self,
        ca: &CaCertificate,
    ) -> Result<Arc<dyn ClientCertVerifier>, VerificationError> {
        if let Some(verifier) = self.verifiers.get(ca.fingerprint()) {
            return Ok(Arc::clone(verifier.value()));
        }

        let mut roots = RootCertStore::empty();
        roots
            .add(ca.der().clone())
            .map_err(|e| VerificationError::TrustAnchor(e.to_string()))?;

        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&self.provider))
                .build()
                .map_err(|e| VerificationError::Verifier(e.to_string()))?;

        self.verifiers
            .insert(*ca.fingerprint(), Arc::clone(&verifier));
        Ok(verifier)
    }
}

impl Default for WebPkiChainValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainValidator for WebPkiChainValidator {
    fn verify(
        &self,
        ca: &CaCertificate,
        client: &ClientCertificate,
    ) -> Result<bool, VerificationError> {
        let verifier = self.verifier_for(ca)?;

        match verifier.verify_client_cert(client.der(), &[], UnixTime::now()) {
            Ok(_) => Ok(true),
            // Any certificate-level rejection (unknown issuer, bad signature,
            // expired, wrong usage, ...) is a verdict, not a fault.
            Err(rustls::Error::InvalidCertificate(reason)) => {
                debug!(subject = %client.subject(), reason = ?reason, "Certificate not trusted");
                Ok(false)
            }
            Err(e) => Err(VerificationError::Crypto(e.to_string())),
        }
    }
}
