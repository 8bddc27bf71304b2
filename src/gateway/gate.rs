//! Client-certificate trust gate middleware
//!
//! Per request:
//! - Excluded path → pass through untouched (no trust header)
//! - Verification disabled → pass through (no trust header)
//! - No forwarded certificate → 403 `Client certificate required`
//! - Certificate does not verify (or cannot be decoded) → 403 `Invalid client certificate`
//! - Certificate verifies → set the verified header to `true` and continue
//!
//! A client-supplied copy of the verified header is always removed first, so
//! the header upstream sees is only ever the one this gate wrote.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::cert::{CaCertificate, ValidationCache, Verdict};
use crate::config::GateConfig;
use crate::{Error, Result};

/// Body of the 403 sent when no certificate was forwarded
pub const CERTIFICATE_REQUIRED: &str = "Client certificate required";
/// Body of the 403 sent when the forwarded certificate is not trusted
pub const CERTIFICATE_INVALID: &str = "Invalid client certificate";

/// Outcome of the gate for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Path is on the exclusion list
    Excluded,
    /// Verification is disabled for this deployment
    Bypassed,
    /// Forwarded-certificate header missing or empty
    NoCertificate,
    /// Certificate present but not trusted
    InvalidCertificate(Verdict),
    /// Certificate chains to the CA
    Trusted,
}

enum GateMode {
    Verify {
        ca: CaCertificate,
        cache: Arc<ValidationCache>,
    },
    Disabled,
}

/// Resolved gate configuration
pub struct TrustGate {
    mode: GateMode,
    client_cert_header: HeaderName,
    verified_header: HeaderName,
    excluded_paths: Vec<String>,
}

impl TrustGate {
    /// Build the gate, decoding the CA up front.
    pub fn from_config(config: &GateConfig, cache: Arc<ValidationCache>) -> Result<Self> {
        let mode = if config.enabled {
            let value = config.ca_certificate.as_deref().ok_or_else(|| {
                Error::Config("gate.ca_certificate is required while verification is enabled".into())
            })?;
            let ca = CaCertificate::from_config_value(value)
                .map_err(|e| Error::Config(format!("Invalid CA certificate: {e}")))?;
            debug!(subject = %ca.subject(), "Loaded trusted CA");
            GateMode::Verify { ca, cache }
        } else {
            GateMode::Disabled
        };

        Ok(Self {
            mode,
            client_cert_header: parse_header_name("gate.client_cert_header", &config.client_cert_header)?,
            verified_header: parse_header_name("gate.verified_header", &config.verified_header)?,
            excluded_paths: config.excluded_paths.clone(),
        })
    }

    /// Whether verification runs at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(self.mode, GateMode::Verify { .. })
    }

    /// The trusted CA, when verification is enabled
    #[must_use]
    pub fn ca(&self) -> Option<&CaCertificate> {
        match &self.mode {
            GateMode::Verify { ca, .. } => Some(ca),
            GateMode::Disabled => None,
        }
    }

    /// Header name stamped on trusted requests
    #[must_use]
    pub fn verified_header(&self) -> &HeaderName {
        &self.verified_header
    }

    /// Check if a path bypasses the gate (exact match)
    #[must_use]
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|p| p == path)
    }

    /// Decide what happens to a request with this path and these headers.
    #[must_use]
    pub fn decide(&self, path: &str, headers: &HeaderMap) -> GateDecision {
        if self.is_excluded(path) {
            return GateDecision::Excluded;
        }

        let GateMode::Verify { ca, cache } = &self.mode else {
            return GateDecision::Bypassed;
        };

        let Some(raw) = headers.get(&self.client_cert_header) else {
            return GateDecision::NoCertificate;
        };
        if raw.is_empty() {
            return GateDecision::NoCertificate;
        }
        let Ok(value) = raw.to_str() else {
            return GateDecision::InvalidCertificate(Verdict::DecodeFailed);
        };

        match cache.lookup_verdict(ca, value) {
            Verdict::Trusted => GateDecision::Trusted,
            other => GateDecision::InvalidCertificate(other),
        }
    }
}

fn parse_header_name(field: &str, name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::Config(format!("{field} '{name}' is not a valid header name")))
}

/// Trust gate middleware
pub async fn trust_gate_middleware(
    State(gate): State<Arc<TrustGate>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    // Never let a client-supplied assertion reach upstream.
    request.headers_mut().remove(gate.verified_header());

    let path = request.uri().path().to_owned();
    let decision = gate.decide(&path, request.headers());

    match decision {
        GateDecision::Excluded => {
            debug!(path = %path, "Excluded path, skipping certificate check");
        }
        GateDecision::Bypassed => {
            debug!(path = %path, "Certificate verification disabled, passing through");
        }
        GateDecision::Trusted => {
            debug!(path = %path, "Client certificate trusted");
            request
                .headers_mut()
                .insert(gate.verified_header().clone(), HeaderValue::from_static("true"));
        }
        GateDecision::NoCertificate => {
            warn!(path = %path, reason = "missing_certificate", "Rejected request");
            return forbidden(CERTIFICATE_REQUIRED);
        }
        GateDecision::InvalidCertificate(verdict) => {
            warn!(path = %path, reason = verdict.as_str(), "Rejected request");
            return forbidden(CERTIFICATE_INVALID);
        }
    }

    next.run(request).await
}

/// Create a 403 Forbidden response with a plain-text body
fn forbidden(message: &'static str) -> Response {
    (StatusCode::FORBIDDEN, message).into_response()
}
