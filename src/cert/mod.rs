//! Forwarded client-certificate validation.
//!
//! The TLS-terminating edge hands the client certificate to the gateway as a
//! base64 header value. This module turns that value back into an X.509
//! certificate, checks it against the configured CA, and memoizes the result.
//!
//! # Architecture
//!
//! ```text
//! header value ──► decode (ClientCertificate)
//!                       │
//! CA (config)  ──► decode (CaCertificate)
//!                       │
//!                       ▼
//!              ChainValidator::verify  ──►  Verdict
//!                       ▲
//!              ValidationCache::lookup (memoized, bounded, TTL)
//! ```
//!
//! # Modules
//!
//! - [`decode`] - PEM re-wrapping and X.509 parsing (`CaCertificate`, `ClientCertificate`)
//! - [`verify`] - chain verification seam (`ChainValidator`, `WebPkiChainValidator`)
//! - [`cache`] - memoized verdicts (`ValidationCache`, `Verdict`)

pub mod cache;
pub mod decode;
pub mod verify;

#[cfg(test)]
pub(crate) mod test_pki;

pub use cache::{CacheStatsSnapshot, ValidationCache, Verdict};
pub use decode::{CaCertificate, ClientCertificate, DecodeError, wrap_pem};
pub use verify::{ChainValidator, VerificationError, WebPkiChainValidator};
