//! Certgate Library
//!
//! Client-certificate trust gate and reverse proxy for services that sit
//! behind a TLS-terminating edge.
//!
//! The edge terminates mutual TLS and forwards the client certificate in a
//! request header. Certgate checks that certificate against a configured CA,
//! marks trusted requests with a verified header and proxies them upstream.
//!
//! # Features
//!
//! - **Trust Gate**: 403 for missing or untrusted certificates, exact-match path exclusions
//! - **Verdict Cache**: bounded, TTL-expiring memo of chain-verification results
//! - **Forwarding**: pooled keep-alive client, round-robin targets, optional body re-encoding

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod body;
pub mod cert;
pub mod cli;
pub mod config;
pub mod error;
pub mod forward;
pub mod gateway;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level` when set.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("Invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
