//! Memoized certificate verdicts
//!
//! Chain verification is the expensive part of every request. For a fixed CA
//! the verdict is a function of the client certificate bytes, so the cache
//! keys on `(CA fingerprint, SHA-256 of header bytes)` and stores the outcome.
//!
//! The map is a moka cache bounded by `max_entries`; entries expire after
//! `ttl`, which also bounds how long a cached `true` can outlive the
//! certificate's own validity window. Concurrent misses on one key wait for a
//! single verification.
//!
//! Undecodable headers are never stored. They cost no chain verification, and
//! keeping them would let junk traffic crowd out real verdicts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::notification::RemovalCause;
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::decode::{CaCertificate, ClientCertificate};
use super::verify::ChainValidator;
use crate::config::CacheConfig;

/// Outcome of validating one forwarded certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Chain verified against the CA
    Trusted,
    /// Decoded fine but not issued (or no longer valid) under the CA
    Untrusted,
    /// Header value was not a decodable certificate
    DecodeFailed,
    /// Verification faulted internally
    VerificationFailed,
}

impl Verdict {
    /// Only [`Verdict::Trusted`] lets a request through.
    #[must_use]
    pub fn is_trusted(self) -> bool {
        matches!(self, Self::Trusted)
    }

    /// Short label for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Untrusted => "untrusted",
            Self::DecodeFailed => "decode_failed",
            Self::VerificationFailed => "verification_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    ca: [u8; 32],
    client: [u8; 32],
}

impl CacheKey {
    fn new(ca: &CaCertificate, client_header: &str) -> Self {
        let mut client = [0u8; 32];
        client.copy_from_slice(&Sha256::digest(client_header.as_bytes()));
        Self {
            ca: *ca.fingerprint(),
            client,
        }
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that ran decoding and verification
    pub misses: u64,
    /// Entries removed for age or capacity
    pub evictions: u64,
    /// Current number of entries
    pub size: u64,
}

/// Thread-safe, bounded validation cache.
pub struct ValidationCache {
    validator: Arc<dyn ChainValidator>,
    entries: Option<Cache<CacheKey, Verdict>>,
    stats: CacheStats,
}

impl ValidationCache {
    /// Create a cache in front of `validator`.
    pub fn new(validator: Arc<dyn ChainValidator>, config: &CacheConfig) -> Self {
        let stats = CacheStats::default();

        let entries = config.enabled.then(|| {
            let evictions = Arc::clone(&stats.evictions);
            Cache::builder()
                .max_capacity(config.max_entries.max(1) as u64)
                .time_to_live(config.ttl)
                .eviction_listener(move |_key, _verdict, cause: RemovalCause| {
                    if cause.was_evicted() {
                        evictions.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .build()
        });

        Self {
            validator,
            entries,
            stats,
        }
    }

    /// Is the client certificate in `client_header` issued by `ca`?
    pub fn lookup(&self, ca: &CaCertificate, client_header: &str) -> bool {
        self.lookup_verdict(ca, client_header).is_trusted()
    }

    /// Like [`Self::lookup`], but keeps the reason for audit logging.
    pub fn lookup_verdict(&self, ca: &CaCertificate, client_header: &str) -> Verdict {
        let Some(entries) = &self.entries else {
            return self.compute(ca, client_header);
        };

        let mut computed = None;
        let cached = entries.optionally_get_with(CacheKey::new(ca, client_header), || {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            let verdict = self.compute(ca, client_header);
            computed = Some(verdict);
            (verdict != Verdict::DecodeFailed).then_some(verdict)
        });

        if computed.is_none() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        cached.or(computed).unwrap_or(Verdict::DecodeFailed)
    }

    fn compute(&self, ca: &CaCertificate, client_header: &str) -> Verdict {
        let client = match ClientCertificate::from_header_value(client_header) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Forwarded client certificate could not be decoded");
                return Verdict::DecodeFailed;
            }
        };

        match self.validator.verify(ca, &client) {
            Ok(true) => {
                debug!(subject = %client.subject(), "Client certificate chain verified");
                Verdict::Trusted
            }
            Ok(false) => Verdict::Untrusted,
            Err(e) => {
                warn!(subject = %client.subject(), error = %e, "Client certificate verification faulted");
                Verdict::VerificationFailed
            }
        }
    }

    /// Run pending maintenance: drop expired entries and apply the size bound
    pub fn evict_expired(&self) {
        if let Some(entries) = &self.entries {
            entries.run_pending_tasks();
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.evict_expired();
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.as_ref().map_or(0, Cache::entry_count),
        }
    }
}
