//! Upstream target selection

use std::sync::atomic::{AtomicUsize, Ordering};

use url::Url;

use crate::{Error, Result};

/// Picks the upstream for each forwarded request.
///
/// The round-robin cursor is owned here and only advanced through
/// [`TargetSelector::next`].
#[derive(Debug)]
pub enum TargetSelector {
    /// One fixed upstream
    Single(Url),
    /// Rotate through several upstreams in configuration order
    RoundRobin {
        /// Candidate upstreams
        targets: Vec<Url>,
        /// Monotonic dispatch counter
        cursor: AtomicUsize,
    },
}

impl TargetSelector {
    /// Build a selector from the configured targets.
    pub fn new(mut targets: Vec<Url>) -> Result<Self> {
        match targets.len() {
            0 => Err(Error::Config("No proxy targets configured".to_string())),
            1 => Ok(Self::Single(targets.remove(0))),
            _ => Ok(Self::RoundRobin {
                targets,
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Target for the next request.
    ///
    /// Under concurrency each caller still gets a distinct cursor value, so
    /// progress is monotonic even though interleaving decides who gets which.
    pub fn next(&self) -> &Url {
        match self {
            Self::Single(url) => url,
            Self::RoundRobin { targets, cursor } => {
                let i = cursor.fetch_add(1, Ordering::Relaxed) % targets.len();
                &targets[i]
            }
        }
    }

    /// Number of candidate targets
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::RoundRobin { targets, .. } => targets.len(),
        }
    }

    /// Always false; a selector holds at least one target
    pub fn is_empty(&self) -> bool {
        false
    }
}
