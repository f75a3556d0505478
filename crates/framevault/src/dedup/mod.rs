//! Near-duplicate frame detection
//!
//! Each frame gets a SHA-256 fingerprint and a 64-bit similarity signature.
//! A room threshold of 1.0 matches fingerprints only; lower thresholds also
//! match any live entry whose signature distance is within `1 - threshold`.
//!
//! The engine fails open: if the cache errors, times out, or its circuit is
//! open, the frame is classified unique with `degraded = true` and stored.

mod breaker;
mod cache;
mod fingerprint;

pub use breaker::CircuitBreaker;
pub use cache::{CacheLookup, DedupQuery, DuplicateCache, MemoryDuplicateCache};
pub use fingerprint::{Fingerprint, Signature};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::room::RoomId;
use crate::Frame;

const GLOBAL_SCOPE: &str = "*";

/// How dedup entries are partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    /// One partition shared by every room
    Global,
    /// One partition per room
    PerRoom,
}

/// Dedup engine configuration
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Recency window for cache entries
    pub window: Duration,
    pub scope: DedupScope,
    /// Upper bound on a single cache call
    pub cache_timeout: Duration,
    /// Consecutive cache failures before the breaker opens
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            scope: DedupScope::PerRoom,
            cache_timeout: Duration::from_millis(250),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

/// Result of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classification {
    /// Store the frame. `degraded` is set when the cache could not be
    /// consulted; `inserted` is the cache entry this frame created, if any.
    Unique {
        degraded: bool,
        inserted: Option<Fingerprint>,
    },
    /// Do not store; reference the first occurrence instead
    Duplicate {
        original_timestamp_ms: i64,
        distance: f32,
    },
}

impl Classification {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Classification::Duplicate { .. })
    }
}

pub struct DedupEngine {
    cache: Arc<dyn DuplicateCache>,
    config: DedupConfig,
    breaker: CircuitBreaker,
}

impl DedupEngine {
    pub fn new(cache: Arc<dyn DuplicateCache>, config: DedupConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown);
        Self {
            cache,
            config,
            breaker,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Classify a frame for `room`. `threshold` is the room's effective
    /// threshold; `None` bypasses dedup entirely.
    pub async fn classify(
        &self,
        room: &RoomId,
        threshold: Option<f32>,
        frame: &Frame,
    ) -> Classification {
        let Some(threshold) = threshold else {
            return Classification::Unique {
                degraded: false,
                inserted: None,
            };
        };

        let query = DedupQuery {
            scope: self.scope_for(room),
            fingerprint: Fingerprint::of(&frame.payload),
            signature: Signature::of(&frame.payload),
            max_distance: if threshold >= 1.0 {
                None
            } else {
                Some(1.0 - threshold)
            },
            timestamp_ms: frame.timestamp_ms,
        };

        match self.lookup(&query).await {
            Ok(CacheLookup::Miss) => Classification::Unique {
                degraded: false,
                inserted: Some(query.fingerprint),
            },
            Ok(CacheLookup::Hit {
                original_timestamp_ms,
                distance,
            }) => {
                debug!(
                    %room,
                    fingerprint = %query.fingerprint,
                    original_timestamp_ms,
                    distance,
                    "Duplicate frame"
                );
                Classification::Duplicate {
                    original_timestamp_ms,
                    distance,
                }
            }
            Err(e) => {
                debug!(%room, error = %e, "Dedup degraded, storing frame");
                Classification::Unique {
                    degraded: true,
                    inserted: None,
                }
            }
        }
    }

    /// Drop cache entries for frames that were classified unique but never
    /// persisted, so a resend is stored instead of referencing lost data.
    /// Failures are logged; the entries then age out with the window.
    pub async fn release(&self, room: &RoomId, fingerprints: &[Fingerprint]) {
        if fingerprints.is_empty() {
            return;
        }
        let scope = self.scope_for(room);
        for fingerprint in fingerprints {
            let result = tokio::time::timeout(
                self.config.cache_timeout,
                self.cache.release(&scope, fingerprint),
            )
            .await
            .unwrap_or(Err(CacheError::Timeout(self.config.cache_timeout)));
            if let Err(e) = result {
                warn!(%room, %fingerprint, error = %e, "Failed to release dedup entry");
                return;
            }
        }
        debug!(%room, released = fingerprints.len(), "Released dedup entries");
    }

    fn scope_for(&self, room: &RoomId) -> String {
        match self.config.scope {
            DedupScope::Global => GLOBAL_SCOPE.to_string(),
            DedupScope::PerRoom => room.to_string(),
        }
    }

    async fn lookup(&self, query: &DedupQuery) -> Result<CacheLookup, CacheError> {
        if !self.breaker.allow() {
            return Err(CacheError::CircuitOpen);
        }

        let result = match tokio::time::timeout(
            self.config.cache_timeout,
            self.cache.check_and_insert(query, self.config.window),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.config.cache_timeout)),
        };

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                if self.breaker.record_failure() {
                    warn!(
                        error = %e,
                        cooldown = ?self.config.breaker_cooldown,
                        "Duplicate cache failing, circuit opened"
                    );
                }
            }
        }
        result
    }
}
