//! Session gateway
//!
//! Resolves a room, takes its exclusive lease and hands back a
//! [`RoomSession`] that processes the connection's messages strictly in
//! arrival order:
//!
//! ```text
//! Control ─▶ recording state machine
//! Frame   ─▶ writer capacity ─▶ quota guard ─▶ dedup engine ─▶ storage writer
//! ```
//!
//! Closing a session synthesizes a disconnect, so an active recording is
//! always finalized exactly once.

mod lease;
mod session;

pub use lease::{RoomLease, RoomLeases};
pub use session::{Disposition, RoomSession};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::dedup::{DedupConfig, DedupEngine, DuplicateCache, MemoryDuplicateCache};
use crate::error::GatewayError;
use crate::events::{LogSink, MetricsSink};
use crate::quota::{QuotaGuard, QuotaLedger};
use crate::recording::RecordingLedger;
use crate::room::{RoomDirectory, RoomId};
use crate::storage::{BlobStore, WriterConfig};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub writer: WriterConfig,
    pub dedup: DedupConfig,
    /// How often idle connections drive time-based flushes
    pub tick_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let writer = WriterConfig::default();
        Self {
            tick_interval: writer.flush_interval,
            writer,
            dedup: DedupConfig::default(),
        }
    }
}

/// External collaborators the pipeline depends on.
pub struct Collaborators {
    pub directory: Arc<dyn RoomDirectory>,
    pub quota: Arc<dyn QuotaLedger>,
    pub store: Arc<dyn BlobStore>,
    pub cache: Arc<dyn DuplicateCache>,
    pub sink: Arc<dyn MetricsSink>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-process cache, `tracing` sink and system clock around the given
    /// directory, ledger and store.
    pub fn new(
        directory: Arc<dyn RoomDirectory>,
        quota: Arc<dyn QuotaLedger>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            directory,
            quota,
            store,
            cache: Arc::new(MemoryDuplicateCache::default()),
            sink: Arc::new(LogSink),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub rooms_active: usize,
    pub connections_total: u64,
    pub connections_refused: u64,
    pub messages_received: u64,
    pub protocol_errors: u64,
    pub invalid_transitions: u64,
    pub frames_stored: u64,
    pub frames_duplicate: u64,
    pub frames_rejected: u64,
    pub frames_degraded: u64,
    pub sessions_started: u64,
    pub sessions_finalized: u64,
    pub sessions_failed: u64,
}

/// Lock-free counters behind [`GatewayStats`]
#[derive(Default)]
pub(crate) struct AtomicGatewayStats {
    pub connections_total: AtomicU64,
    pub connections_refused: AtomicU64,
    pub messages_received: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub invalid_transitions: AtomicU64,
    pub frames_stored: AtomicU64,
    pub frames_duplicate: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub frames_degraded: AtomicU64,
    pub sessions_started: AtomicU64,
    pub sessions_finalized: AtomicU64,
    pub sessions_failed: AtomicU64,
}

impl AtomicGatewayStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, rooms_active: usize) -> GatewayStats {
        GatewayStats {
            rooms_active,
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            invalid_transitions: self.invalid_transitions.load(Ordering::Relaxed),
            frames_stored: self.frames_stored.load(Ordering::Relaxed),
            frames_duplicate: self.frames_duplicate.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            frames_degraded: self.frames_degraded.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_finalized: self.sessions_finalized.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
        }
    }
}

/// Components shared by every room session
pub(crate) struct GatewayInner {
    pub directory: Arc<dyn RoomDirectory>,
    pub quota: QuotaGuard,
    pub dedup: DedupEngine,
    pub store: Arc<dyn BlobStore>,
    pub sink: Arc<dyn MetricsSink>,
    pub clock: Arc<dyn Clock>,
    pub recordings: Arc<RecordingLedger>,
    pub leases: RoomLeases,
    pub config: GatewayConfig,
    pub stats: AtomicGatewayStats,
}

/// Entry point for producer connections. Cheap to clone.
#[derive(Clone)]
pub struct SessionGateway {
    inner: Arc<GatewayInner>,
}

impl SessionGateway {
    pub fn new(collaborators: Collaborators, config: GatewayConfig) -> Self {
        let Collaborators {
            directory,
            quota,
            store,
            cache,
            sink,
            clock,
        } = collaborators;

        Self {
            inner: Arc::new(GatewayInner {
                directory,
                quota: QuotaGuard::new(quota),
                dedup: DedupEngine::new(cache, config.dedup.clone()),
                store,
                sink,
                clock,
                recordings: Arc::new(RecordingLedger::new()),
                leases: RoomLeases::new(),
                config,
                stats: AtomicGatewayStats::default(),
            }),
        }
    }

    /// Open a producer session for `room`.
    ///
    /// Refused when the room is unknown or already has a producer.
    pub async fn open(&self, room: &RoomId) -> Result<RoomSession, GatewayError> {
        let inner = &self.inner;
        let refuse = |err: GatewayError| {
            AtomicGatewayStats::bump(&inner.stats.connections_refused);
            warn!(%room, error = %err, "Connection refused");
            err
        };

        let resolved = inner
            .directory
            .room(room)
            .await
            .map_err(|e| refuse(GatewayError::Directory(e.to_string())))?
            .ok_or_else(|| refuse(GatewayError::UnknownRoom(room.to_string())))?;

        let lease = inner
            .leases
            .acquire(room)
            .ok_or_else(|| refuse(GatewayError::RoomBusy(room.to_string())))?;

        if let Err(e) = inner.directory.touch(room, inner.clock.now()).await {
            warn!(%room, error = %e, "Failed to update room activity");
        }

        AtomicGatewayStats::bump(&inner.stats.connections_total);
        info!(%room, account = %resolved.account, "Producer connected");
        Ok(RoomSession::new(resolved, lease, Arc::clone(&self.inner)))
    }

    pub fn stats(&self) -> GatewayStats {
        self.inner.stats.snapshot(self.inner.leases.active())
    }

    pub fn recordings(&self) -> &Arc<RecordingLedger> {
        &self.inner.recordings
    }

    pub fn quota(&self) -> &QuotaGuard {
        &self.inner.quota
    }

    pub fn directory(&self) -> &Arc<dyn RoomDirectory> {
        &self.inner.directory
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn is_room_busy(&self, room: &RoomId) -> bool {
        self.inner.leases.is_held(room)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::quota::MemoryQuotaLedger;
    use crate::room::{AccountId, MemoryRoomDirectory, Room, RoomConfig};
    use crate::storage::MemoryBlobStore;
    use crate::events::MemorySink;

    pub struct Harness {
        pub gateway: SessionGateway,
        pub store: Arc<MemoryBlobStore>,
        pub quota: Arc<MemoryQuotaLedger>,
        pub sink: Arc<MemorySink>,
        pub directory: Arc<MemoryRoomDirectory>,
    }

    /// One room "lobby" owned by account "acme" with a 1 MB budget.
    /// `store` overrides the in-memory blob store.
    pub async fn build(
        store: Option<Arc<dyn BlobStore>>,
        cache: Arc<dyn DuplicateCache>,
        config: GatewayConfig,
    ) -> Harness {
        let directory = Arc::new(MemoryRoomDirectory::new());
        directory
            .insert(Room::new(
                RoomId::new("lobby"),
                AccountId::new("acme"),
                RoomConfig::default(),
            ))
            .await;
        let quota = Arc::new(MemoryQuotaLedger::new());
        quota.set_account(AccountId::new("acme"), 1_000_000, 0).await;
        let sink = Arc::new(MemorySink::new());
        let memory = Arc::new(MemoryBlobStore::new());
        let store = store.unwrap_or_else(|| memory.clone() as Arc<dyn BlobStore>);

        let gateway = SessionGateway::new(
            Collaborators {
                directory: directory.clone(),
                quota: quota.clone(),
                store,
                cache,
                sink: sink.clone(),
                clock: Arc::new(SystemClock),
            },
            config,
        );
        Harness {
            gateway,
            store: memory,
            quota,
            sink,
            directory,
        }
    }

    pub async fn harness() -> Harness {
        build(
            None,
            Arc::new(MemoryDuplicateCache::default()),
            test_config(),
        )
        .await
    }

    pub fn test_config() -> GatewayConfig {
        use crate::storage::RetryPolicy;
        GatewayConfig {
            writer: WriterConfig {
                retry: RetryPolicy {
                    attempts: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
                drain_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn unknown_room_is_refused() {
        let h = harness().await;
        let err = h.gateway.open(&RoomId::new("nowhere")).await.unwrap_err();
        assert_eq!(err, GatewayError::UnknownRoom("nowhere".into()));
        assert_eq!(h.gateway.stats().connections_refused, 1);
    }

    #[tokio::test]
    async fn second_producer_is_refused_until_close() {
        let h = harness().await;
        let room = RoomId::new("lobby");

        let session = h.gateway.open(&room).await.unwrap();
        assert!(h.gateway.is_room_busy(&room));
        assert!(format!("{:?}", session).contains("Idle"));
        assert_eq!(
            h.gateway.open(&room).await.unwrap_err(),
            GatewayError::RoomBusy("lobby".into())
        );

        session.close().await;
        assert!(!h.gateway.is_room_busy(&room));
        assert!(h.gateway.open(&room).await.is_ok());
    }

    #[tokio::test]
    async fn open_touches_last_active() {
        let h = harness().await;
        let room = RoomId::new("lobby");
        let _session = h.gateway.open(&room).await.unwrap();
        let resolved = h.directory.room(&room).await.unwrap().unwrap();
        assert!(resolved.last_active.is_some());
        assert_eq!(h.gateway.stats().rooms_active, 1);
    }
}
