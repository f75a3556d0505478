//! One producer connection bound to one room

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{AtomicGatewayStats, GatewayInner, RoomLease};
use crate::dedup::Classification;
use crate::error::{ErrorKind, InvalidTransition, Rejection, WriterError};
use crate::events::{FrameOutcome, PipelineEvent};
use crate::protocol::{InboundMessage, ServerMessage};
use crate::recording::{
    transition, ControlInput, Effect, RecordingRecord, RecordingSession, RecordingState,
    RecordingStatus,
};
use crate::room::Room;
use crate::storage::{ObjectKey, StorageWriter};
use crate::Frame;

/// What became of an admitted frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Stored { object: ObjectKey, degraded: bool },
    Duplicate { original_timestamp_ms: i64 },
}

struct ActiveRecording {
    session: RecordingSession,
    writer: StorageWriter,
}

/// Message processor for a leased room.
///
/// Owns the room's recording state, the open session and its writer. All
/// calls take `&mut self`, so messages are handled one at a time in the
/// order the connection delivers them.
pub struct RoomSession {
    room: Room,
    state: RecordingState,
    active: Option<ActiveRecording>,
    inner: Arc<GatewayInner>,
    _lease: RoomLease,
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room", &self.room.id)
            .field("state", &self.state)
            .field("session_id", &self.active.as_ref().map(|a| a.session.id()))
            .finish()
    }
}

impl RoomSession {
    pub(super) fn new(room: Room, lease: RoomLease, inner: Arc<GatewayInner>) -> Self {
        Self {
            room,
            state: RecordingState::Idle,
            active: None,
            inner,
            _lease: lease,
        }
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Snapshot of the open session, if any.
    pub fn current_record(&self) -> Option<&RecordingRecord> {
        self.active.as_ref().map(|a| a.session.record())
    }

    /// Parse and handle one raw protocol message.
    pub async fn handle_raw(&mut self, raw: &[u8]) -> Vec<ServerMessage> {
        AtomicGatewayStats::bump(&self.inner.stats.messages_received);
        match InboundMessage::parse(raw) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                AtomicGatewayStats::bump(&self.inner.stats.protocol_errors);
                debug!(room = %self.room.id, error = %e, "Protocol error");
                vec![ServerMessage::error(ErrorKind::ProtocolError, e.to_string())]
            }
        }
    }

    pub async fn handle(&mut self, message: InboundMessage) -> Vec<ServerMessage> {
        let mut replies = Vec::new();
        match message {
            InboundMessage::Control(action) => {
                if let Err(e) = self.control(action.into(), &mut replies).await {
                    replies.push(ServerMessage::error(ErrorKind::InvalidTransition, e.to_string()));
                }
            }
            InboundMessage::Frame(frame) => {
                if let Err(rejection) = self.ingest(&frame, &mut replies).await {
                    replies.push(ServerMessage::error(
                        ErrorKind::from(&rejection),
                        rejection.to_string(),
                    ));
                }
            }
        }
        replies
    }

    /// Drive time-based flushes and surface asynchronous write failures.
    pub async fn tick(&mut self) -> Vec<ServerMessage> {
        let mut replies = Vec::new();
        let failed = match self.active.as_mut() {
            Some(active) => {
                active.writer.tick();
                active.writer.failure().is_some_and(|e| e.is_fatal())
            }
            None => false,
        };
        if failed {
            self.fail_session(&mut replies).await;
        }
        replies
    }

    /// End the connection. An active recording is finalized as if stopped;
    /// the lease is released when the session is dropped.
    pub async fn close(mut self) -> Option<RecordingRecord> {
        let mut replies = Vec::new();
        let finalized = match self.control(ControlInput::Disconnect, &mut replies).await {
            Ok(record) => record,
            Err(e) => {
                warn!(room = %self.room.id, error = %e, "Disconnect rejected");
                None
            }
        };
        info!(room = %self.room.id, state = ?self.state, "Producer disconnected");
        finalized
    }

    /// Apply a lifecycle input. Returns the finalized record when the input
    /// ended a session.
    async fn control(
        &mut self,
        input: ControlInput,
        replies: &mut Vec<ServerMessage>,
    ) -> Result<Option<RecordingRecord>, InvalidTransition> {
        let t = transition(self.state, input).inspect_err(|e| {
            AtomicGatewayStats::bump(&self.inner.stats.invalid_transitions);
            debug!(room = %self.room.id, error = %e, "Invalid transition");
        })?;

        let mut next = t.to;
        let mut finalized = None;
        match t.effect {
            Effect::BeginSession => self.begin_session().await,
            Effect::FlushWriter => {
                if let Some(active) = self.active.as_mut() {
                    active.writer.flush();
                    active.session.set_paused(true);
                }
            }
            Effect::None => {
                if let Some(active) = self.active.as_mut() {
                    active.session.set_paused(next == RecordingState::Paused);
                }
            }
            Effect::Finalize(status) => {
                finalized = self.finalize(status).await;
                // A drain failure during a clean stop lands in Failed
                if finalized
                    .as_ref()
                    .is_some_and(|r| r.status == RecordingStatus::Failed)
                {
                    next = RecordingState::Failed;
                }
            }
        }

        if t.from != next {
            debug!(room = %self.room.id, from = ?t.from, to = ?next, "Recording state changed");
        }
        self.state = next;

        replies.push(ServerMessage::State {
            state: self.state,
            session_id: self.active.as_ref().map(|a| a.session.id()),
        });
        if let Some(record) = &finalized {
            replies.push(ServerMessage::Finalized {
                recording: record.clone(),
            });
        }
        Ok(finalized)
    }

    async fn begin_session(&mut self) {
        let inner = &self.inner;
        let session = RecordingSession::new(self.room.id.clone(), inner.clock.now());
        let mut writer = StorageWriter::new(
            self.room.id.clone(),
            Arc::clone(&inner.store),
            Arc::clone(&inner.clock),
            inner.config.writer.clone(),
        );
        // A failure here is kept by the writer and fails the session on the next tick
        if let Err(e) = writer.open().await {
            warn!(room = %self.room.id, error = %e, "Failed to open first object");
        }

        AtomicGatewayStats::bump(&inner.stats.sessions_started);
        inner.sink.emit(PipelineEvent::SessionCreated {
            room: self.room.id.clone(),
            session_id: session.id(),
            started_at: session.record().started_at,
        });
        self.active = Some(ActiveRecording { session, writer });
    }

    /// Drain the writer and freeze the session. Runs at most once per
    /// session because the active recording is taken.
    async fn finalize(&mut self, requested: RecordingStatus) -> Option<RecordingRecord> {
        let ActiveRecording {
            mut session,
            writer,
        } = self.active.take()?;

        let report = writer.finish().await;
        let status = match (&report.error, requested) {
            (Some(e), RecordingStatus::Stopped) => {
                error!(room = %self.room.id, error = %e, "Drain failed, recording marked failed");
                RecordingStatus::Failed
            }
            _ => requested,
        };

        if !report.unpersisted.is_empty() {
            warn!(
                room = %self.room.id,
                frames = report.unpersisted.len(),
                "Frames lost with the writer, releasing their dedup entries"
            );
            self.inner
                .dedup
                .release(&self.room.id, &report.unpersisted)
                .await;
        }

        let record = session.finalize(status, self.inner.clock.now(), report.summaries())?;

        AtomicGatewayStats::bump(&self.inner.stats.sessions_finalized);
        if status == RecordingStatus::Failed {
            AtomicGatewayStats::bump(&self.inner.stats.sessions_failed);
        }
        self.inner.recordings.upsert(record.clone()).await;
        self.inner.sink.emit(PipelineEvent::SessionFinalized {
            record: record.clone(),
        });
        Some(record)
    }

    async fn fail_session(&mut self, replies: &mut Vec<ServerMessage>) {
        let reason = self
            .active
            .as_ref()
            .and_then(|a| a.writer.failure())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "storage failure".to_string());
        if self.control(ControlInput::WriteFailure, replies).await.is_ok() {
            replies.push(ServerMessage::error(ErrorKind::StorageWriteFailure, reason));
        }
    }

    /// Run one frame through capacity, quota, dedup and storage.
    async fn ingest(
        &mut self,
        frame: &Frame,
        replies: &mut Vec<ServerMessage>,
    ) -> Result<Disposition, Rejection> {
        let result = self.admit_and_store(frame, replies).await;
        let session_id = self.active.as_ref().map(|a| a.session.id());
        let stats = &self.inner.stats;

        let (outcome, degraded) = match &result {
            Ok(Disposition::Stored { object, degraded }) => {
                AtomicGatewayStats::bump(&stats.frames_stored);
                if *degraded {
                    AtomicGatewayStats::bump(&stats.frames_degraded);
                }
                (
                    FrameOutcome::Accepted {
                        object: object.to_string(),
                    },
                    *degraded,
                )
            }
            Ok(Disposition::Duplicate {
                original_timestamp_ms,
            }) => {
                AtomicGatewayStats::bump(&stats.frames_duplicate);
                (
                    FrameOutcome::Duplicate {
                        original_timestamp_ms: *original_timestamp_ms,
                    },
                    false,
                )
            }
            Err(reason) => {
                AtomicGatewayStats::bump(&stats.frames_rejected);
                if let Some(active) = self.active.as_mut() {
                    active.session.record_rejected();
                }
                (
                    FrameOutcome::Rejected {
                        reason: reason.clone(),
                    },
                    false,
                )
            }
        };

        self.inner.sink.emit(PipelineEvent::Frame {
            room: self.room.id.clone(),
            session_id,
            timestamp_ms: frame.timestamp_ms,
            bytes: frame.len() as u64,
            outcome,
            degraded,
        });
        result
    }

    async fn admit_and_store(
        &mut self,
        frame: &Frame,
        replies: &mut Vec<ServerMessage>,
    ) -> Result<Disposition, Rejection> {
        match self.state {
            RecordingState::Recording => {}
            RecordingState::Paused => return Err(Rejection::Paused),
            state => return Err(Rejection::NotRecording { state }),
        }

        // Capacity first so an admitted frame never bounces off a full buffer
        let capacity = match self.active.as_ref() {
            Some(active) => active.writer.can_accept(frame),
            None => {
                return Err(Rejection::NotRecording { state: self.state });
            }
        };
        match capacity {
            Ok(()) => {}
            Err(WriterError::Backpressure { buffered, capacity }) => {
                return Err(Rejection::Backpressure { buffered, capacity });
            }
            Err(_) => {
                self.fail_session(replies).await;
                return Err(Rejection::StorageFailed);
            }
        }

        let bytes = frame.len() as u64;
        self.inner.quota.admit(&self.room.account, bytes).await?;

        let classification = self
            .inner
            .dedup
            .classify(&self.room.id, self.room.config.effective_threshold(), frame)
            .await;

        let Some(active) = self.active.as_mut() else {
            return Err(Rejection::NotRecording { state: self.state });
        };

        match classification {
            Classification::Duplicate {
                original_timestamp_ms,
                ..
            } => {
                active.session.record_duplicate();
                Ok(Disposition::Duplicate {
                    original_timestamp_ms,
                })
            }
            Classification::Unique { degraded, inserted } => {
                match active.writer.append_tracked(frame, inserted).await {
                    Ok(object) => {
                        active.session.record_stored(bytes, degraded);
                        Ok(Disposition::Stored { object, degraded })
                    }
                    Err(e) => {
                        if let Some(fingerprint) = inserted {
                            self.inner.dedup.release(&self.room.id, &[fingerprint]).await;
                        }
                        match e {
                            WriterError::Backpressure { buffered, capacity } => {
                                Err(Rejection::Backpressure { buffered, capacity })
                            }
                            _ => {
                                self.fail_session(replies).await;
                                Err(Rejection::StorageFailed)
                            }
                        }
                    }
                }
            }
        }
    }
}
