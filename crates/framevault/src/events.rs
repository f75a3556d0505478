//! Lifecycle and per-frame events for the metrics collaborator

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Rejection;
use crate::recording::{RecordingRecord, RecordingStatus};
use crate::room::RoomId;

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FrameOutcome {
    /// Stored in `object`
    Accepted { object: String },
    /// Dropped as a repeat of the frame at `original_timestamp_ms`
    Duplicate { original_timestamp_ms: i64 },
    Rejected { reason: Rejection },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    SessionCreated {
        room: RoomId,
        session_id: Uuid,
        started_at: DateTime<Utc>,
    },
    SessionFinalized {
        record: RecordingRecord,
    },
    Frame {
        room: RoomId,
        session_id: Option<Uuid>,
        timestamp_ms: i64,
        bytes: u64,
        #[serde(flatten)]
        outcome: FrameOutcome,
        /// Dedup could not be consulted for this frame
        degraded: bool,
    },
}

/// Consumer of pipeline events. Must not block.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Reports events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::SessionCreated {
                room, session_id, ..
            } => {
                info!(%room, session = %session_id, "Recording started");
            }
            PipelineEvent::SessionFinalized { record } => {
                let room = &record.room_id;
                let session = record.session_id;
                if record.status == RecordingStatus::Failed {
                    warn!(
                        %room,
                        %session,
                        frames = record.frame_count,
                        bytes = record.size_bytes,
                        "Recording failed"
                    );
                } else {
                    info!(
                        %room,
                        %session,
                        frames = record.frame_count,
                        duplicates = record.duplicate_count,
                        rejected = record.rejected_count,
                        bytes = record.size_bytes,
                        objects = record.objects.len(),
                        "Recording finalized"
                    );
                }
            }
            PipelineEvent::Frame {
                room,
                timestamp_ms,
                bytes,
                outcome,
                degraded,
                ..
            } => match outcome {
                FrameOutcome::Accepted { object } => {
                    debug!(%room, timestamp_ms, bytes, %object, degraded, "Frame stored")
                }
                FrameOutcome::Duplicate {
                    original_timestamp_ms,
                } => debug!(%room, timestamp_ms, original_timestamp_ms, "Frame deduplicated"),
                FrameOutcome::Rejected { reason } => {
                    debug!(%room, timestamp_ms, bytes, %reason, "Frame rejected")
                }
            },
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Per-frame outcomes, in emission order.
    pub fn frame_outcomes(&self) -> Vec<(FrameOutcome, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::Frame {
                    outcome, degraded, ..
                } => Some((outcome, degraded)),
                _ => None,
            })
            .collect()
    }

    pub fn finalized(&self) -> Vec<RecordingRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::SessionFinalized { record } => Some(record),
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn emit(&self, event: PipelineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_event_serializes_flat() {
        let event = PipelineEvent::Frame {
            room: RoomId::new("r"),
            session_id: None,
            timestamp_ms: 7,
            bytes: 3,
            outcome: FrameOutcome::Duplicate {
                original_timestamp_ms: 5,
            },
            degraded: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "frame");
        assert_eq!(json["outcome"], "duplicate");
        assert_eq!(json["original_timestamp_ms"], 5);
    }

    #[test]
    fn memory_sink_filters() {
        let sink = MemorySink::new();
        sink.emit(PipelineEvent::Frame {
            room: RoomId::new("r"),
            session_id: None,
            timestamp_ms: 1,
            bytes: 1,
            outcome: FrameOutcome::Rejected {
                reason: Rejection::Paused,
            },
            degraded: false,
        });
        assert_eq!(sink.events().len(), 1);
        assert_eq!(
            sink.frame_outcomes(),
            vec![(
                FrameOutcome::Rejected {
                    reason: Rejection::Paused
                },
                false
            )]
        );
        assert!(sink.finalized().is_empty());
    }
}
