//! Recording session bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::room::RoomId;

/// Persisted status of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Recording,
    Paused,
    Stopped,
    Failed,
}

/// One sealed object of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size_bytes: u64,
    pub frame_count: u32,
}

/// Immutable view of a session, exposed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRecord {
    pub session_id: Uuid,
    pub room_id: RoomId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Key prefix every object of this session lives under
    pub storage_path: String,
    /// Accepted payload bytes
    pub size_bytes: u64,
    /// Frames stored
    pub frame_count: u64,
    pub duplicate_count: u64,
    pub rejected_count: u64,
    /// Frames stored without a dedup decision
    pub degraded_count: u64,
    pub status: RecordingStatus,
    /// Sealed object keys in write order
    pub objects: Vec<String>,
    /// Size and frame count per sealed object, same order as `objects`
    #[serde(default)]
    pub sealed_objects: Vec<ObjectSummary>,
}

impl RecordingRecord {
    /// Recording duration, if finalized.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// One Start/Stop cycle of a room.
///
/// Counters move while the session is open. [`finalize`](Self::finalize)
/// succeeds once; afterwards the session is frozen.
#[derive(Debug)]
pub struct RecordingSession {
    record: RecordingRecord,
    finalized: bool,
}

impl RecordingSession {
    pub fn new(room: RoomId, started_at: DateTime<Utc>) -> Self {
        let storage_path = format!("{}/", room);
        Self {
            record: RecordingRecord {
                session_id: Uuid::new_v4(),
                room_id: room,
                started_at,
                ended_at: None,
                storage_path,
                size_bytes: 0,
                frame_count: 0,
                duplicate_count: 0,
                rejected_count: 0,
                degraded_count: 0,
                status: RecordingStatus::Recording,
                objects: Vec::new(),
                sealed_objects: Vec::new(),
            },
            finalized: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.session_id
    }

    pub fn room(&self) -> &RoomId {
        &self.record.room_id
    }

    pub fn status(&self) -> RecordingStatus {
        self.record.status
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn record(&self) -> &RecordingRecord {
        &self.record
    }

    pub fn record_stored(&mut self, bytes: u64, degraded: bool) {
        if self.finalized {
            return;
        }
        self.record.size_bytes += bytes;
        self.record.frame_count += 1;
        if degraded {
            self.record.degraded_count += 1;
        }
    }

    pub fn record_duplicate(&mut self) {
        if !self.finalized {
            self.record.duplicate_count += 1;
        }
    }

    pub fn record_rejected(&mut self) {
        if !self.finalized {
            self.record.rejected_count += 1;
        }
    }

    /// Track pause/resume. Terminal statuses go through `finalize`.
    pub fn set_paused(&mut self, paused: bool) {
        if self.finalized {
            return;
        }
        self.record.status = if paused {
            RecordingStatus::Paused
        } else {
            RecordingStatus::Recording
        };
    }

    /// Freeze the session. Returns `None` if it was already finalized.
    pub fn finalize(
        &mut self,
        status: RecordingStatus,
        ended_at: DateTime<Utc>,
        sealed: Vec<ObjectSummary>,
    ) -> Option<RecordingRecord> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        self.record.status = status;
        self.record.ended_at = Some(ended_at);
        self.record.objects = sealed.iter().map(|o| o.key.clone()).collect();
        self.record.sealed_objects = sealed;
        Some(self.record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn counters_accumulate() {
        let mut session = RecordingSession::new(RoomId::new("lobby"), at(0));
        session.record_stored(100, false);
        session.record_stored(50, true);
        session.record_duplicate();
        session.record_rejected();

        let record = session.record();
        assert_eq!(record.size_bytes, 150);
        assert_eq!(record.frame_count, 2);
        assert_eq!(record.degraded_count, 1);
        assert_eq!(record.duplicate_count, 1);
        assert_eq!(record.rejected_count, 1);
        assert_eq!(record.storage_path, "lobby/");
        assert_eq!(record.status, RecordingStatus::Recording);
    }

    #[test]
    fn finalize_happens_once() {
        let mut session = RecordingSession::new(RoomId::new("r"), at(0));
        session.record_stored(10, false);

        let record = session
            .finalize(
                RecordingStatus::Stopped,
                at(90),
                vec![ObjectSummary {
                    key: "r/2023-11-14/0.raw".into(),
                    size_bytes: 23,
                    frame_count: 1,
                }],
            )
            .unwrap();
        assert_eq!(record.status, RecordingStatus::Stopped);
        assert_eq!(record.duration(), Some(chrono::Duration::seconds(90)));
        assert_eq!(record.objects, vec!["r/2023-11-14/0.raw".to_string()]);
        assert_eq!(record.sealed_objects[0].frame_count, 1);

        assert!(session
            .finalize(RecordingStatus::Failed, at(100), Vec::new())
            .is_none());
        assert_eq!(session.status(), RecordingStatus::Stopped);
    }

    #[test]
    fn finalized_session_is_frozen() {
        let mut session = RecordingSession::new(RoomId::new("r"), at(0));
        session.finalize(RecordingStatus::Stopped, at(1), Vec::new());
        session.record_stored(10, false);
        session.set_paused(true);
        assert_eq!(session.record().frame_count, 0);
        assert_eq!(session.status(), RecordingStatus::Stopped);
    }
}
