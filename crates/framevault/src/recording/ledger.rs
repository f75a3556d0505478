//! Recording records and per-room analytics

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;

use super::{RecordingRecord, RecordingStatus};
use crate::room::RoomId;

/// Aggregates over every recording of a room.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoomAnalytics {
    pub total_storage_bytes: u64,
    pub total_recordings: u64,
    /// Seconds across finalized recordings
    pub total_stream_secs: i64,
    pub frames_stored: u64,
    pub frames_duplicate: u64,
    pub failed_recordings: u64,
    /// Duplicates over frames seen past the quota guard
    pub deduplication_ratio: f32,
}

/// In-process store of recording records, newest last per room.
#[derive(Default)]
pub struct RecordingLedger {
    rooms: RwLock<HashMap<RoomId, Vec<RecordingRecord>>>,
}

impl RecordingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing an earlier snapshot of the same session.
    pub async fn upsert(&self, record: RecordingRecord) {
        let mut rooms = self.rooms.write().await;
        let records = rooms.entry(record.room_id.clone()).or_default();
        match records
            .iter_mut()
            .find(|r| r.session_id == record.session_id)
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    pub async fn for_room(&self, room: &RoomId) -> Vec<RecordingRecord> {
        self.rooms
            .read()
            .await
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn analytics(&self, room: &RoomId) -> RoomAnalytics {
        let rooms = self.rooms.read().await;
        let Some(records) = rooms.get(room) else {
            return RoomAnalytics::default();
        };

        let mut analytics = RoomAnalytics {
            total_recordings: records.len() as u64,
            ..Default::default()
        };
        for record in records {
            analytics.total_storage_bytes += record.size_bytes;
            analytics.frames_stored += record.frame_count;
            analytics.frames_duplicate += record.duplicate_count;
            if record.status == RecordingStatus::Failed {
                analytics.failed_recordings += 1;
            }
            if let Some(duration) = record.duration() {
                analytics.total_stream_secs += duration.num_seconds();
            }
        }
        let seen = analytics.frames_stored + analytics.frames_duplicate;
        if seen > 0 {
            analytics.deduplication_ratio = analytics.frames_duplicate as f32 / seen as f32;
        }
        analytics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingSession;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn upsert_replaces_snapshot_and_aggregates() {
        let ledger = RecordingLedger::new();
        let room = RoomId::new("studio");
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        let mut first = RecordingSession::new(room.clone(), start);
        ledger.upsert(first.record().clone()).await;
        for _ in 0..3 {
            first.record_stored(100, false);
        }
        first.record_duplicate();
        let done = first
            .finalize(
                RecordingStatus::Stopped,
                start + chrono::Duration::seconds(60),
                Vec::new(),
            )
            .unwrap();
        ledger.upsert(done).await;

        let mut second = RecordingSession::new(room.clone(), start);
        second.record_stored(50, false);
        let failed = second
            .finalize(
                RecordingStatus::Failed,
                start + chrono::Duration::seconds(30),
                Vec::new(),
            )
            .unwrap();
        ledger.upsert(failed).await;

        assert_eq!(ledger.for_room(&room).await.len(), 2);

        let analytics = ledger.analytics(&room).await;
        assert_eq!(analytics.total_recordings, 2);
        assert_eq!(analytics.total_storage_bytes, 350);
        assert_eq!(analytics.frames_stored, 4);
        assert_eq!(analytics.frames_duplicate, 1);
        assert_eq!(analytics.failed_recordings, 1);
        assert_eq!(analytics.total_stream_secs, 90);
        assert!((analytics.deduplication_ratio - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unknown_room_has_empty_analytics() {
        let ledger = RecordingLedger::new();
        let room = RoomId::new("nobody");
        assert!(ledger.for_room(&room).await.is_empty());
        assert_eq!(ledger.analytics(&room).await, RoomAnalytics::default());
    }
}
