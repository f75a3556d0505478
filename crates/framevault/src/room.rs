//! Rooms and the room directory collaborator
//!
//! Room CRUD lives outside the pipeline. The gateway only needs to resolve a
//! room id to its owning account and declared configuration, and to bump
//! `last_active` when a producer connects.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Identifies a room. Used verbatim as the first segment of storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the account that owns rooms and their storage quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declared media and dedup configuration of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub frame_rate: Option<u32>,
    pub resolution: Option<String>,
    pub max_bitrate: Option<u32>,
    /// When false every frame bypasses the dedup engine
    pub dedup_enabled: bool,
    /// Similarity threshold in `[0.0, 1.0]`; 1.0 means exact match only
    pub dedup_threshold: f32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            video_codec: None,
            audio_codec: None,
            frame_rate: None,
            resolution: None,
            max_bitrate: None,
            dedup_enabled: true,
            dedup_threshold: 1.0,
        }
    }
}

impl RoomConfig {
    /// Threshold clamped into the valid range, or None when dedup is off.
    pub fn effective_threshold(&self) -> Option<f32> {
        if !self.dedup_enabled {
            return None;
        }
        if self.dedup_threshold.is_nan() {
            return Some(1.0);
        }
        Some(self.dedup_threshold.clamp(0.0, 1.0))
    }
}

/// A room as known to the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub account: AccountId,
    #[serde(default)]
    pub config: RoomConfig,
    pub created_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
}

impl Room {
    pub fn new(id: RoomId, account: AccountId, config: RoomConfig) -> Self {
        Self {
            id,
            account,
            config,
            created_at: Utc::now(),
            last_active: None,
        }
    }
}

/// Room lookup collaborator.
#[async_trait::async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Resolve a room, `None` if it does not exist
    async fn room(&self, id: &RoomId) -> Result<Option<Room>>;

    /// Record producer activity on a room
    async fn touch(&self, id: &RoomId, at: DateTime<Utc>) -> Result<()>;
}

/// In-process room directory.
#[derive(Default)]
pub struct MemoryRoomDirectory {
    rooms: RwLock<HashMap<RoomId, Room>>,
}

impl MemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, room: Room) {
        self.rooms.write().await.insert(room.id.clone(), room);
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl RoomDirectory for MemoryRoomDirectory {
    async fn room(&self, id: &RoomId) -> Result<Option<Room>> {
        Ok(self.rooms.read().await.get(id).cloned())
    }

    async fn touch(&self, id: &RoomId, at: DateTime<Utc>) -> Result<()> {
        if let Some(room) = self.rooms.write().await.get_mut(id) {
            room.last_active = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_exact_match_dedup() {
        assert_eq!(RoomConfig::default().effective_threshold(), Some(1.0));
    }

    #[test]
    fn disabled_dedup_has_no_threshold() {
        let config = RoomConfig {
            dedup_enabled: false,
            ..Default::default()
        };
        assert_eq!(config.effective_threshold(), None);
    }

    #[test]
    fn threshold_is_clamped() {
        let high = RoomConfig {
            dedup_threshold: 3.0,
            ..Default::default()
        };
        assert_eq!(high.effective_threshold(), Some(1.0));

        let low = RoomConfig {
            dedup_threshold: -1.0,
            ..Default::default()
        };
        assert_eq!(low.effective_threshold(), Some(0.0));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: RoomConfig = serde_json::from_str(r#"{"frame_rate":30}"#).unwrap();
        assert_eq!(config.frame_rate, Some(30));
        assert!(config.dedup_enabled);
        assert_eq!(config.dedup_threshold, 1.0);
    }

    #[tokio::test]
    async fn touch_updates_last_active() {
        let directory = MemoryRoomDirectory::new();
        let id = RoomId::new("lobby");
        directory
            .insert(Room::new(id.clone(), AccountId::new("acct"), RoomConfig::default()))
            .await;

        let now = Utc::now();
        directory.touch(&id, now).await.unwrap();
        let room = directory.room(&id).await.unwrap().unwrap();
        assert_eq!(room.last_active, Some(now));

        assert!(directory
            .room(&RoomId::new("missing"))
            .await
            .unwrap()
            .is_none());
    }
}
