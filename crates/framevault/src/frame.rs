//! Frame types for the audio/video ingestion path

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind of media carried by a frame.
///
/// Serialized by name (`"Video"`, `"Audio"`) on the producer protocol and
/// as a single byte inside stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Encoded video frame
    Video,
    /// Encoded audio packet
    Audio,
}

impl FrameKind {
    /// Convert to the on-disk byte value.
    pub fn as_u8(&self) -> u8 {
        match self {
            FrameKind::Video => 0,
            FrameKind::Audio => 1,
        }
    }

    /// Parse the on-disk byte value. Unknown values are rejected.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Video),
            1 => Some(FrameKind::Audio),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::Video => write!(f, "video"),
            FrameKind::Audio => write!(f, "audio"),
        }
    }
}

/// A single media frame as received from the producer.
///
/// Frames are transient: only the outcome (stored or duplicate) outlives
/// the call that processes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Producer timestamp in milliseconds
    pub timestamp_ms: i64,
    /// Media kind
    pub kind: FrameKind,
    /// Encoded payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a video frame
    pub fn video(timestamp_ms: i64, payload: Bytes) -> Self {
        Self {
            timestamp_ms,
            kind: FrameKind::Video,
            payload,
        }
    }

    /// Create an audio frame
    pub fn audio(timestamp_ms: i64, payload: Bytes) -> Self {
        Self {
            timestamp_ms,
            kind: FrameKind::Audio,
            payload,
        }
    }

    /// Payload size in bytes, the unit charged against quota.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
