//! Object entry format
//!
//! ```text
//! ┌───────────────┬──────────┬──────────────┬─────────────┐
//! │ timestamp_ms  │  kind    │ payload_len  │  payload    │
//! │  (i64, 8 B)   │ (u8,1 B) │  (u32, 4 B)  │   (var)     │
//! └───────────────┴──────────┴──────────────┴─────────────┘
//! ```
//!
//! All integers little endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{Frame, FrameKind};

pub const ENTRY_HEADER_LEN: usize = 8 + 1 + 4;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntryError {
    #[error("truncated entry at offset {offset}")]
    Truncated { offset: usize },
    #[error("unknown frame kind {kind} at offset {offset}")]
    UnknownKind { offset: usize, kind: u8 },
}

/// Encoded size of a frame.
pub fn encoded_len(frame: &Frame) -> usize {
    ENTRY_HEADER_LEN + frame.payload.len()
}

/// Append one encoded entry to `buf`.
pub fn encode_entry(frame: &Frame, buf: &mut BytesMut) {
    buf.reserve(encoded_len(frame));
    buf.put_i64_le(frame.timestamp_ms);
    buf.put_u8(frame.kind.as_u8());
    buf.put_u32_le(frame.payload.len() as u32);
    buf.put_slice(&frame.payload);
}

/// Decode every entry of an object, in write order.
pub fn decode_entries(data: &[u8]) -> Result<Vec<Frame>, EntryError> {
    let mut frames = Vec::new();
    let mut cursor = data;
    while cursor.has_remaining() {
        let offset = data.len() - cursor.remaining();
        if cursor.remaining() < ENTRY_HEADER_LEN {
            return Err(EntryError::Truncated { offset });
        }
        let timestamp_ms = cursor.get_i64_le();
        let kind_byte = cursor.get_u8();
        let len = cursor.get_u32_le() as usize;

        let kind =
            FrameKind::from_u8(kind_byte).ok_or(EntryError::UnknownKind { offset, kind: kind_byte })?;
        if cursor.remaining() < len {
            return Err(EntryError::Truncated { offset });
        }
        let payload = Bytes::copy_from_slice(&cursor[..len]);
        cursor.advance(len);

        frames.push(Frame {
            timestamp_ms,
            kind,
            payload,
        });
    }
    Ok(frames)
}
