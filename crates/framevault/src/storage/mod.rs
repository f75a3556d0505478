//! Day-sliced object storage for accepted frames
//!
//! Objects are addressed as `{room}/{yyyy-mm-dd}/{sequence}.raw`. Each object
//! is an append log of encoded entries (see [`entry`]) and becomes immutable
//! once sealed.
//!
//! - [`BlobStore`]: append/seal/read contract, with in-memory and local
//!   filesystem implementations
//! - [`StorageWriter`]: per-session buffering, rollover and flushing

pub mod entry;
pub mod local;
pub mod memory;
mod retry;
pub mod writer;

use std::fmt;

use bytes::Bytes;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::BlobError;
use crate::room::RoomId;

pub use entry::{decode_entries, encode_entry, encoded_len, EntryError, ENTRY_HEADER_LEN};
pub use local::{LocalBlobStore, LocalBlobStoreConfig};
pub use memory::MemoryBlobStore;
pub use retry::{retry_with_backoff, RetryPolicy};
pub use writer::{DrainReport, SealedObject, StorageWriter, WriterConfig};

const DATE_FORMAT: &str = "%Y-%m-%d";
const OBJECT_SUFFIX: &str = ".raw";

/// Storage key of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub room: RoomId,
    pub date: NaiveDate,
    pub sequence: u32,
}

impl ObjectKey {
    pub fn new(room: RoomId, date: NaiveDate, sequence: u32) -> Self {
        Self {
            room,
            date,
            sequence,
        }
    }

    /// Prefix shared by every object of a room on one day.
    pub fn day_prefix(room: &RoomId, date: NaiveDate) -> String {
        format!("{}/{}/", room, date.format(DATE_FORMAT))
    }

    /// Parse `{room}/{yyyy-mm-dd}/{sequence}.raw`.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.rsplitn(3, '/');
        let file = parts.next()?;
        let date = parts.next()?;
        let room = parts.next()?;
        if room.is_empty() {
            return None;
        }
        let sequence = file.strip_suffix(OBJECT_SUFFIX)?.parse().ok()?;
        let date = NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?;
        Some(Self::new(RoomId::new(room), date, sequence))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            Self::day_prefix(&self.room, self.date),
            self.sequence,
            OBJECT_SUFFIX
        )
    }
}

/// Object store contract used by the writer.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Append `data` to `key`, creating the object if needed. When `seal` is
    /// set the object becomes immutable after this write; sealing an already
    /// sealed object with empty `data` succeeds. Returns the object size.
    async fn append(&self, key: &ObjectKey, data: Bytes, seal: bool) -> Result<u64, BlobError>;

    /// Full contents of an object
    async fn read(&self, key: &ObjectKey) -> Result<Bytes, BlobError>;

    async fn is_sealed(&self, key: &ObjectKey) -> Result<bool, BlobError>;

    /// Objects of a room on one day, ordered by sequence
    async fn list(&self, room: &RoomId, date: NaiveDate) -> Result<Vec<ObjectKey>, BlobError>;
}
