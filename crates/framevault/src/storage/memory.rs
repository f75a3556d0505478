//! In-memory blob store

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use chrono::NaiveDate;
use tokio::sync::RwLock;

use super::{BlobStore, ObjectKey};
use crate::error::BlobError;
use crate::room::RoomId;

#[derive(Default)]
struct StoredObject {
    data: BytesMut,
    sealed: bool,
}

/// Blob store kept entirely in memory. Objects are ordered by key.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<ObjectKey, StoredObject>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every object key, in key order.
    pub async fn keys(&self) -> Vec<ObjectKey> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .await
            .values()
            .map(|o| o.data.len() as u64)
            .sum()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn append(&self, key: &ObjectKey, data: Bytes, seal: bool) -> Result<u64, BlobError> {
        let mut objects = self.objects.write().await;
        let object = objects.entry(key.clone()).or_default();
        if object.sealed {
            if data.is_empty() && seal {
                return Ok(object.data.len() as u64);
            }
            return Err(BlobError::Sealed(key.to_string()));
        }
        object.data.extend_from_slice(&data);
        object.sealed |= seal;
        Ok(object.data.len() as u64)
    }

    async fn read(&self, key: &ObjectKey) -> Result<Bytes, BlobError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| Bytes::copy_from_slice(&o.data))
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn is_sealed(&self, key: &ObjectKey) -> Result<bool, BlobError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|o| o.sealed)
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn list(&self, room: &RoomId, date: NaiveDate) -> Result<Vec<ObjectKey>, BlobError> {
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| &k.room == room && k.date == date)
            .cloned()
            .collect())
    }
}
