//! Local filesystem blob store
//!
//! Objects live at `{root}/{room}/{yyyy-mm-dd}/{sequence}.raw`. A sealed
//! object has an empty `{sequence}.raw.sealed` marker next to it. An index of
//! sizes and seal flags is rebuilt from disk on open.
//!
//! Writes to one object are serialized by a per-key lock. The index lock is
//! only held to read or record metadata, never across file I/O, so rooms
//! write in parallel.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::NaiveDate;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{BlobStore, ObjectKey, DATE_FORMAT, OBJECT_SUFFIX};
use crate::error::BlobError;
use crate::room::RoomId;

const SEAL_SUFFIX: &str = ".sealed";

/// Configuration for the local store
#[derive(Debug, Clone)]
pub struct LocalBlobStoreConfig {
    /// Root directory for objects
    pub root_path: PathBuf,
    /// fsync after every sealing write
    pub sync_on_seal: bool,
}

impl Default for LocalBlobStoreConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/lib/framevault/objects"),
            sync_on_seal: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ObjectMeta {
    size_bytes: u64,
    sealed: bool,
}

#[derive(Default)]
struct StoreIndex {
    objects: HashMap<ObjectKey, ObjectMeta>,
    total_bytes: u64,
}

pub struct LocalBlobStore {
    config: LocalBlobStoreConfig,
    index: RwLock<StoreIndex>,
    /// One writer lock per open object
    locks: StdMutex<HashMap<ObjectKey, Arc<Mutex<()>>>>,
}

impl LocalBlobStore {
    /// Open a store, creating the root directory and indexing what is there.
    pub fn open(config: LocalBlobStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_path).with_context(|| {
            format!("Failed to create storage directory: {:?}", config.root_path)
        })?;

        let index = Self::rebuild_index_sync(&config.root_path)?;

        Ok(Self {
            config,
            index: RwLock::new(index),
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Walk root/room/date/*.raw
    fn rebuild_index_sync(root: &Path) -> Result<StoreIndex> {
        info!("Scanning storage directory: {:?}", root);

        let mut index = StoreIndex::default();
        for room_dir in read_dirs(root)? {
            let Some(room) = room_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let room = RoomId::new(room);

            for day_dir in read_dirs(&room_dir)? {
                let Some(date) = day_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| NaiveDate::parse_from_str(n, DATE_FORMAT).ok())
                else {
                    continue;
                };

                for entry in fs::read_dir(&day_dir)?.flatten() {
                    let path = entry.path();
                    let Some(sequence) = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(|n| n.strip_suffix(OBJECT_SUFFIX))
                        .and_then(|n| n.parse::<u32>().ok())
                    else {
                        continue;
                    };
                    let size_bytes = entry.metadata()?.len();
                    let sealed = seal_marker(&path).exists();
                    index.total_bytes += size_bytes;
                    index.objects.insert(
                        ObjectKey::new(room.clone(), date, sequence),
                        ObjectMeta { size_bytes, sealed },
                    );
                }
            }
        }

        info!(
            "Found {} objects, {} total bytes",
            index.objects.len(),
            index.total_bytes
        );
        Ok(index)
    }

    fn object_path(&self, key: &ObjectKey) -> Result<PathBuf, BlobError> {
        let room = key.room.as_str();
        if room.is_empty()
            || room == "."
            || room == ".."
            || room.contains(['/', '\\'])
        {
            return Err(BlobError::Backend(format!("invalid room id {:?}", room)));
        }
        Ok(self
            .config
            .root_path
            .join(room)
            .join(key.date.format(DATE_FORMAT).to_string())
            .join(format!("{}{}", key.sequence, OBJECT_SUFFIX)))
    }

    fn key_lock(&self, key: &ObjectKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn forget_lock(&self, key: &ObjectKey) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Bytes across every object
    pub async fn usage_bytes(&self) -> u64 {
        self.index.read().await.total_bytes
    }

    pub async fn object_count(&self) -> usize {
        self.index.read().await.objects.len()
    }
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path)?.flatten() {
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn seal_marker(path: &Path) -> PathBuf {
    let mut marker = path.as_os_str().to_owned();
    marker.push(SEAL_SUFFIX);
    PathBuf::from(marker)
}

fn write_object(path: &Path, data: &[u8], seal: bool, sync: bool) -> std::io::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data)?;
    if seal {
        if sync {
            file.sync_data()?;
        }
        fs::File::create(seal_marker(path))?;
    }
    Ok(file.metadata()?.len())
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn append(&self, key: &ObjectKey, data: Bytes, seal: bool) -> Result<u64, BlobError> {
        let path = self.object_path(key)?;

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let meta = self
            .index
            .read()
            .await
            .objects
            .get(key)
            .copied()
            .unwrap_or_default();
        if meta.sealed {
            if data.is_empty() && seal {
                return Ok(meta.size_bytes);
            }
            return Err(BlobError::Sealed(key.to_string()));
        }

        let sync = self.config.sync_on_seal;
        let size_bytes = tokio::task::spawn_blocking(move || write_object(&path, &data, seal, sync))
            .await
            .map_err(|e| BlobError::Backend(format!("write task failed: {}", e)))??;

        {
            let mut index = self.index.write().await;
            index.total_bytes = index.total_bytes.saturating_sub(meta.size_bytes) + size_bytes;
            index.objects.insert(
                key.clone(),
                ObjectMeta {
                    size_bytes,
                    sealed: seal,
                },
            );
        }
        if seal {
            // Sealed objects are never written again
            self.forget_lock(key);
            debug!(object = %key, size_bytes, "Sealed object");
        }
        Ok(size_bytes)
    }

    async fn read(&self, key: &ObjectKey) -> Result<Bytes, BlobError> {
        let path = self.object_path(key)?;
        if !self.index.read().await.objects.contains_key(key) {
            return Err(BlobError::NotFound(key.to_string()));
        }
        let data = tokio::task::spawn_blocking(move || fs::read(path))
            .await
            .map_err(|e| BlobError::Backend(format!("read task failed: {}", e)))??;
        Ok(Bytes::from(data))
    }

    async fn is_sealed(&self, key: &ObjectKey) -> Result<bool, BlobError> {
        self.index
            .read()
            .await
            .objects
            .get(key)
            .map(|m| m.sealed)
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn list(&self, room: &RoomId, date: NaiveDate) -> Result<Vec<ObjectKey>, BlobError> {
        let mut keys: Vec<ObjectKey> = self
            .index
            .read()
            .await
            .objects
            .keys()
            .filter(|k| &k.room == room && k.date == date)
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> LocalBlobStoreConfig {
        LocalBlobStoreConfig {
            root_path: dir.to_path_buf(),
            sync_on_seal: false,
        }
    }

    fn key(room: &str, day: u32, seq: u32) -> ObjectKey {
        ObjectKey::new(
            RoomId::new(room),
            NaiveDate::from_ymd_opt(2024, 2, day).unwrap(),
            seq,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn append_seal_and_read() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::open(test_config(dir.path())).unwrap();
        let k = key("lobby", 3, 0);

        store.append(&k, Bytes::from_static(b"hello "), false).await.unwrap();
        let size = store.append(&k, Bytes::from_static(b"world"), true).await.unwrap();
        assert_eq!(size, 11);

        assert!(store.is_sealed(&k).await.unwrap());
        assert_eq!(store.read(&k).await.unwrap(), Bytes::from_static(b"hello world"));
        assert!(dir.path().join("lobby/2024-02-03/0.raw").exists());
        assert!(dir.path().join("lobby/2024-02-03/0.raw.sealed").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sealed_object_rejects_appends() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::open(test_config(dir.path())).unwrap();
        let k = key("lobby", 3, 0);

        store.append(&k, Bytes::from_static(b"x"), true).await.unwrap();
        assert!(matches!(
            store.append(&k, Bytes::from_static(b"y"), false).await,
            Err(BlobError::Sealed(_))
        ));
        assert_eq!(store.append(&k, Bytes::new(), true).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn index_rebuilds_from_existing_files() {
        let dir = tempdir().unwrap();

        {
            let store = LocalBlobStore::open(test_config(dir.path())).unwrap();
            store.append(&key("a", 1, 0), Bytes::from_static(b"sealed"), true).await.unwrap();
            store.append(&key("a", 1, 1), Bytes::from_static(b"open"), false).await.unwrap();
            store.append(&key("b", 2, 0), Bytes::from_static(b"other"), true).await.unwrap();
        }

        // Stray files are ignored
        fs::write(dir.path().join("a/2024-02-01/notes.txt"), b"ignore").unwrap();

        let store = LocalBlobStore::open(test_config(dir.path())).unwrap();
        assert_eq!(store.object_count().await, 3);
        assert_eq!(store.usage_bytes().await, 15);
        assert!(store.is_sealed(&key("a", 1, 0)).await.unwrap());
        assert!(!store.is_sealed(&key("a", 1, 1)).await.unwrap());

        let listed = store
            .list(&RoomId::new("a"), key("a", 1, 0).date)
            .await
            .unwrap();
        assert_eq!(listed, vec![key("a", 1, 0), key("a", 1, 1)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn path_traversal_is_refused() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::open(test_config(dir.path())).unwrap();
        for room in ["..", "a/b", ""] {
            let err = store
                .append(&key(room, 1, 0), Bytes::from_static(b"x"), false)
                .await
                .unwrap_err();
            assert!(matches!(err, BlobError::Backend(_)), "{}", room);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_object_is_not_found() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::open(test_config(dir.path())).unwrap();
        assert!(matches!(
            store.read(&key("a", 1, 0)).await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn busy_object_does_not_block_other_rooms() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::open(test_config(dir.path())).unwrap());
        let busy = key("a", 1, 0);

        // Stand in for a long write on room a
        let lock = store.key_lock(&busy);
        let guard = lock.lock().await;
        let blocked = tokio::spawn({
            let store = Arc::clone(&store);
            let busy = busy.clone();
            async move { store.append(&busy, Bytes::from_static(b"late"), true).await }
        });

        let other = key("b", 1, 0);
        let done = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            store.list(&RoomId::new("a"), busy.date).await.unwrap();
            store.append(&other, Bytes::from_static(b"free"), true).await.unwrap()
        })
        .await
        .unwrap();
        assert_eq!(done, 4);
        assert!(!blocked.is_finished());

        drop(guard);
        assert_eq!(blocked.await.unwrap().unwrap(), 4);
        assert!(store.is_sealed(&busy).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_appends_to_one_object_do_not_interleave() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::open(test_config(dir.path())).unwrap());
        let k = key("a", 1, 0);

        let mut tasks = Vec::new();
        for chunk in [b"aaaa", b"bbbb", b"cccc", b"dddd"] {
            let store = Arc::clone(&store);
            let k = k.clone();
            tasks.push(tokio::spawn(async move {
                store.append(&k, Bytes::from_static(chunk), false).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let data = store.read(&k).await.unwrap();
        assert_eq!(data.len(), 16);
        assert!(data.chunks(4).all(|c| c.iter().all(|b| *b == c[0])));
        assert_eq!(store.usage_bytes().await, 16);
    }
}
