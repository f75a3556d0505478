//! Per-session storage writer
//!
//! Accepted frames are encoded into an in-memory buffer for the room's open
//! object. Buffers are handed to a background flusher task that appends them
//! to the blob store in FIFO order, retrying with exponential backoff. Because
//! the queue is ordered, a sealing write always lands before the first write
//! of the next object.
//!
//! An object is sealed and a new one opened when the wall-clock date at frame
//! arrival differs from the open object's date, or when the frame would push
//! the object past `max_object_bytes`. A single frame larger than the cap
//! still gets an object of its own.
//!
//! The writer also remembers the dedup fingerprints of frames that have not
//! reached the store yet. Jobs complete in order, so a single counter of
//! completed jobs tells which of them were persisted when the writer ends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::entry::{encode_entry, encoded_len};
use super::retry::{retry_with_backoff, RetryPolicy};
use super::{BlobStore, ObjectKey};
use crate::clock::Clock;
use crate::dedup::Fingerprint;
use crate::error::WriterError;
use crate::recording::ObjectSummary;
use crate::room::RoomId;
use crate::Frame;

/// Storage writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush buffered bytes at least this often
    pub flush_interval: Duration,
    /// Flush as soon as this many bytes are buffered
    pub flush_bytes: usize,
    /// Object size cap before rotation
    pub max_object_bytes: u64,
    /// Bytes buffered plus in flight before frames are refused
    pub buffer_capacity: u64,
    pub retry: RetryPolicy,
    /// Upper bound on draining at session end
    pub drain_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            flush_bytes: 256 * 1024,
            max_object_bytes: 64 * 1024 * 1024,
            buffer_capacity: 16 * 1024 * 1024,
            retry: RetryPolicy::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// An object the flusher has sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SealedObject {
    pub key: ObjectKey,
    pub size_bytes: u64,
    pub frame_count: u32,
}

impl From<&SealedObject> for ObjectSummary {
    fn from(object: &SealedObject) -> Self {
        Self {
            key: object.key.to_string(),
            size_bytes: object.size_bytes,
            frame_count: object.frame_count,
        }
    }
}

/// Outcome of [`StorageWriter::finish`].
#[derive(Debug)]
pub struct DrainReport {
    /// Objects sealed by this writer, in seal order
    pub objects: Vec<SealedObject>,
    /// Set when a write failed or the drain timed out
    pub error: Option<WriterError>,
    /// Fingerprints of tracked frames whose bytes never reached the store
    pub unpersisted: Vec<Fingerprint>,
}

impl DrainReport {
    pub fn object_keys(&self) -> Vec<String> {
        self.objects.iter().map(|o| o.key.to_string()).collect()
    }

    pub fn summaries(&self) -> Vec<ObjectSummary> {
        self.objects.iter().map(ObjectSummary::from).collect()
    }
}

struct FlushJob {
    key: ObjectKey,
    data: Bytes,
    /// Frame count of the object when this write seals it
    seal: Option<u32>,
}

/// State shared with the flusher task
#[derive(Default)]
struct FlushState {
    in_flight: AtomicU64,
    /// Jobs written successfully; later jobs are never counted after a failure
    completed: AtomicU64,
    failure: OnceLock<WriterError>,
    sealed: Mutex<Vec<SealedObject>>,
}

impl FlushState {
    fn fail(&self, err: WriterError) -> WriterError {
        // First failure wins
        let _ = self.failure.set(err);
        self.failure.get().cloned().unwrap_or(WriterError::Fatal {
            key: String::new(),
            attempts: 0,
            reason: "unknown".into(),
        })
    }

    fn sealed(&self) -> Vec<SealedObject> {
        self.sealed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct OpenObject {
    key: ObjectKey,
    bytes: u64,
    entries: u32,
}

impl OpenObject {
    fn new(key: ObjectKey) -> Self {
        Self {
            key,
            bytes: 0,
            entries: 0,
        }
    }
}

pub struct StorageWriter {
    room: RoomId,
    store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: WriterConfig,
    current: Option<OpenObject>,
    /// Last object opened by this writer, for sequence continuation
    last_key: Option<ObjectKey>,
    buffer: BytesMut,
    last_flush: Instant,
    /// Fingerprints of tracked frames in `buffer`
    pending: Vec<Fingerprint>,
    /// Fingerprints per submitted job that may not be written yet
    unconfirmed: VecDeque<(u64, Vec<Fingerprint>)>,
    submitted: u64,
    state: Arc<FlushState>,
    jobs: mpsc::UnboundedSender<FlushJob>,
    flusher: JoinHandle<()>,
}

impl StorageWriter {
    /// Create a writer for `room` and spawn its flusher task.
    pub fn new(
        room: RoomId,
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        config: WriterConfig,
    ) -> Self {
        let state = Arc::new(FlushState::default());
        let (jobs, rx) = mpsc::unbounded_channel();
        let flusher = tokio::spawn(run_flusher(
            room.clone(),
            Arc::clone(&store),
            Arc::clone(&state),
            config.retry,
            rx,
        ));

        Self {
            room,
            store,
            clock,
            config,
            current: None,
            last_key: None,
            buffer: BytesMut::new(),
            last_flush: Instant::now(),
            pending: Vec::new(),
            unconfirmed: VecDeque::new(),
            submitted: 0,
            state,
            jobs,
            flusher,
        }
    }

    /// Bytes buffered locally plus bytes queued for the store.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffer.len() as u64 + self.state.in_flight.load(Ordering::Acquire)
    }

    /// The failure that ended this writer, if any.
    pub fn failure(&self) -> Option<WriterError> {
        self.state.failure.get().cloned()
    }

    /// Key of the object currently receiving frames.
    pub fn current_key(&self) -> Option<&ObjectKey> {
        self.current.as_ref().map(|o| &o.key)
    }

    /// Whether `frame` fits in the buffer right now.
    pub fn can_accept(&self, frame: &Frame) -> Result<(), WriterError> {
        self.check_capacity(encoded_len(frame) as u64)
    }

    fn check_capacity(&self, entry_len: u64) -> Result<(), WriterError> {
        if let Some(err) = self.failure() {
            return Err(err);
        }
        let buffered = self.buffered_bytes();
        if buffered + entry_len > self.config.buffer_capacity {
            return Err(WriterError::Backpressure {
                buffered,
                capacity: self.config.buffer_capacity,
            });
        }
        Ok(())
    }

    /// Open the first object of the session ahead of any frame.
    pub async fn open(&mut self) -> Result<ObjectKey, WriterError> {
        if let Some(open) = &self.current {
            return Ok(open.key.clone());
        }
        let key = self.next_key(self.clock.now().date_naive()).await?;
        self.current = Some(OpenObject::new(key.clone()));
        Ok(key)
    }

    /// Buffer one frame. Returns the key of the object it was written to.
    pub async fn append(&mut self, frame: &Frame) -> Result<ObjectKey, WriterError> {
        self.append_tracked(frame, None).await
    }

    /// Like [`append`](Self::append), remembering `fingerprint` until the
    /// frame's bytes are written so it can be reported if they never are.
    pub async fn append_tracked(
        &mut self,
        frame: &Frame,
        fingerprint: Option<Fingerprint>,
    ) -> Result<ObjectKey, WriterError> {
        let entry_len = encoded_len(frame) as u64;
        self.check_capacity(entry_len)?;

        let date = self.clock.now().date_naive();
        let mut open = match self.current.take() {
            Some(open) if open.key.date == date && !self.exceeds_cap(&open, entry_len) => open,
            // Nothing written yet, so it moves to the new day without a seal
            Some(open) if open.entries == 0 => {
                debug!(room = %self.room, object = %open.key, "Dropping empty object");
                OpenObject::new(self.next_key(date).await?)
            }
            Some(open) => {
                debug!(
                    room = %self.room,
                    object = %open.key,
                    entries = open.entries,
                    "Rotating object"
                );
                self.queue_seal(open);
                OpenObject::new(self.next_key(date).await?)
            }
            None => OpenObject::new(self.next_key(date).await?),
        };

        encode_entry(frame, &mut self.buffer);
        self.pending.extend(fingerprint);
        open.bytes += entry_len;
        open.entries += 1;
        let key = open.key.clone();
        self.current = Some(open);

        if self.buffer.len() >= self.config.flush_bytes {
            self.flush();
        }
        Ok(key)
    }

    fn exceeds_cap(&self, open: &OpenObject, entry_len: u64) -> bool {
        open.bytes > 0 && open.bytes + entry_len > self.config.max_object_bytes
    }

    /// Pick the next free sequence for `date`, after anything already stored.
    async fn next_key(&mut self, date: NaiveDate) -> Result<ObjectKey, WriterError> {
        let store = &self.store;
        let room = &self.room;
        let existing = retry_with_backoff(&self.config.retry, "blob list", move || {
            store.list(room, date)
        })
        .await
        .map_err(|(e, attempts)| {
            self.state.fail(WriterError::Fatal {
                key: ObjectKey::day_prefix(&self.room, date),
                attempts,
                reason: e.to_string(),
            })
        })?;

        let mut sequence = existing
            .iter()
            .map(|k| k.sequence.saturating_add(1))
            .max()
            .unwrap_or(0);
        if let Some(last) = self.last_key.as_ref().filter(|k| k.date == date) {
            sequence = sequence.max(last.sequence.saturating_add(1));
        }

        let key = ObjectKey::new(self.room.clone(), date, sequence);
        debug!(room = %self.room, object = %key, "Opened object");
        self.last_key = Some(key.clone());
        Ok(key)
    }

    fn submit(&mut self, key: ObjectKey, seal: Option<u32>) {
        let data = self.buffer.split().freeze();
        let len = data.len() as u64;
        self.state.in_flight.fetch_add(len, Ordering::AcqRel);
        self.last_flush = Instant::now();

        let job = self.submitted;
        self.submitted += 1;
        if !self.pending.is_empty() {
            let fingerprints = std::mem::take(&mut self.pending);
            self.unconfirmed.push_back((job, fingerprints));
        }
        self.forget_confirmed();

        if self.jobs.send(FlushJob { key, data, seal }).is_err() {
            self.state.in_flight.fetch_sub(len, Ordering::AcqRel);
            self.state.fail(WriterError::Fatal {
                key: self.room.to_string(),
                attempts: 0,
                reason: "flusher stopped".into(),
            });
        }
    }

    fn queue_seal(&mut self, open: OpenObject) {
        self.submit(open.key, Some(open.entries));
    }

    fn forget_confirmed(&mut self) {
        let completed = self.state.completed.load(Ordering::Acquire);
        while self
            .unconfirmed
            .front()
            .is_some_and(|(job, _)| *job < completed)
        {
            self.unconfirmed.pop_front();
        }
    }

    /// Hand buffered bytes to the flusher without sealing.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Some(key) = self.current.as_ref().map(|o| o.key.clone()) {
            self.submit(key, None);
        }
    }

    /// Time-based flush; call periodically.
    pub fn tick(&mut self) {
        self.forget_confirmed();
        if !self.buffer.is_empty() && self.last_flush.elapsed() >= self.config.flush_interval {
            self.flush();
        }
    }

    /// Seal the open object and wait for every queued write, bounded by the
    /// drain timeout.
    pub async fn finish(mut self) -> DrainReport {
        if let Some(open) = self.current.take() {
            self.queue_seal(open);
        }

        let StorageWriter {
            room,
            config,
            state,
            jobs,
            flusher,
            pending,
            unconfirmed,
            ..
        } = self;
        drop(jobs);

        let abort = flusher.abort_handle();
        let error = match tokio::time::timeout(config.drain_timeout, flusher).await {
            Ok(Ok(())) => state.failure.get().cloned(),
            Ok(Err(e)) => Some(state.fail(WriterError::Fatal {
                key: room.to_string(),
                attempts: 0,
                reason: format!("flusher task failed: {}", e),
            })),
            Err(_) => {
                abort.abort();
                Some(state.fail(WriterError::DrainTimeout(config.drain_timeout)))
            }
        };

        let completed = state.completed.load(Ordering::Acquire);
        let unpersisted: Vec<Fingerprint> = unconfirmed
            .into_iter()
            .filter(|(job, _)| *job >= completed)
            .flat_map(|(_, fingerprints)| fingerprints)
            .chain(pending)
            .collect();

        let objects = state.sealed();
        info!(
            %room,
            objects = objects.len(),
            unpersisted = unpersisted.len(),
            failed = error.is_some(),
            "Writer drained"
        );
        DrainReport {
            objects,
            error,
            unpersisted,
        }
    }
}

async fn run_flusher(
    room: RoomId,
    store: Arc<dyn BlobStore>,
    state: Arc<FlushState>,
    retry: RetryPolicy,
    mut jobs: mpsc::UnboundedReceiver<FlushJob>,
) {
    while let Some(job) = jobs.recv().await {
        let len = job.data.len() as u64;

        // After a fatal failure remaining jobs are discarded
        if state.failure.get().is_none() {
            let store = &store;
            let key = &job.key;
            let data = job.data;
            let seal = job.seal;
            match retry_with_backoff(&retry, "blob append", move || {
                store.append(key, data.clone(), seal.is_some())
            })
            .await
            {
                Ok(size_bytes) => {
                    if let Some(frame_count) = seal {
                        debug!(%room, object = %key, size_bytes, frame_count, "Sealed object");
                        state
                            .sealed
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(SealedObject {
                                key: key.clone(),
                                size_bytes,
                                frame_count,
                            });
                    }
                    state.completed.fetch_add(1, Ordering::AcqRel);
                }
                Err((e, attempts)) => {
                    error!(%room, object = %key, attempts, error = %e, "Object write failed");
                    state.fail(WriterError::Fatal {
                        key: key.to_string(),
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }

        state.in_flight.fetch_sub(len, Ordering::AcqRel);
    }
}
