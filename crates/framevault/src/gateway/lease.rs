//! Exclusive per-room producer leases
//!
//! A room can be leased by one connection at a time. Each grant carries a
//! generation so a release from a stale holder never frees a newer lease.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::room::RoomId;

#[derive(Default)]
struct LeaseTable {
    held: Mutex<HashMap<RoomId, u64>>,
    /// Monotonically increasing generation counter
    generation: AtomicU64,
}

impl LeaseTable {
    fn release(&self, room: &RoomId, generation: u64) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        match held.get(room) {
            Some(&current) if current == generation => {
                held.remove(room);
                info!(%room, generation, "Room lease released");
            }
            Some(&current) => {
                debug!(
                    %room,
                    registered_generation = current,
                    stale_generation = generation,
                    "Skipping release: generation mismatch"
                );
            }
            None => {}
        }
    }
}

/// Lease registry shared by every connection.
#[derive(Clone, Default)]
pub struct RoomLeases {
    table: Arc<LeaseTable>,
}

impl RoomLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `room`, or `None` if another connection holds it.
    pub fn acquire(&self, room: &RoomId) -> Option<RoomLease> {
        let mut held = self.table.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.contains_key(room) {
            return None;
        }
        let generation = self.table.generation.fetch_add(1, Ordering::Relaxed);
        held.insert(room.clone(), generation);
        info!(%room, generation, "Room lease acquired");

        Some(RoomLease {
            room: room.clone(),
            generation,
            table: Arc::clone(&self.table),
        })
    }

    pub fn is_held(&self, room: &RoomId) -> bool {
        self.table
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(room)
    }

    /// Number of rooms currently leased
    pub fn active(&self) -> usize {
        self.table
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// A granted lease. Released on drop.
pub struct RoomLease {
    room: RoomId,
    generation: u64,
    table: Arc<LeaseTable>,
}

impl RoomLease {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        self.table.release(&self.room, self.generation);
    }
}

impl std::fmt::Debug for RoomLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomLease")
            .field("room", &self.room)
            .field("generation", &self.generation)
            .finish()
    }
}
