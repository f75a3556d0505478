//! Framevault - room-scoped frame ingestion
//!
//! Producers stream timestamped video/audio frames into a room over a
//! persistent connection. Each frame passes the account quota, is checked
//! for duplicates, and lands in day-sliced, size-capped storage objects
//! keyed `{room}/{yyyy-mm-dd}/{sequence}.raw`, while a per-room state
//! machine tracks the recording lifecycle.
//!
//! - **Core types**: [`Frame`], [`protocol`] messages, [`error`] taxonomy
//! - **Collaborators**: [`RoomDirectory`](room::RoomDirectory),
//!   [`QuotaLedger`](quota::QuotaLedger), [`BlobStore`](storage::BlobStore),
//!   [`DuplicateCache`](dedup::DuplicateCache), [`MetricsSink`](events::MetricsSink)
//! - **Pipeline**: [`gateway::SessionGateway`] wiring quota, dedup,
//!   recording and storage
//! - **`web`**: axum HTTP + WebSocket surface

mod frame;

pub mod clock;
pub mod dedup;
pub mod error;
pub mod events;
pub mod gateway;
pub mod protocol;
pub mod quota;
pub mod recording;
pub mod room;
pub mod storage;

#[cfg(feature = "web")]
pub mod web;

pub use frame::{Frame, FrameKind};
pub use gateway::{Collaborators, GatewayConfig, GatewayStats, RoomSession, SessionGateway};
pub use room::{AccountId, Room, RoomConfig, RoomId};
