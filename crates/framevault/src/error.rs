//! Error taxonomy for the ingestion pipeline
//!
//! Only [`WriterError::Fatal`] and [`WriterError::DrainTimeout`] end a
//! recording session. Every other error is reported to the producer and the
//! connection stays open.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::recording::{ControlInput, RecordingState};

/// Malformed producer message. The message is dropped, the connection continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("message has no \"type\" field")]
    MissingType,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// Duplicate cache failure. The dedup engine fails open on any of these.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("duplicate cache unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate cache did not answer within {0:?}")]
    Timeout(Duration),
    #[error("duplicate cache circuit open")]
    CircuitOpen,
}

/// Blob store failure for a single call.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object {0} is sealed")]
    Sealed(String),
    #[error("object {0} not found")]
    NotFound(String),
    #[error("blob store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob store error: {0}")]
    Backend(String),
}

/// Storage writer failure.
#[derive(Debug, Clone, Error)]
pub enum WriterError {
    #[error("write buffer full ({buffered} of {capacity} bytes in use)")]
    Backpressure { buffered: u64, capacity: u64 },
    #[error("write to {key} failed after {attempts} attempts: {reason}")]
    Fatal {
        key: String,
        attempts: u32,
        reason: String,
    },
    #[error("drain did not complete within {0:?}")]
    DrainTimeout(Duration),
}

impl WriterError {
    /// Whether this error ends the recording session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WriterError::Backpressure { .. })
    }
}

/// Control message issued from a state that does not permit it.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{input:?} is not allowed while {state:?}")]
pub struct InvalidTransition {
    pub state: RecordingState,
    pub input: ControlInput,
}

/// Connection-level refusal from the session gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("room {0} does not exist")]
    UnknownRoom(String),
    #[error("room {0} already has an active producer")]
    RoomBusy(String),
    #[error("room directory error: {0}")]
    Directory(String),
}

/// Why a frame was not admitted.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// No session is recording
    #[error("not recording (state {state:?})")]
    NotRecording { state: RecordingState },
    /// Session is paused
    #[error("recording is paused")]
    Paused,
    /// Account budget exhausted
    #[error("quota exceeded: {used} + {requested} bytes over limit {limit}")]
    QuotaExceeded { limit: u64, used: u64, requested: u64 },
    /// Account unknown or ledger unreachable
    #[error("quota ledger unavailable")]
    QuotaUnavailable,
    /// Writer buffer is full
    #[error("write buffer full ({buffered} of {capacity} bytes)")]
    Backpressure { buffered: u64, capacity: u64 },
    /// Storage failed while appending; the session has failed
    #[error("storage failure")]
    StorageFailed,
}

/// Stable error kinds reported to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ProtocolError,
    InvalidTransition,
    QuotaExceeded,
    NotRecording,
    Backpressure,
    StorageWriteFailure,
}

impl From<&Rejection> for ErrorKind {
    fn from(rejection: &Rejection) -> Self {
        match rejection {
            Rejection::NotRecording { .. } | Rejection::Paused => ErrorKind::NotRecording,
            Rejection::QuotaExceeded { .. } | Rejection::QuotaUnavailable => {
                ErrorKind::QuotaExceeded
            }
            Rejection::Backpressure { .. } => ErrorKind::Backpressure,
            Rejection::StorageFailed => ErrorKind::StorageWriteFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backpressure_is_non_fatal() {
        let backpressure = WriterError::Backpressure {
            buffered: 10,
            capacity: 10,
        };
        assert!(!backpressure.is_fatal());
        assert!(WriterError::DrainTimeout(Duration::from_secs(1)).is_fatal());
        assert!(WriterError::Fatal {
            key: "r/2024-01-01/0.raw".into(),
            attempts: 3,
            reason: "boom".into(),
        }
        .is_fatal());
    }

    #[test]
    fn rejection_maps_to_error_kind() {
        assert_eq!(ErrorKind::from(&Rejection::Paused), ErrorKind::NotRecording);
        assert_eq!(
            ErrorKind::from(&Rejection::QuotaExceeded {
                limit: 1,
                used: 1,
                requested: 1
            }),
            ErrorKind::QuotaExceeded
        );
    }

    #[test]
    fn rejection_serializes_with_reason_tag() {
        let json = serde_json::to_value(Rejection::Paused).unwrap();
        assert_eq!(json["reason"], "paused");
    }

    #[test]
    fn rejection_messages() {
        assert_eq!(
            Rejection::NotRecording {
                state: RecordingState::Idle
            }
            .to_string(),
            "not recording (state Idle)"
        );
        assert_eq!(
            Rejection::QuotaExceeded {
                limit: 10,
                used: 8,
                requested: 3
            }
            .to_string(),
            "quota exceeded: 8 + 3 bytes over limit 10"
        );
        assert_eq!(
            Rejection::Backpressure {
                buffered: 23,
                capacity: 30
            }
            .to_string(),
            "write buffer full (23 of 30 bytes)"
        );
    }
}
