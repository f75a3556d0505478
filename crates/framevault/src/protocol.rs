//! Producer wire protocol
//!
//! Every message is a JSON object with a `type` discriminator:
//!
//! ```text
//! { "type": "Frame",   "timestamp": <int ms>, "data": <bytes>, "frame_type": "Video"|"Audio" }
//! { "type": "Control", "action": "StartRecording"|"StopRecording"|"PauseRecording"|"ResumeRecording" }
//! ```
//!
//! `data` is either a JSON array of byte values or a base64 string. Replies
//! from the gateway are [`ServerMessage`]s, also tagged by `type`.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, ProtocolError};
use crate::recording::{RecordingRecord, RecordingState};
use crate::{Frame, FrameKind};

/// Recording control actions a producer may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlAction {
    StartRecording,
    StopRecording,
    PauseRecording,
    ResumeRecording,
}

/// A structurally valid inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Frame(Frame),
    Control(ControlAction),
}

#[derive(Deserialize)]
struct WireFrame {
    timestamp: i64,
    data: WireData,
    frame_type: FrameKind,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireData {
    Raw(Vec<u8>),
    Base64(String),
}

#[derive(Deserialize)]
struct WireControl {
    action: ControlAction,
}

impl InboundMessage {
    /// Parse one producer message.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingType)?;

        match kind.as_str() {
            "Frame" => {
                let wire: WireFrame =
                    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
                        kind: "Frame",
                        reason: e.to_string(),
                    })?;
                let payload = match wire.data {
                    WireData::Raw(bytes) => Bytes::from(bytes),
                    WireData::Base64(text) => base64::engine::general_purpose::STANDARD
                        .decode(text.as_bytes())
                        .map(Bytes::from)
                        .map_err(|e| ProtocolError::Malformed {
                            kind: "Frame",
                            reason: format!("data is not valid base64: {}", e),
                        })?,
                };
                Ok(InboundMessage::Frame(Frame {
                    timestamp_ms: wire.timestamp,
                    kind: wire.frame_type,
                    payload,
                }))
            }
            "Control" => {
                let wire: WireControl =
                    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
                        kind: "Control",
                        reason: e.to_string(),
                    })?;
                Ok(InboundMessage::Control(wire.action))
            }
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

/// Messages sent back to the producer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Recording state after a transition
    State {
        state: RecordingState,
        session_id: Option<Uuid>,
    },
    /// A session was finalized
    Finalized { recording: RecordingRecord },
    /// Non-fatal error; the connection stays open
    Error { kind: ErrorKind, message: String },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frame_with_byte_array() {
        let raw = br#"{"type":"Frame","timestamp":1700,"data":[1,2,3],"frame_type":"Video"}"#;
        let msg = InboundMessage::parse(raw).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Frame(Frame::video(1700, Bytes::from_static(&[1, 2, 3])))
        );
    }

    #[test]
    fn parses_frame_with_base64_data() {
        let raw = br#"{"type":"Frame","timestamp":5,"data":"aGVsbG8=","frame_type":"Audio"}"#;
        match InboundMessage::parse(raw).unwrap() {
            InboundMessage::Frame(frame) => {
                assert_eq!(frame.kind, FrameKind::Audio);
                assert_eq!(frame.payload, Bytes::from_static(b"hello"));
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn parses_every_control_action() {
        for (name, action) in [
            ("StartRecording", ControlAction::StartRecording),
            ("StopRecording", ControlAction::StopRecording),
            ("PauseRecording", ControlAction::PauseRecording),
            ("ResumeRecording", ControlAction::ResumeRecording),
        ] {
            let raw = format!(r#"{{"type":"Control","action":"{}"}}"#, name);
            assert_eq!(
                InboundMessage::parse(raw.as_bytes()).unwrap(),
                InboundMessage::Control(action)
            );
        }
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let err = InboundMessage::parse(br#"{"type":"Telemetry"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("Telemetry".into()));
    }

    #[test]
    fn missing_type_is_protocol_error() {
        let err = InboundMessage::parse(br#"{"action":"StartRecording"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingType);
    }

    #[test]
    fn missing_frame_fields_are_malformed() {
        let err = InboundMessage::parse(br#"{"type":"Frame","timestamp":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { kind: "Frame", .. }));
    }

    #[test]
    fn unknown_action_is_malformed() {
        let err = InboundMessage::parse(br#"{"type":"Control","action":"Rewind"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { kind: "Control", .. }));
    }

    #[test]
    fn garbage_is_invalid_json() {
        let err = InboundMessage::parse(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn bad_base64_is_malformed() {
        let raw = br#"{"type":"Frame","timestamp":5,"data":"***","frame_type":"Audio"}"#;
        assert!(matches!(
            InboundMessage::parse(raw),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn server_error_message_shape() {
        let json = ServerMessage::error(ErrorKind::QuotaExceeded, "over budget")
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "Error");
        assert_eq!(value["kind"], "QuotaExceeded");
        assert_eq!(value["message"], "over budget");
    }
}
