//! Recording lifecycle
//!
//! ```text
//!           Start              Pause
//!   Idle ─────────▶ Recording ◀──────▶ Paused
//!                     │   Resume         │
//!                Stop │                  │ Stop
//!                     ▼                  ▼
//!                  Stopped ◀─────────────┘
//!
//!   Recording | Paused ── WriteFailure ──▶ Failed
//! ```
//!
//! [`transition`] is pure: it validates an input against the current state
//! and returns the next state plus the side effect the owner must perform.
//! The room session owns the state and applies the effect.

mod ledger;
mod session;

pub use ledger::{RecordingLedger, RoomAnalytics};
pub use session::{ObjectSummary, RecordingRecord, RecordingSession, RecordingStatus};

use serde::{Deserialize, Serialize};

use crate::error::InvalidTransition;
use crate::protocol::ControlAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Stopped,
    Failed,
}

impl RecordingState {
    /// A session exists and has not been finalized.
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordingState::Stopped | RecordingState::Failed)
    }
}

/// Inputs to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlInput {
    Start,
    Pause,
    Resume,
    Stop,
    /// Connection closed; acts as Stop for an active session
    Disconnect,
    /// Storage writer gave up on a write
    WriteFailure,
}

impl From<ControlAction> for ControlInput {
    fn from(action: ControlAction) -> Self {
        match action {
            ControlAction::StartRecording => ControlInput::Start,
            ControlAction::StopRecording => ControlInput::Stop,
            ControlAction::PauseRecording => ControlInput::Pause,
            ControlAction::ResumeRecording => ControlInput::Resume,
        }
    }
}

/// Side effect the owner performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Create a session and open its writer
    BeginSession,
    /// Flush buffered frames; the session stays open
    FlushWriter,
    /// Drain the writer and finalize the session with this status
    Finalize(RecordingStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RecordingState,
    pub to: RecordingState,
    pub effect: Effect,
}

impl Transition {
    fn to(from: RecordingState, to: RecordingState, effect: Effect) -> Self {
        Self { from, to, effect }
    }

    fn stay(state: RecordingState) -> Self {
        Self::to(state, state, Effect::None)
    }
}

/// Validate `input` against `state`.
///
/// Invalid control inputs leave the state unchanged; the caller reports the
/// error and carries on. Start is accepted after a terminal state so a room
/// can record again without reconnecting.
pub fn transition(
    state: RecordingState,
    input: ControlInput,
) -> Result<Transition, InvalidTransition> {
    use ControlInput as I;
    use RecordingState as S;

    let next = match (state, input) {
        (S::Idle | S::Stopped | S::Failed, I::Start) => {
            Transition::to(state, S::Recording, Effect::BeginSession)
        }
        (S::Recording, I::Pause) => Transition::to(state, S::Paused, Effect::FlushWriter),
        (S::Paused, I::Resume) => Transition::to(state, S::Recording, Effect::None),
        (S::Recording | S::Paused, I::Stop | I::Disconnect) => Transition::to(
            state,
            S::Stopped,
            Effect::Finalize(RecordingStatus::Stopped),
        ),
        (S::Recording | S::Paused, I::WriteFailure) => Transition::to(
            state,
            S::Failed,
            Effect::Finalize(RecordingStatus::Failed),
        ),
        // Nothing to finalize
        (S::Idle | S::Stopped | S::Failed, I::Disconnect) => Transition::stay(state),
        (S::Idle | S::Stopped, I::WriteFailure) => Transition::to(state, S::Failed, Effect::None),
        (S::Failed, I::WriteFailure) => Transition::stay(state),
        _ => return Err(InvalidTransition { state, input }),
    };
    Ok(next)
}
