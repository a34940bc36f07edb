//! Pure state machine for the recording session lifecycle.
//!
//! `(State, Event) -> (NewState, Vec<SideEffect>)`. The recorder applies the
//! side effects; this module never performs I/O. Invalid transitions return the
//! current state with no effects.

use serde::{Deserialize, Serialize};

use super::frame::Timestamp;

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Operator or automation called `stop`
    Requested,
    /// Elapsed time reached `max_recording_duration`
    MaxDurationReached,
    /// The persistence sink kept failing
    PersistenceFailure,
}

/// Coarse status, as exposed to observers
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    #[default]
    Idle,
    Recording,
    Stopping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordingState {
    Idle,
    Recording {
        session_id: String,
        started_at: Timestamp,
    },
    Stopping {
        session_id: String,
        started_at: Timestamp,
        reason: StopReason,
    },
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

impl RecordingState {
    pub fn status(&self) -> RecordingStatus {
        match self {
            RecordingState::Idle => RecordingStatus::Idle,
            RecordingState::Recording { .. } => RecordingStatus::Recording,
            RecordingState::Stopping { .. } => RecordingStatus::Stopping,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, RecordingState::Recording { .. })
    }

    /// Check if a new session may be started
    pub fn can_start_recording(&self) -> bool {
        matches!(self, RecordingState::Idle)
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            RecordingState::Idle => None,
            RecordingState::Recording { session_id, .. }
            | RecordingState::Stopping { session_id, .. } => Some(session_id),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// A session was built and is ready to accept frames
    SessionOpened {
        session_id: String,
        started_at: Timestamp,
    },
    StopRequested {
        reason: StopReason,
    },
    /// The writer drained (or the drain timed out) and the session was torn down
    DrainCompleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Stop accepting frames and ask the writer to flush
    SignalStop { reason: StopReason },
    /// Raise `RecordingStateChanged`
    EmitStateChange {
        is_recording: bool,
        reason: Option<StopReason>,
    },
}

pub fn transition(
    state: RecordingState,
    event: RecordingEvent,
) -> (RecordingState, Vec<SideEffect>) {
    match (&state, event) {
        (
            RecordingState::Idle,
            RecordingEvent::SessionOpened {
                session_id,
                started_at,
            },
        ) => (
            RecordingState::Recording {
                session_id,
                started_at,
            },
            vec![SideEffect::EmitStateChange {
                is_recording: true,
                reason: None,
            }],
        ),

        (
            RecordingState::Recording {
                session_id,
                started_at,
            },
            RecordingEvent::StopRequested { reason },
        ) => (
            RecordingState::Stopping {
                session_id: session_id.clone(),
                started_at: *started_at,
                reason,
            },
            vec![SideEffect::SignalStop { reason }],
        ),

        (RecordingState::Stopping { reason, .. }, RecordingEvent::DrainCompleted) => {
            let reason = *reason;
            (
                RecordingState::Idle,
                vec![SideEffect::EmitStateChange {
                    is_recording: false,
                    reason: Some(reason),
                }],
            )
        }

        _ => (state, vec![]),
    }
}
