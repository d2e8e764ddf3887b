//! Pure streaming lifecycle state machine
//!
//! ```text
//! Idle --Start--> Running --Finish--> Completed
//!                    |
//!                    +--Abort-----> Failed
//!                    +--Cancel----> Cancelled
//! ```
//!
//! Terminal states accept no further events. `Cancel` is also accepted from
//! `Idle`, for a run cancelled before its first chunk.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one streaming run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Running => "running",
            StreamState::Completed => "completed",
            StreamState::Failed => "failed",
            StreamState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Events that drive [`StreamState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Start,
    /// The chunker is exhausted
    Finish,
    /// Error tolerance exceeded or a fatal error
    Abort,
    Cancel,
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error type for state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Invalid transition from {from} with {event}")]
    InvalidTransition { from: StreamState, event: StreamEvent },
}

/// Apply an event to the current state
pub fn apply_transition(state: StreamState, event: StreamEvent) -> Result<StreamState, StateError> {
    match (state, event) {
        (StreamState::Idle, StreamEvent::Start) => Ok(StreamState::Running),
        (StreamState::Idle, StreamEvent::Cancel) => Ok(StreamState::Cancelled),
        (StreamState::Running, StreamEvent::Finish) => Ok(StreamState::Completed),
        (StreamState::Running, StreamEvent::Abort) => Ok(StreamState::Failed),
        (StreamState::Running, StreamEvent::Cancel) => Ok(StreamState::Cancelled),
        (from, event) => Err(StateError::InvalidTransition { from, event }),
    }
}
