//! Event types published to the presentation layer.

use serde::{Deserialize, Serialize};

/// Emitted whenever the live session changes state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub state: SessionState,
    /// Human-readable detail: the error message in `error`, the close reason
    /// in `closed`.
    pub detail: Option<String>,
    /// Session generation this state belongs to.
    pub generation: u64,
}

impl Default for SessionStatusEvent {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            detail: None,
            generation: 0,
        }
    }
}

/// Current state of the live voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session started yet.
    Idle,
    /// Devices acquired, waiting for the remote session to open.
    Connecting,
    /// Open; microphone streaming, nothing playing.
    Listening,
    /// Open; spoken reply audible or queued.
    Speaking,
    /// Failed. Stays here until retried.
    Error,
    /// Ended by the user or by the remote side.
    Closed,
}

impl SessionState {
    /// Whether the remote session is open in this state.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Speaking)
    }

    /// Whether `retry` is meaningful from this state.
    pub fn can_retry(self) -> bool {
        matches!(self, SessionState::Error | SessionState::Closed)
    }
}
