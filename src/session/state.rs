//! Session lifecycle states.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Recording -> Processing -> Connected ...
//!        ^                                                                 |
//!        +------------------ Error <-- (any fatal failure) ----------------+
//! ```
//!
//! Explicit close and channel close go straight to `Disconnected` from any state.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No channel, no devices
    Disconnected,
    /// Channel opening, render path running and pre-rolling
    Connecting,
    /// Ready; inbound audio plays
    Connected,
    /// Microphone captured and streamed
    Recording,
    /// Waiting for the service to answer the last utterance
    Processing,
    /// A fatal failure is being torn down
    Error,
}

impl SessionState {
    /// Convert state to string for API responses and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Recording => "recording",
            SessionState::Processing => "processing",
            SessionState::Error => "error",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Disconnected) | (_, Error) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Recording) => true,
            (Recording, Processing) => true,
            (Processing, Connected) => true,
            _ => false,
        }
    }

    /// States in which an interrupt makes sense.
    pub fn accepts_barge_in(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Recording | SessionState::Processing
        )
    }

    /// States in which inbound service audio is played.
    pub fn accepts_inbound_audio(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Connected
                | SessionState::Recording
                | SessionState::Processing
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use SessionState::*;
        let path = [Disconnected, Connecting, Connected, Recording, Processing, Connected];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        use SessionState::*;
        assert!(!Processing.can_transition_to(Recording));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Recording));
        assert!(!Recording.can_transition_to(Connected));
    }

    #[test]
    fn test_close_and_error_reachable_from_anywhere() {
        use SessionState::*;
        for state in [Disconnected, Connecting, Connected, Recording, Processing, Error] {
            assert!(state.can_transition_to(Disconnected));
            assert!(state.can_transition_to(Error));
        }
    }

    #[test]
    fn test_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionState::Processing).unwrap(),
            r#""processing""#
        );
        assert!(!SessionState::Connecting.accepts_barge_in());
        assert!(SessionState::Connecting.accepts_inbound_audio());
    }
}
