//! Authentication states and roles

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one pairing attempt
///
/// ```text
/// Idle -> Requesting -> PinDisplay ---------------------> Authenticated
///                    \-> PinEntry ----> Confirming ----/
///                    \-> Authorizing -> Confirming ---/
///
/// any pending state -> Cancelled | TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// No pairing attempt for the device
    Idle,
    /// Initiator asked the service to authenticate the peer
    Requesting,
    /// This side shows the PIN and waits for the peer to type it
    PinDisplay,
    /// This side collects the PIN one digit at a time
    PinEntry,
    /// This side approves or rejects without a PIN
    Authorizing,
    /// Waiting for the service to confirm the PIN or approval
    Confirming,
    /// Pairing completed
    Authenticated,
    /// Cancelled by the user or rejected by the peer
    Cancelled,
    /// Countdown expired
    TimedOut,
}

impl AuthState {
    /// States in which a pairing attempt is in flight
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            AuthState::Requesting
                | AuthState::PinDisplay
                | AuthState::PinEntry
                | AuthState::Authorizing
                | AuthState::Confirming
        )
    }

    /// States that end a pairing attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthState::Authenticated | AuthState::Cancelled | AuthState::TimedOut
        )
    }

    /// States guarded by the countdown timer
    pub fn has_countdown(&self) -> bool {
        matches!(
            self,
            AuthState::PinDisplay | AuthState::PinEntry | AuthState::Authorizing
        )
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::Idle => "idle",
            AuthState::Requesting => "requesting",
            AuthState::PinDisplay => "pin display",
            AuthState::PinEntry => "pin entry",
            AuthState::Authorizing => "authorizing",
            AuthState::Confirming => "confirming",
            AuthState::Authenticated => "authenticated",
            AuthState::Cancelled => "cancelled",
            AuthState::TimedOut => "timed out",
        };
        f.write_str(name)
    }
}

/// Which side of the handshake this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRole {
    /// Called `authenticate_device`
    Initiator,
    /// Answered an incoming authentication request
    Joiner,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classes() {
        assert!(!AuthState::Idle.is_pending());
        assert!(AuthState::Requesting.is_pending());
        assert!(AuthState::Confirming.is_pending());
        assert!(AuthState::TimedOut.is_terminal());
        assert!(!AuthState::Confirming.is_terminal());

        assert!(AuthState::PinEntry.has_countdown());
        assert!(!AuthState::Requesting.has_countdown());
        assert!(!AuthState::Confirming.has_countdown());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(AuthState::PinDisplay.to_string(), "pin display");
        assert_eq!(AuthState::TimedOut.to_string(), "timed out");
    }
}
