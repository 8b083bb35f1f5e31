//! Pairing Event System
//!
//! This module defines the prompts and state changes the state machine emits
//! for the UI layer while a pairing attempt runs.

use super::params::{AuthFlow, PinCode};
use super::state::AuthState;

/// Events emitted by the authentication state machine
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// Show this PIN and wait for the peer to type it
    ShowPin {
        /// ID of the peer device
        device_id: String,
        /// PIN to display, when the service provided one
        pin: Option<PinCode>,
    },

    /// Ask the user to type the PIN shown on the peer
    RequestPin {
        /// ID of the peer device
        device_id: String,
        /// Name of the peer device
        device_name: String,
    },

    /// Ask the user to approve or reject the peer's request
    RequestApproval {
        /// ID of the peer device
        device_id: String,
        /// Name of the peer device
        device_name: String,
        /// Approval flow (icon confirmation or transfer authorization)
        flow: AuthFlow,
        /// Requesting application, if named
        app_name: Option<String>,
        /// Application icon for icon confirmation
        app_icon: Option<Vec<u8>>,
    },

    /// Pairing state changed
    StateChanged {
        /// ID of the peer device
        device_id: String,
        /// New state
        state: AuthState,
    },

    /// The countdown expired
    TimedOut {
        /// ID of the peer device
        device_id: String,
    },

    /// The attempt ended with an error
    Failed {
        /// ID of the peer device
        device_id: String,
        /// Error message
        reason: String,
    },
}

impl AuthEvent {
    /// Check if this event asks the user for input
    pub fn is_prompt(&self) -> bool {
        matches!(
            self,
            AuthEvent::ShowPin { .. } | AuthEvent::RequestPin { .. } | AuthEvent::RequestApproval { .. }
        )
    }

    /// The state carried by a state change event
    pub fn state(&self) -> Option<AuthState> {
        match self {
            AuthEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// Get the peer device ID
    pub fn device_id(&self) -> &str {
        match self {
            AuthEvent::ShowPin { device_id, .. }
            | AuthEvent::RequestPin { device_id, .. }
            | AuthEvent::RequestApproval { device_id, .. }
            | AuthEvent::StateChanged { device_id, .. }
            | AuthEvent::TimedOut { device_id }
            | AuthEvent::Failed { device_id, .. } => device_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_checking() {
        let prompt = AuthEvent::RequestPin {
            device_id: "AA:BB:CC".to_string(),
            device_name: "Printer-42".to_string(),
        };
        assert!(prompt.is_prompt());
        assert_eq!(prompt.state(), None);

        let changed = AuthEvent::StateChanged {
            device_id: "AA:BB:CC".to_string(),
            state: AuthState::PinEntry,
        };
        assert!(!changed.is_prompt());
        assert_eq!(changed.state(), Some(AuthState::PinEntry));
    }

    #[test]
    fn test_device_id_extraction() {
        let event = AuthEvent::TimedOut {
            device_id: "device_123".to_string(),
        };
        assert_eq!(event.device_id(), "device_123");
    }
}
