//! Device Pairing
//!
//! This module implements the PIN based authentication handshake between an
//! initiating and a joining device.
//!
//! ## Pairing Protocol
//!
//! 1. **Request**: The initiator calls `authenticate_device` and enters `Requesting`
//! 2. **Parameters**: Both sides poll `get_authentication_param` for their half of the round
//! 3. **Display**: The main side (direction 1) shows the PIN
//! 4. **Entry**: The joining side (direction 0) types the PIN, or approves the
//!    request when it carries an icon or a transfer authorization
//! 5. **Verification**: Six typed digits trigger exactly one `verify_auth_info`
//! 6. **Completion**: Both sides reach `Authenticated` and the peer becomes trusted
//!
//! Cancelling or letting the 30 second countdown expire reports a
//! [`UserOperation`] to the service before local state is torn down.
//!
//! ## Usage
//!
//! ```no_run
//! use peerlink_protocol::pairing::PinProgress;
//! use peerlink_protocol::DeviceManager;
//!
//! async fn type_pin(manager: &DeviceManager, device_id: &str, pin: &str) {
//!     for digit in pin.chars() {
//!         if let Ok(PinProgress::Complete(_)) = manager.enter_pin_digit(device_id, digit).await {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod context;
pub mod events;
pub mod machine;
pub mod params;
pub mod poller;
pub mod state;

// Re-export main types
pub use context::{AuthContext, PendingVerify, PinBuffer, PinProgress};
pub use events::AuthEvent;
pub use machine::{AuthStateMachine, AUTH_TIMEOUT};
pub use params::{
    AuthDirection, AuthExtraInfo, AuthFlow, AuthOutcome, AuthParam, AuthRequest, PinCode,
    PinToken, UserOperation, VerifyAuthInfo, VerifyOutcome, AUTH_TYPE_PIN, PIN_LENGTH,
};
pub use poller::{AuthParamPoller, PollerHandle, DEFAULT_POLL_INTERVAL};
pub use state::{AuthRole, AuthState};
