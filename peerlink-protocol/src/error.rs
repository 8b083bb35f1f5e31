//! Error handling for the peerlink protocol
//!
//! Every fallible operation returns [`Result`], an alias over [`ProtocolError`].
//! Errors from underlying libraries convert automatically through `thiserror`.
//!
//! ## Error Scoping
//!
//! Failures are scoped to the session or pairing attempt that produced them:
//!
//! - A discovery transport failure never fails an authentication in flight
//!   on another device.
//! - Service death is the only condition that cascades to every session.
//! - [`ProtocolError::StaleCallback`] marks a result that arrived after its
//!   owning session was torn down. It is dropped, never surfaced to the user.
//!
//! ## Error Matching
//!
//! ```rust
//! use peerlink_protocol::ProtocolError;
//!
//! fn describe(error: &ProtocolError) -> &'static str {
//!     match error {
//!         ProtocolError::AlreadyPairing(_) => "a pairing is already running",
//!         ProtocolError::AuthTimeout(_) => "the peer did not answer in time",
//!         ProtocolError::AuthRejected(_) => "pairing was declined",
//!         _ => "other failure",
//!     }
//! }
//!
//! let error = ProtocolError::AlreadyPairing("AA:BB:CC".to_string());
//! assert_eq!(describe(&error), "a pairing is already running");
//! ```

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during discovery, pairing and connection handling
///
/// # Examples
///
/// ```rust
/// use peerlink_protocol::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("device-123".to_string());
/// assert_eq!(error.to_string(), "Device not found: device-123");
///
/// let error = ProtocolError::InvalidConfig("medium 9 out of range".to_string());
/// assert_eq!(error.to_string(), "Invalid discovery configuration: medium 9 out of range");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (registry persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed discovery parameters
    ///
    /// Raised when mode, medium, frequency, capability or subscribe id fall
    /// outside their supported ranges, or when a subscribe id is already active.
    #[error("Invalid discovery configuration: {0}")]
    InvalidConfig(String),

    /// Invalid argument (empty package name, non-digit PIN input, ...)
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A pairing attempt is already running against this device
    #[error("Already pairing with device {0}")]
    AlreadyPairing(String),

    /// The authentication countdown expired without resolution
    #[error("Authentication timed out: {0}")]
    AuthTimeout(String),

    /// The user or the peer declined the authentication
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// The native service reported a failure
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A result arrived for a session that no longer exists
    #[error("Stale callback discarded: {0}")]
    StaleCallback(String),

    /// Device not found in registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device manager was released or its service died
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ProtocolError {
    /// Check if this error is recoverable (a fresh, user-initiated attempt may succeed)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peerlink_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::AuthTimeout("no answer".to_string()).is_recoverable());
    /// assert!(!ProtocolError::InvalidConfig("bad mode".to_string()).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthTimeout(_)
                | ProtocolError::TransportFailure(_)
                | ProtocolError::AlreadyPairing(_)
                | ProtocolError::Io(_)
        )
    }

    /// Check if this error requires user action
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthRejected(_)
                | ProtocolError::InvalidConfig(_)
                | ProtocolError::InvalidValue(_)
                | ProtocolError::ServiceUnavailable(_)
        )
    }

    /// Check if this error should be dropped silently
    pub fn is_stale(&self) -> bool {
        matches!(self, ProtocolError::StaleCallback(_))
    }

    /// Get a user-friendly error message suitable for display in UI
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peerlink_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::AuthTimeout("pin entry".to_string());
    /// assert_eq!(
    ///     error.user_message(),
    ///     "Pairing timed out (pin entry). Start pairing again."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::InvalidConfig(msg) => {
                format!("Discovery settings are invalid: {}.", msg)
            }
            ProtocolError::InvalidValue(msg) => format!("Invalid input: {}.", msg),
            ProtocolError::AlreadyPairing(id) => {
                format!("Pairing with '{}' is already in progress.", id)
            }
            ProtocolError::AuthTimeout(msg) => {
                format!("Pairing timed out ({}). Start pairing again.", msg)
            }
            ProtocolError::AuthRejected(msg) => format!("Pairing was declined: {}.", msg),
            ProtocolError::TransportFailure(msg) => {
                format!("Device service error: {}. Try again.", msg)
            }
            ProtocolError::StaleCallback(msg) => format!("Ignored late result: {}.", msg),
            ProtocolError::DeviceNotFound(id) => {
                format!("Device '{}' not found. Run discovery first.", id)
            }
            ProtocolError::ServiceUnavailable(msg) => {
                format!("Device service unavailable: {}. Recreate the device manager.", msg)
            }
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::AlreadyPairing("AA:BB:CC".to_string());
        assert_eq!(error.to_string(), "Already pairing with device AA:BB:CC");

        let error = ProtocolError::AuthRejected("user cancelled".to_string());
        assert_eq!(error.to_string(), "Authentication rejected: user cancelled");

        let error = ProtocolError::StaleCallback("verify result".to_string());
        assert_eq!(error.to_string(), "Stale callback discarded: verify result");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "registry missing");
        let protocol_error: ProtocolError = io_error.into();

        assert!(matches!(protocol_error, ProtocolError::Io(_)));
        assert!(protocol_error.to_string().contains("registry missing"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>(r#"{"broken"#).unwrap_err();
        let protocol_error: ProtocolError = json_error.into();
        assert!(matches!(protocol_error, ProtocolError::Json(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(ProtocolError::StaleCallback("x".into()).is_stale());
        assert!(!ProtocolError::AuthTimeout("x".into()).is_stale());
        assert!(ProtocolError::AuthRejected("x".into()).requires_user_action());
        assert!(ProtocolError::TransportFailure("x".into()).is_recoverable());
    }
}
