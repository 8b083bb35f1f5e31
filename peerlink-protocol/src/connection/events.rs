//! Connection Events
//!
//! Events emitted by the connection manager for device connectivity changes.

/// Connection event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection has been established to a device
    Connected {
        /// Device ID
        device_id: String,
    },

    /// A connection to a device has been lost
    Disconnected {
        /// Device ID
        device_id: String,
        /// Reason for disconnection (if known)
        reason: Option<String>,
    },

    /// Device metadata was refreshed by a state change
    Refreshed {
        /// Device ID
        device_id: String,
    },
}

impl ConnectionEvent {
    /// Get the device ID the event refers to
    pub fn device_id(&self) -> &str {
        match self {
            ConnectionEvent::Connected { device_id }
            | ConnectionEvent::Disconnected { device_id, .. }
            | ConnectionEvent::Refreshed { device_id } => device_id,
        }
    }
}
