//! Connection Manager
//!
//! Tracks the logical connection to every authenticated device and reacts to
//! the device state changes reported by the service.

use super::events::ConnectionEvent;
use crate::{DeviceInfo, ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Device state change codes reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStateAction {
    /// Peer went away; tear down everything for it
    Offline = 0,
    Online = 1,
    Ready = 2,
    /// Peer metadata changed
    Changed = 3,
}

impl DeviceStateAction {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

impl TryFrom<i32> for DeviceStateAction {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(DeviceStateAction::Offline),
            1 => Ok(DeviceStateAction::Online),
            2 => Ok(DeviceStateAction::Ready),
            3 => Ok(DeviceStateAction::Changed),
            other => Err(ProtocolError::InvalidValue(format!(
                "device state action {} out of range",
                other
            ))),
        }
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Logical connection to one device
#[derive(Debug, Clone)]
pub struct Connection {
    pub device_id: String,
    pub status: ConnectionStatus,
    pub last_state_change_reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl Connection {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: ConnectionStatus::Connecting,
            last_state_change_reason: None,
            changed_at: Utc::now(),
        }
    }

    fn transition(&mut self, status: ConnectionStatus, reason: &str) {
        self.status = status;
        self.last_state_change_reason = Some(reason.to_string());
        self.changed_at = Utc::now();
    }
}

/// What the caller must do after a device state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeEffect {
    /// Cancel pairing timers for the device and return it to idle
    TearDown,
    /// The device is now connected
    Connected,
    /// Registry metadata should be refreshed
    Refresh,
    /// Nothing to do
    Ignored,
}

/// Connection manager for authenticated devices
pub struct ConnectionManager {
    /// Connections by device ID
    connections: HashMap<String, Connection>,

    /// Event channel sender
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a connection manager and the receiver for its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                connections: HashMap::new(),
                event_tx,
            },
            event_rx,
        )
    }

    /// Connect a device that just completed authentication
    pub fn establish(&mut self, device_id: &str) {
        let connection = self
            .connections
            .entry(device_id.to_string())
            .or_insert_with(|| Connection::new(device_id));

        if connection.status == ConnectionStatus::Connected {
            debug!("Device {} already connected", device_id);
            return;
        }

        connection.transition(ConnectionStatus::Connecting, "authenticated");
        connection.transition(ConnectionStatus::Connected, "authenticated");
        info!("Device {} connected", device_id);
        let _ = self.event_tx.send(ConnectionEvent::Connected {
            device_id: device_id.to_string(),
        });
    }

    /// Drop the connection to a device, returning whether one existed
    pub fn disconnect(&mut self, device_id: &str, reason: &str) -> bool {
        match self.connections.remove(device_id) {
            Some(_) => {
                info!("Device {} disconnected: {}", device_id, reason);
                let _ = self.event_tx.send(ConnectionEvent::Disconnected {
                    device_id: device_id.to_string(),
                    reason: Some(reason.to_string()),
                });
                true
            }
            None => false,
        }
    }

    /// Apply a device state change reported by the service
    ///
    /// `trusted` tells whether the registry trusts the device; only trusted
    /// devices are connected when they come online.
    pub fn on_device_state_change(
        &mut self,
        action: DeviceStateAction,
        device: &DeviceInfo,
        trusted: bool,
    ) -> StateChangeEffect {
        let device_id = device.device_id.as_str();
        debug!("Device {} state change: {:?}", device_id, action);

        match action {
            DeviceStateAction::Offline => {
                self.disconnect(device_id, "device offline");
                StateChangeEffect::TearDown
            }
            DeviceStateAction::Online if trusted => {
                self.establish(device_id);
                StateChangeEffect::Connected
            }
            DeviceStateAction::Online => StateChangeEffect::Ignored,
            DeviceStateAction::Ready | DeviceStateAction::Changed => {
                if let Some(connection) = self.connections.get_mut(device_id) {
                    connection.last_state_change_reason = Some(format!("{:?}", action).to_lowercase());
                    connection.changed_at = Utc::now();
                }
                let _ = self.event_tx.send(ConnectionEvent::Refreshed {
                    device_id: device_id.to_string(),
                });
                StateChangeEffect::Refresh
            }
        }
    }

    /// Disconnect everything after the service died, returning affected ids
    pub fn on_service_died(&mut self) -> Vec<String> {
        let mut device_ids: Vec<String> = self.connections.keys().cloned().collect();
        device_ids.sort();

        for device_id in &device_ids {
            self.disconnect(device_id, "service died");
        }
        device_ids
    }

    /// Connection status of a device
    pub fn status(&self, device_id: &str) -> ConnectionStatus {
        self.connections
            .get(device_id)
            .map(|c| c.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Get a connection by device ID
    pub fn connection(&self, device_id: &str) -> Option<&Connection> {
        self.connections.get(device_id)
    }

    /// IDs of all connected devices
    pub fn connected_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .values()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .map(|c| c.device_id.clone())
            .collect();
        ids.sort();
        ids
    }
}
