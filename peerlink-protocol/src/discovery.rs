//! Device Discovery
//!
//! This module tracks subscribe sessions against the device service and
//! deduplicates the peers each session reports.
//!
//! ## Discovery Sessions
//!
//! 1. **Subscribe**: The caller picks a subscribe id and a [`SubscribeInfo`]
//! 2. **Advertise**: The service reports every peer it sees for that id
//! 3. **Stop**: The caller stops the session explicitly
//!
//! A session has no inherent lifetime. It stays active until stopped, even
//! when the service reports a discovery failure for it.
//!
//! ## Subscribe Parameters
//!
//! | Field      | Values                                   |
//! |------------|------------------------------------------|
//! | mode       | `0x55` passive, `0xAA` active            |
//! | medium     | `0` auto, `1` BLE, `2` CoAP, `3` USB     |
//! | freq       | `0` low, `1` mid, `2` high, `3` super high |
//! | capability | `0` DDMP, `1` OSD                        |
//!
//! Raw values outside these ranges are rejected with
//! [`ProtocolError::InvalidConfig`].

use crate::{DeviceInfo, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Highest subscribe id accepted by the service
pub const MAX_SUBSCRIBE_ID: i64 = 65535;

/// Discovery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverMode {
    /// Listen for advertisements only
    Passive = 0x55,
    /// Actively search for peers
    Active = 0xAA,
}

impl TryFrom<i32> for DiscoverMode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0x55 => Ok(DiscoverMode::Passive),
            0xAA => Ok(DiscoverMode::Active),
            other => Err(ProtocolError::InvalidConfig(format!(
                "discover mode {:#x} is not supported",
                other
            ))),
        }
    }
}

/// Physical medium used for discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeMedium {
    Auto = 0,
    Ble = 1,
    Coap = 2,
    Usb = 3,
}

impl TryFrom<i32> for ExchangeMedium {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ExchangeMedium::Auto),
            1 => Ok(ExchangeMedium::Ble),
            2 => Ok(ExchangeMedium::Coap),
            3 => Ok(ExchangeMedium::Usb),
            other => Err(ProtocolError::InvalidConfig(format!(
                "exchange medium {} out of range",
                other
            ))),
        }
    }
}

/// How often the medium is scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeFreq {
    Low = 0,
    Mid = 1,
    High = 2,
    SuperHigh = 3,
}

impl TryFrom<i32> for ExchangeFreq {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(ExchangeFreq::Low),
            1 => Ok(ExchangeFreq::Mid),
            2 => Ok(ExchangeFreq::High),
            3 => Ok(ExchangeFreq::SuperHigh),
            other => Err(ProtocolError::InvalidConfig(format!(
                "exchange frequency {} out of range",
                other
            ))),
        }
    }
}

/// Capability the subscriber is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscribeCapability {
    Ddmp = 0,
    Osd = 1,
}

impl TryFrom<i32> for SubscribeCapability {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(SubscribeCapability::Ddmp),
            1 => Ok(SubscribeCapability::Osd),
            other => Err(ProtocolError::InvalidConfig(format!(
                "subscribe capability {} out of range",
                other
            ))),
        }
    }
}

/// Parameters of one discovery subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeInfo {
    pub subscribe_id: u16,
    pub mode: DiscoverMode,
    pub medium: ExchangeMedium,
    pub freq: ExchangeFreq,
    pub is_same_account: bool,
    pub is_wake_remote: bool,
    pub capability: SubscribeCapability,
}

impl SubscribeInfo {
    /// Active CoAP discovery at high frequency, the usual foreground setup
    ///
    /// # Examples
    ///
    /// ```
    /// use peerlink_protocol::discovery::{DiscoverMode, SubscribeInfo};
    ///
    /// let info = SubscribeInfo::new(42);
    /// assert_eq!(info.mode, DiscoverMode::Active);
    /// assert!(info.is_wake_remote);
    /// ```
    pub fn new(subscribe_id: u16) -> Self {
        Self {
            subscribe_id,
            mode: DiscoverMode::Active,
            medium: ExchangeMedium::Coap,
            freq: ExchangeFreq::High,
            is_same_account: false,
            is_wake_remote: true,
            capability: SubscribeCapability::Ddmp,
        }
    }

    /// Build subscribe parameters from raw integers, validating every range
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidConfig`] when any field is outside its
    /// supported range.
    ///
    /// # Examples
    ///
    /// ```
    /// use peerlink_protocol::discovery::SubscribeInfo;
    ///
    /// assert!(SubscribeInfo::from_raw(7, 0xAA, 2, 2, false, true, 0).is_ok());
    /// assert!(SubscribeInfo::from_raw(7, 0xAA, 9, 2, false, true, 0).is_err());
    /// assert!(SubscribeInfo::from_raw(70_000, 0xAA, 2, 2, false, true, 0).is_err());
    /// ```
    pub fn from_raw(
        subscribe_id: i64,
        mode: i32,
        medium: i32,
        freq: i32,
        is_same_account: bool,
        is_wake_remote: bool,
        capability: i32,
    ) -> Result<Self> {
        let subscribe_id = u16::try_from(subscribe_id).map_err(|_| {
            ProtocolError::InvalidConfig(format!(
                "subscribe id {} outside 0..={}",
                subscribe_id, MAX_SUBSCRIBE_ID
            ))
        })?;

        Ok(Self {
            subscribe_id,
            mode: DiscoverMode::try_from(mode)?,
            medium: ExchangeMedium::try_from(medium)?,
            freq: ExchangeFreq::try_from(freq)?,
            is_same_account,
            is_wake_remote,
            capability: SubscribeCapability::try_from(capability)?,
        })
    }

    pub fn with_mode(mut self, mode: DiscoverMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_medium(mut self, medium: ExchangeMedium) -> Self {
        self.medium = medium;
        self
    }

    pub fn with_freq(mut self, freq: ExchangeFreq) -> Self {
        self.freq = freq;
        self
    }
}

impl fmt::Display for SubscribeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subscribe {} ({:?}/{:?}/{:?})",
            self.subscribe_id, self.mode, self.medium, self.freq
        )
    }
}

/// One active subscription and the devices it has reported
#[derive(Debug, Clone)]
pub struct DiscoverySession {
    info: SubscribeInfo,
    discovered: HashSet<String>,
}

impl DiscoverySession {
    fn new(info: SubscribeInfo) -> Self {
        Self {
            info,
            discovered: HashSet::new(),
        }
    }

    /// Subscribe parameters of this session
    pub fn info(&self) -> &SubscribeInfo {
        &self.info
    }

    /// Number of distinct devices reported so far
    pub fn discovered_count(&self) -> usize {
        self.discovered.len()
    }

    /// Check if the session already reported a device
    pub fn has_discovered(&self, device_id: &str) -> bool {
        self.discovered.contains(device_id)
    }
}

/// Bookkeeping for every active discovery session
///
/// The engine never talks to the service itself. The device manager asks the
/// service to start or stop a subscription and keeps the engine in step.
#[derive(Debug, Default)]
pub struct DiscoveryEngine {
    sessions: HashMap<u16, DiscoverySession>,
    next_id: u16,
}

impl DiscoveryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a subscribe id that no active session uses
    pub fn allocate_id(&mut self) -> Result<u16> {
        if self.sessions.len() > MAX_SUBSCRIBE_ID as usize {
            return Err(ProtocolError::InvalidConfig(
                "every subscribe id is in use".to_string(),
            ));
        }

        loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.sessions.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Record a new active session
    ///
    /// Fails with [`ProtocolError::InvalidConfig`] if the id is already active.
    pub fn start(&mut self, info: SubscribeInfo) -> Result<u16> {
        let subscribe_id = info.subscribe_id;
        if self.sessions.contains_key(&subscribe_id) {
            return Err(ProtocolError::InvalidConfig(format!(
                "subscribe id {} is already active",
                subscribe_id
            )));
        }

        info!("Starting discovery: {}", info);
        self.sessions.insert(subscribe_id, DiscoverySession::new(info));
        Ok(subscribe_id)
    }

    /// Stop a session
    ///
    /// Returns the ids of the devices only this session discovered, or `None`
    /// when the session was unknown or already stopped.
    pub fn stop(&mut self, subscribe_id: u16) -> Option<Vec<String>> {
        match self.sessions.remove(&subscribe_id) {
            Some(session) => {
                info!(
                    "Stopped discovery {} ({} devices seen)",
                    subscribe_id,
                    session.discovered.len()
                );
                let mut expired: Vec<String> = session
                    .discovered
                    .into_iter()
                    .filter(|id| !self.sessions.values().any(|s| s.discovered.contains(id)))
                    .collect();
                expired.sort();
                Some(expired)
            }
            None => {
                debug!("Discovery {} not active, nothing to stop", subscribe_id);
                None
            }
        }
    }

    /// Stop every session, returning the stopped ids
    pub fn stop_all(&mut self) -> Vec<u16> {
        let mut stopped: Vec<u16> = self.sessions.drain().map(|(id, _)| id).collect();
        stopped.sort_unstable();
        if !stopped.is_empty() {
            info!("Stopped {} discovery sessions", stopped.len());
        }
        stopped
    }

    /// Record a device reported by a session
    ///
    /// Returns `Ok(true)` only for the first sighting of the device within
    /// the session, and [`ProtocolError::StaleCallback`] when the session is
    /// not active.
    pub fn on_device_found(&mut self, subscribe_id: u16, device: &DeviceInfo) -> Result<bool> {
        let session = self.sessions.get_mut(&subscribe_id).ok_or_else(|| {
            ProtocolError::StaleCallback(format!(
                "device {} found by inactive subscription {}",
                device.device_id, subscribe_id
            ))
        })?;

        let first = session.discovered.insert(device.device_id.clone());
        if first {
            debug!(
                "Subscription {} found {} ({})",
                subscribe_id, device.device_name, device.device_id
            );
        }
        Ok(first)
    }

    /// Record a discovery failure; the session stays active
    pub fn on_discovery_failed(&mut self, subscribe_id: u16, reason: i32) -> Result<()> {
        if !self.sessions.contains_key(&subscribe_id) {
            return Err(ProtocolError::StaleCallback(format!(
                "discovery failure {} for inactive subscription {}",
                reason, subscribe_id
            )));
        }

        warn!("Discovery {} failed with reason {}", subscribe_id, reason);
        Ok(())
    }

    /// Clear a device from every session so a later advertisement reports it again
    pub fn forget_device(&mut self, device_id: &str) {
        for session in self.sessions.values_mut() {
            session.discovered.remove(device_id);
        }
    }

    /// Check whether a subscribe id is active
    pub fn is_active(&self, subscribe_id: u16) -> bool {
        self.sessions.contains_key(&subscribe_id)
    }

    /// Get an active session
    pub fn session(&self, subscribe_id: u16) -> Option<&DiscoverySession> {
        self.sessions.get(&subscribe_id)
    }

    /// Ids of all active sessions
    pub fn active_sessions(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
