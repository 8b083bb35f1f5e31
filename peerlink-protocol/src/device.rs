//! Device Registry
//!
//! This module tracks every peer the local endpoint knows about and how far
//! each one has progressed towards being trusted.
//!
//! ## Trust Lifecycle
//!
//! 1. **Discovered**: Device advertised itself in an active discovery session
//! 2. **Authenticating**: A pairing attempt is running against the device
//! 3. **Trusted**: The pairing attempt completed successfully
//! 4. **Rejected**: The last pairing attempt was declined
//!
//! A device can only reach [`TrustState::Trusted`] through
//! [`DeviceRegistry::complete_authentication`], which requires the device to
//! be in [`TrustState::Authenticating`] first.
//!
//! ## Persistence
//!
//! When the registry has a backing file, trusted devices are written to it as
//! JSON so they survive restarts. Provisional states are never persisted.

use crate::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of a peer device as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Opaque device identifier
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    /// Device category (phone, tablet, printer, ...) as a numeric id
    pub device_type_id: u16,

    /// Network identifier, when the service reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

impl DeviceInfo {
    /// Create a new DeviceInfo
    ///
    /// # Examples
    ///
    /// ```
    /// use peerlink_protocol::DeviceInfo;
    ///
    /// let info = DeviceInfo::new("AA:BB:CC", "Printer-42", 7);
    /// assert_eq!(info.device_type_id, 7);
    /// ```
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type_id: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type_id,
            network_id: None,
        }
    }

    /// Create a DeviceInfo with a freshly generated identifier
    pub fn generate(device_name: impl Into<String>, device_type_id: u16) -> Self {
        Self::new(Uuid::new_v4().to_string(), device_name, device_type_id)
    }

    /// Attach a network identifier
    pub fn with_network_id(mut self, network_id: impl Into<String>) -> Self {
        self.network_id = Some(network_id.into());
        self
    }
}

/// How far a device has progressed towards being trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustState {
    /// Known by id only
    Unknown,
    /// Seen in a discovery session
    Discovered,
    /// A pairing attempt is in flight
    Authenticating,
    /// Pairing completed
    Trusted,
    /// Last pairing attempt was declined
    Rejected,
}

impl TrustState {
    /// Provisional states are dropped on service death and never persisted
    pub fn is_provisional(&self) -> bool {
        matches!(self, TrustState::Authenticating)
    }
}

/// Registry entry for one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Device identity
    #[serde(flatten)]
    pub info: DeviceInfo,

    trust_state: TrustState,

    /// Last time the device was seen (UNIX timestamp)
    pub last_seen: u64,

    /// When the device last completed pairing
    #[serde(default)]
    pub trusted_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Create a new device from discovery info
    pub fn from_discovery(info: DeviceInfo) -> Self {
        Self {
            info,
            trust_state: TrustState::Discovered,
            last_seen: current_timestamp(),
            trusted_at: None,
        }
    }

    /// Create an entry for a device known only by its identity
    fn unknown(info: DeviceInfo) -> Self {
        Self {
            info,
            trust_state: TrustState::Unknown,
            last_seen: current_timestamp(),
            trusted_at: None,
        }
    }

    /// Get device ID
    pub fn id(&self) -> &str {
        &self.info.device_id
    }

    /// Get device name
    pub fn name(&self) -> &str {
        &self.info.device_name
    }

    /// Current trust state
    pub fn trust_state(&self) -> TrustState {
        self.trust_state
    }

    /// Check if device is trusted
    pub fn is_trusted(&self) -> bool {
        self.trust_state == TrustState::Trusted
    }

    /// Update last seen timestamp
    pub fn update_last_seen(&mut self) {
        self.last_seen = current_timestamp();
    }

    /// Get time since last seen in seconds
    pub fn seconds_since_last_seen(&self) -> u64 {
        current_timestamp().saturating_sub(self.last_seen)
    }
}

/// Registry of known peer devices
pub struct DeviceRegistry {
    /// Map of device ID to device
    devices: HashMap<String, Device>,

    /// Path to store trusted devices, if persistence is enabled
    registry_path: Option<PathBuf>,
}

impl DeviceRegistry {
    /// Create a registry backed by a JSON file
    ///
    /// Trusted devices stored at `registry_path` are loaded immediately.
    pub fn new(registry_path: impl Into<PathBuf>) -> Result<Self> {
        let registry_path = registry_path.into();

        if let Some(parent) = registry_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut registry = Self {
            devices: HashMap::new(),
            registry_path: Some(registry_path),
        };
        registry.load_registry()?;

        Ok(registry)
    }

    /// Create a registry without persistence
    pub fn in_memory() -> Self {
        Self {
            devices: HashMap::new(),
            registry_path: None,
        }
    }

    /// Get a device by ID
    pub fn get_device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    /// Check if a device exists
    pub fn has_device(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// Get all devices
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Get all trusted devices
    pub fn trusted_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.is_trusted())
    }

    /// Get count of devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Get count of trusted devices
    pub fn trusted_count(&self) -> usize {
        self.trusted_devices().count()
    }

    /// Insert or refresh a device seen by discovery
    ///
    /// Returns `true` when the device was not known before. Devices that are
    /// trusted or mid-authentication keep their trust state.
    pub fn upsert_discovered(&mut self, info: DeviceInfo) -> bool {
        let device_id = info.device_id.clone();

        if let Some(device) = self.devices.get_mut(&device_id) {
            device.info = info;
            device.update_last_seen();
            if matches!(device.trust_state, TrustState::Unknown | TrustState::Rejected) {
                device.trust_state = TrustState::Discovered;
            }
            debug!("Updated device from discovery: {}", device_id);
            false
        } else {
            info!("Discovered device: {} ({})", info.device_name, device_id);
            self.devices.insert(device_id, Device::from_discovery(info));
            true
        }
    }

    /// Refresh metadata reported by a device state change
    pub fn update_info(&mut self, info: DeviceInfo) -> Result<()> {
        let device = self
            .devices
            .get_mut(&info.device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(info.device_id.clone()))?;

        device.info = info;
        device.update_last_seen();
        Ok(())
    }

    /// Mark a device as being authenticated
    ///
    /// Devices that were never discovered are inserted as well.
    pub fn begin_authentication(&mut self, info: &DeviceInfo) {
        let device = self
            .devices
            .entry(info.device_id.clone())
            .or_insert_with(|| Device::unknown(info.clone()));

        device.trust_state = TrustState::Authenticating;
        device.update_last_seen();
        debug!("Device {} is authenticating", info.device_id);
    }

    /// Promote a device to trusted after a completed pairing attempt
    pub fn complete_authentication(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        if device.trust_state != TrustState::Authenticating {
            return Err(ProtocolError::InvalidValue(format!(
                "device {} has no authentication in progress ({:?})",
                device_id, device.trust_state
            )));
        }

        device.trust_state = TrustState::Trusted;
        device.trusted_at = Some(Utc::now());
        info!("Device {} ({}) is now trusted", device.name(), device_id);

        self.persist();
        Ok(())
    }

    /// Revert an interrupted authentication back to discovered
    pub fn revert_authentication(&mut self, device_id: &str) {
        if let Some(device) = self.devices.get_mut(device_id) {
            if device.trust_state == TrustState::Authenticating {
                device.trust_state = TrustState::Discovered;
                debug!("Reverted authentication state for {}", device_id);
            }
        }
    }

    /// Record that the last pairing attempt was declined
    pub fn mark_rejected(&mut self, device_id: &str) {
        if let Some(device) = self.devices.get_mut(device_id) {
            if device.trust_state == TrustState::Authenticating {
                device.trust_state = TrustState::Rejected;
                debug!("Device {} rejected pairing", device_id);
            }
        }
    }

    /// Revert every provisional state, returning how many devices changed
    pub fn revert_provisional(&mut self) -> usize {
        let mut reverted = 0;
        for device in self.devices.values_mut() {
            if device.trust_state.is_provisional() {
                device.trust_state = TrustState::Discovered;
                reverted += 1;
            }
        }
        if reverted > 0 {
            info!("Reverted {} provisional trust states", reverted);
        }
        reverted
    }

    /// Drop trust for a device
    pub fn untrust(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        device.trust_state = TrustState::Discovered;
        device.trusted_at = None;
        info!("Device {} is no longer trusted", device_id);

        self.persist();
        Ok(())
    }

    /// Remove a device by ID
    pub fn remove_device(&mut self, device_id: &str) -> Option<Device> {
        info!("Removing device: {}", device_id);
        let removed = self.devices.remove(device_id);
        if removed.as_ref().is_some_and(|d| d.is_trusted()) {
            self.persist();
        }
        removed
    }

    /// Evict devices that were never trusted
    ///
    /// Called when the discovery session that found them expires. Devices in
    /// a pairing attempt or already trusted are kept.
    pub fn evict_untrusted<'a>(&mut self, device_ids: impl IntoIterator<Item = &'a String>) -> usize {
        let mut evicted = 0;
        for device_id in device_ids {
            let evict = self
                .devices
                .get(device_id)
                .is_some_and(|d| !d.is_trusted() && !d.trust_state.is_provisional());
            if evict {
                self.devices.remove(device_id);
                debug!("Evicted untrusted device: {}", device_id);
                evicted += 1;
            }
        }
        evicted
    }

    /// Save trusted devices to disk
    pub fn save_registry(&self) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        let trusted: HashMap<&String, &Device> = self
            .devices
            .iter()
            .filter(|(_, d)| d.is_trusted())
            .collect();

        let json = serde_json::to_string_pretty(&trusted)?;
        fs::write(path, json)?;
        debug!("Saved {} trusted devices to {:?}", trusted.len(), path);
        Ok(())
    }

    /// Load trusted devices from disk
    pub fn load_registry(&mut self) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        if !path.exists() {
            debug!("No existing registry file at {:?}", path);
            return Ok(());
        }

        let json = fs::read_to_string(path)?;
        let stored: HashMap<String, Device> = serde_json::from_str(&json)?;
        for (device_id, device) in stored {
            if device.is_trusted() {
                self.devices.insert(device_id, device);
            }
        }
        info!("Loaded {} trusted devices from registry", self.devices.len());
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save_registry() {
            warn!("Failed to save device registry: {}", e);
        }
    }
}

/// Get current UNIX timestamp in seconds
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn printer() -> DeviceInfo {
        DeviceInfo::new("AA:BB:CC", "Printer-42", 7)
    }

    #[test]
    fn test_device_creation() {
        let device = Device::from_discovery(printer());

        assert_eq!(device.trust_state(), TrustState::Discovered);
        assert!(!device.is_trusted());
        assert!(device.last_seen > 0);
        assert_eq!(device.seconds_since_last_seen(), 0);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = DeviceInfo::generate("Phone", 14);
        let b = DeviceInfo::generate("Phone", 14);
        assert_ne!(a.device_id, b.device_id);
    }

    #[test]
    fn test_upsert_discovered() {
        let mut registry = DeviceRegistry::in_memory();

        assert!(registry.upsert_discovered(printer()));
        assert!(!registry.upsert_discovered(printer()));
        assert_eq!(registry.device_count(), 1);
    }

    #[test]
    fn test_discovery_does_not_demote_trust() {
        let mut registry = DeviceRegistry::in_memory();
        registry.upsert_discovered(printer());
        registry.begin_authentication(&printer());
        registry.complete_authentication("AA:BB:CC").unwrap();

        registry.upsert_discovered(printer());
        assert!(registry.get_device("AA:BB:CC").unwrap().is_trusted());
    }

    #[test]
    fn test_trust_requires_authentication() {
        let mut registry = DeviceRegistry::in_memory();
        registry.upsert_discovered(printer());

        let result = registry.complete_authentication("AA:BB:CC");
        assert!(matches!(result, Err(ProtocolError::InvalidValue(_))));
        assert_eq!(registry.trusted_count(), 0);

        let result = registry.complete_authentication("missing");
        assert!(matches!(result, Err(ProtocolError::DeviceNotFound(_))));
    }

    #[test]
    fn test_authentication_lifecycle() {
        let mut registry = DeviceRegistry::in_memory();

        registry.begin_authentication(&printer());
        let device = registry.get_device("AA:BB:CC").unwrap();
        assert_eq!(device.trust_state(), TrustState::Authenticating);

        registry.mark_rejected("AA:BB:CC");
        assert_eq!(
            registry.get_device("AA:BB:CC").unwrap().trust_state(),
            TrustState::Rejected
        );

        registry.upsert_discovered(printer());
        assert_eq!(
            registry.get_device("AA:BB:CC").unwrap().trust_state(),
            TrustState::Discovered
        );
    }

    #[test]
    fn test_revert_provisional() {
        let mut registry = DeviceRegistry::in_memory();
        registry.begin_authentication(&printer());
        registry.begin_authentication(&DeviceInfo::new("DD:EE:FF", "Tablet", 17));

        assert_eq!(registry.revert_provisional(), 2);
        assert_eq!(registry.trusted_count(), 0);
        assert!(registry.devices().all(|d| d.trust_state() == TrustState::Discovered));
    }

    #[test]
    fn test_evict_untrusted_keeps_trusted() {
        let mut registry = DeviceRegistry::in_memory();
        registry.upsert_discovered(printer());
        registry.upsert_discovered(DeviceInfo::new("DD:EE:FF", "Tablet", 17));
        registry.begin_authentication(&printer());
        registry.complete_authentication("AA:BB:CC").unwrap();

        let ids = vec!["AA:BB:CC".to_string(), "DD:EE:FF".to_string()];
        assert_eq!(registry.evict_untrusted(&ids), 1);
        assert!(registry.has_device("AA:BB:CC"));
        assert!(!registry.has_device("DD:EE:FF"));
    }

    #[test]
    fn test_registry_persists_only_trusted() {
        let temp_dir = TempDir::new().unwrap();
        let registry_path = temp_dir.path().join("registry.json");

        {
            let mut registry = DeviceRegistry::new(&registry_path).unwrap();
            registry.upsert_discovered(printer());
            registry.begin_authentication(&printer());
            registry.complete_authentication("AA:BB:CC").unwrap();
            registry.begin_authentication(&DeviceInfo::new("DD:EE:FF", "Tablet", 17));
            registry.save_registry().unwrap();
        }

        let registry = DeviceRegistry::new(&registry_path).unwrap();
        assert_eq!(registry.device_count(), 1);
        let device = registry.get_device("AA:BB:CC").unwrap();
        assert!(device.is_trusted());
        assert!(device.trusted_at.is_some());
        assert_eq!(device.name(), "Printer-42");
    }

    #[test]
    fn test_untrust_persists() {
        let temp_dir = TempDir::new().unwrap();
        let registry_path = temp_dir.path().join("registry.json");

        {
            let mut registry = DeviceRegistry::new(&registry_path).unwrap();
            registry.begin_authentication(&printer());
            registry.complete_authentication("AA:BB:CC").unwrap();
            registry.untrust("AA:BB:CC").unwrap();
        }

        let registry = DeviceRegistry::new(&registry_path).unwrap();
        assert_eq!(registry.device_count(), 0);
    }
}
