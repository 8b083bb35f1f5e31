//! Device Manager
//!
//! The operation surface applications use. One `DeviceManager` exists per
//! registered package and owns all state for it: the device registry, the
//! discovery sessions, the pairing state machine and the connections.
//!
//! ## Event Flow
//!
//! ```text
//! DeviceService --ServiceEvent--> event pump --> discovery / connections / pairing
//!                                                  |
//!                                                  v
//!                                        registry --> EventDispatcher --> handlers
//! ```
//!
//! The pump drains service events sequentially on its own task. Pairing
//! prompts for the UI arrive separately on [`DeviceManager::auth_events`].
//!
//! ## Example
//!
//! ```no_run
//! use peerlink_protocol::discovery::SubscribeInfo;
//! use peerlink_protocol::transport::LoopbackHub;
//! use peerlink_protocol::{DeviceInfo, DeviceManager, ManagerConfig};
//!
//! # async fn example() -> peerlink_protocol::Result<()> {
//! let hub = LoopbackHub::new();
//! let service = hub.endpoint(DeviceInfo::new("11:22:33", "Phone", 14));
//! let manager = DeviceManager::create("com.example.app", service, ManagerConfig::default()).await?;
//!
//! let subscribe_id = manager.start_device_discovery(SubscribeInfo::new(1)).await?;
//! manager.stop_device_discovery(subscribe_id).await?;
//! manager.release().await?;
//! # Ok(())
//! # }
//! ```

use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionStatus, DeviceStateAction, StateChangeEffect,
};
use crate::device::{Device, DeviceRegistry};
use crate::discovery::{DiscoveryEngine, SubscribeInfo};
use crate::events::{DeviceManagerEvent, EventDispatcher, EventHandler, EventKind};
use crate::pairing::{
    AuthEvent, AuthOutcome, AuthParam, AuthParamPoller, AuthRequest, AuthState, AuthStateMachine,
    PendingVerify, PinProgress, PollerHandle, UserOperation, VerifyAuthInfo, VerifyOutcome,
    AUTH_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
use crate::transport::{DeviceService, ServiceEvent};
use crate::{DeviceInfo, ProtocolError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Device manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Where trusted devices are persisted; in memory only when `None`
    pub registry_path: Option<PathBuf>,
    /// Countdown for PIN display, PIN entry and approval
    pub auth_timeout: Duration,
    /// Interval for authentication param polling
    pub poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            registry_path: None,
            auth_timeout: AUTH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ManagerConfig {
    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }
}

/// State shared between the manager and its event pump
struct Shared {
    registry: Arc<RwLock<DeviceRegistry>>,
    discovery: Mutex<DiscoveryEngine>,
    connections: Mutex<ConnectionManager>,
    machine: AuthStateMachine,
    dispatcher: EventDispatcher,
}

impl Shared {
    fn read_registry(&self) -> RwLockReadGuard<'_, DeviceRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, DeviceRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_discovery(&self) -> MutexGuard<'_, DiscoveryEngine> {
        self.discovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_connections(&self) -> MutexGuard<'_, ConnectionManager> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_service_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::DeviceFound {
                subscribe_id,
                device,
            } => {
                let first = match self.lock_discovery().on_device_found(subscribe_id, &device) {
                    Ok(first) => first,
                    Err(e) => {
                        debug!("{}", e);
                        return;
                    }
                };
                if !first {
                    debug!(
                        "Duplicate advertisement of {} on subscription {}",
                        device.device_id, subscribe_id
                    );
                    return;
                }

                self.write_registry().upsert_discovered(device.clone());
                self.dispatcher.dispatch(&DeviceManagerEvent::DeviceFound {
                    subscribe_id,
                    device,
                });
            }

            ServiceEvent::DiscoveryFailed {
                subscribe_id,
                reason,
            } => {
                if let Err(e) = self
                    .lock_discovery()
                    .on_discovery_failed(subscribe_id, reason)
                {
                    debug!("{}", e);
                    return;
                }
                self.dispatcher.dispatch(&DeviceManagerEvent::DiscoverFail {
                    subscribe_id,
                    reason,
                });
            }

            ServiceEvent::DeviceStateChanged { action, device } => {
                let state_action = match DeviceStateAction::try_from(action) {
                    Ok(state_action) => state_action,
                    Err(e) => {
                        warn!("Ignoring state change for {}: {}", device.device_id, e);
                        return;
                    }
                };

                let trusted = self
                    .read_registry()
                    .get_device(&device.device_id)
                    .is_some_and(|d| d.is_trusted());
                let effect = self
                    .lock_connections()
                    .on_device_state_change(state_action, &device, trusted);

                match effect {
                    StateChangeEffect::TearDown => {
                        self.machine.abort_device(&device.device_id).await;
                        self.lock_discovery().forget_device(&device.device_id);
                    }
                    StateChangeEffect::Refresh => {
                        if let Err(e) = self.write_registry().update_info(device.clone()) {
                            debug!("Not refreshing unknown device: {}", e);
                        }
                    }
                    StateChangeEffect::Connected | StateChangeEffect::Ignored => {}
                }

                self.dispatcher
                    .dispatch(&DeviceManagerEvent::DeviceStateChange { action, device });
            }

            ServiceEvent::FaCall(payload) => {
                self.dispatcher
                    .dispatch(&DeviceManagerEvent::DmFaCallback(payload));
            }

            ServiceEvent::ServiceDied => {
                self.handle_service_death().await;
                self.dispatcher.dispatch(&DeviceManagerEvent::ServiceDie);
            }
        }
    }

    /// Tear down every session; handles issued by the dead service are invalid
    async fn handle_service_death(&self) {
        error!("Device service died, tearing down all sessions");

        let aborted = self.machine.abort_all().await;
        let stopped = self.lock_discovery().stop_all();
        let disconnected = self.lock_connections().on_service_died();

        info!(
            "Service death cleanup: {} pairings, {} discoveries, {} connections",
            aborted,
            stopped.len(),
            disconnected.len()
        );
    }
}

async fn run_event_pump(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<ServiceEvent>) {
    while let Some(event) = events.recv().await {
        shared.handle_service_event(event).await;
    }
    debug!("Service event channel closed");
}

/// Discovery, pairing and connection handling for one package
pub struct DeviceManager {
    package_name: String,
    local_device: DeviceInfo,
    service: Arc<dyn DeviceService>,
    shared: Arc<Shared>,
    config: ManagerConfig,
    auth_events: Mutex<Option<mpsc::UnboundedReceiver<AuthEvent>>>,
    connection_events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl DeviceManager {
    /// Register `package_name` with the service and start the event pump
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidValue`] for an empty package name, registry
    /// load failures, or whatever the service reports for the registration.
    pub async fn create(
        package_name: impl Into<String>,
        service: Arc<dyn DeviceService>,
        config: ManagerConfig,
    ) -> Result<Self> {
        let package_name = package_name.into();
        if package_name.is_empty() {
            return Err(ProtocolError::InvalidValue(
                "package name must not be empty".to_string(),
            ));
        }

        let registry = match &config.registry_path {
            Some(path) => DeviceRegistry::new(path)?,
            None => DeviceRegistry::in_memory(),
        };
        let registry = Arc::new(RwLock::new(registry));

        let events = service.register(&package_name).await?;
        let local_device = service.local_device_info().await?;
        let (machine, auth_events) =
            AuthStateMachine::new(registry.clone(), service.clone(), config.auth_timeout);
        let (connections, connection_events) = ConnectionManager::new();

        let shared = Arc::new(Shared {
            registry,
            discovery: Mutex::new(DiscoveryEngine::new()),
            connections: Mutex::new(connections),
            machine,
            dispatcher: EventDispatcher::new(),
        });
        let pump = tokio::spawn(run_event_pump(shared.clone(), events));

        info!(
            "Device manager created for {} on {} ({})",
            package_name, local_device.device_name, local_device.device_id
        );
        Ok(Self {
            package_name,
            local_device,
            service,
            shared,
            config,
            auth_events: Mutex::new(Some(auth_events)),
            connection_events: Mutex::new(Some(connection_events)),
            pump: Mutex::new(Some(pump)),
            released: AtomicBool::new(false),
        })
    }

    /// Package this manager was created for
    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// Pick a subscribe id not used by any active discovery
    pub fn next_subscribe_id(&self) -> Result<u16> {
        self.ensure_active()?;
        self.shared.lock_discovery().allocate_id()
    }

    /// Start a discovery session
    pub async fn start_device_discovery(&self, info: SubscribeInfo) -> Result<u16> {
        self.ensure_active()?;
        let subscribe_id = self.shared.lock_discovery().start(info.clone())?;

        if let Err(e) = self.service.start_discovery(&info).await {
            error!("Failed to start discovery {}: {}", subscribe_id, e);
            self.shared.lock_discovery().stop(subscribe_id);
            return Err(e);
        }
        Ok(subscribe_id)
    }

    /// Stop a discovery session; unknown or stopped ids are a no-op
    ///
    /// Devices seen only by this session that never became trusted are
    /// evicted from the registry.
    pub async fn stop_device_discovery(&self, subscribe_id: u16) -> Result<()> {
        self.ensure_active()?;
        let Some(expired) = self.shared.lock_discovery().stop(subscribe_id) else {
            return Ok(());
        };

        if let Err(e) = self.service.stop_discovery(subscribe_id).await {
            warn!("Service failed to stop discovery {}: {}", subscribe_id, e);
        }

        let evicted = self.shared.write_registry().evict_untrusted(&expired);
        if evicted > 0 {
            debug!("Evicted {} devices with discovery {}", evicted, subscribe_id);
        }
        Ok(())
    }

    /// Authenticate a peer, resolving once pairing concludes
    ///
    /// A failed attempt is not retried; call again for a fresh attempt.
    pub async fn authenticate_device(
        &self,
        device: DeviceInfo,
        request: AuthRequest,
    ) -> Result<AuthOutcome> {
        self.ensure_active()?;
        let device_id = device.device_id.clone();
        let generation = self.shared.machine.begin_request(&device, &request).await?;

        match self.service.authenticate_device(&device, &request).await {
            Ok(outcome) => match self.shared.machine.complete(&device_id, generation).await {
                Ok(()) => {
                    self.shared.lock_connections().establish(&device_id);
                    Ok(outcome)
                }
                Err(e) => {
                    debug!("{}", e);
                    Err(ProtocolError::AuthRejected(format!(
                        "pairing with {} was aborted",
                        device_id
                    )))
                }
            },
            Err(e) => {
                if let Err(stale) = self
                    .shared
                    .machine
                    .fail_request(&device_id, generation, &e)
                    .await
                {
                    debug!("{}", stale);
                }
                self.shared.lock_discovery().forget_device(&device_id);
                Err(e)
            }
        }
    }

    /// Fetch and apply the next authentication param; `None` means no change yet
    pub async fn get_authentication_param(&self) -> Result<Option<AuthParam>> {
        self.ensure_active()?;
        self.poller().poll_once().await
    }

    /// Poll authentication params in the background at the configured interval
    pub fn spawn_auth_param_poller(&self) -> Result<PollerHandle> {
        self.ensure_active()?;
        Ok(self.poller().spawn())
    }

    /// Type one PIN digit; the sixth digit submits the PIN for verification
    pub async fn enter_pin_digit(&self, device_id: &str, digit: char) -> Result<PinProgress> {
        self.ensure_active()?;
        let progress = self.shared.machine.enter_digit(device_id, digit).await?;

        if let PinProgress::Complete(pending) = &progress {
            match self.run_verify(pending).await {
                Ok(_) => {}
                Err(e) if e.is_stale() => debug!("{}", e),
                Err(e) => return Err(e),
            }
        }
        Ok(progress)
    }

    /// Remove the last typed digit
    pub async fn remove_pin_digit(&self, device_id: &str) -> Result<usize> {
        self.ensure_active()?;
        self.shared.machine.remove_digit(device_id).await
    }

    /// Approve an icon confirmation or transfer authorization
    pub async fn allow(&self, device_id: &str) -> Result<()> {
        self.ensure_active()?;
        self.shared.machine.allow(device_id).await?;
        self.shared.lock_connections().establish(device_id);
        Ok(())
    }

    /// Cancel the pairing with a device
    pub async fn cancel_authentication(&self, device_id: &str) -> Result<UserOperation> {
        self.ensure_active()?;
        self.shared.machine.cancel(device_id).await
    }

    /// Submit a PIN for verification
    pub async fn verify_auth_info(&self, info: VerifyAuthInfo) -> Result<VerifyOutcome> {
        self.ensure_active()?;
        match self.shared.machine.context_for_token(&info.pin_token).await {
            Some((device_id, generation)) => {
                self.run_verify(&PendingVerify {
                    device_id,
                    generation,
                    info,
                })
                .await
            }
            None => self.service.verify_auth_info(&info).await,
        }
    }

    /// Apply a user decision to the pairing with a device
    pub async fn set_user_operation(&self, device_id: &str, operation: UserOperation) -> Result<()> {
        match operation {
            UserOperation::AllowAuth => self.allow(device_id).await,
            operation => {
                self.ensure_active()?;
                self.shared.machine.cancel_with(device_id, operation).await?;
                Ok(())
            }
        }
    }

    /// This device's identity as registered, or `None` once the manager is released
    pub fn get_local_device_info_sync(&self) -> Option<DeviceInfo> {
        if self.is_released() {
            return None;
        }
        Some(self.local_device.clone())
    }

    /// Ask the service for this device's identity
    pub async fn get_local_device_info(&self) -> Result<DeviceInfo> {
        self.ensure_active()?;
        self.service.local_device_info().await
    }

    /// Trusted devices, or `None` once the manager is released
    pub fn get_trusted_device_list_sync(&self) -> Option<Vec<DeviceInfo>> {
        if self.is_released() {
            return None;
        }

        let registry = self.shared.read_registry();
        let mut devices: Vec<DeviceInfo> = registry
            .trusted_devices()
            .map(|d| d.info.clone())
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Some(devices)
    }

    /// Drop trust for a device
    pub async fn unauthenticate_device(&self, device_id: &str) -> Result<()> {
        self.ensure_active()?;
        self.service.unauthenticate_device(device_id).await?;
        self.shared.write_registry().untrust(device_id)?;
        self.shared
            .lock_connections()
            .disconnect(device_id, "unauthenticated");
        info!("Unauthenticated {}", device_id);
        Ok(())
    }

    /// Register an event handler; `false` if it was already registered
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> bool {
        self.shared.dispatcher.on(kind, handler)
    }

    /// Remove one handler, or all handlers for the event when `None`
    pub fn off(&self, kind: EventKind, handler: Option<&EventHandler>) -> usize {
        self.shared.dispatcher.off(kind, handler)
    }

    /// Take the receiver for pairing prompts and state changes
    ///
    /// Returns `None` after the first call.
    pub fn auth_events(&self) -> Option<mpsc::UnboundedReceiver<AuthEvent>> {
        self.auth_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Take the receiver for connection events
    pub fn connection_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.connection_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Pairing state with a device
    pub async fn auth_state(&self, device_id: &str) -> AuthState {
        self.shared.machine.state(device_id).await
    }

    /// Number of PIN digits typed for a device
    pub async fn pin_len(&self, device_id: &str) -> usize {
        self.shared.machine.pin_len(device_id).await
    }

    /// Number of pairing attempts in flight
    pub async fn active_pairings(&self) -> usize {
        self.shared.machine.active_count().await
    }

    /// Connection status of a device
    pub fn connection_status(&self, device_id: &str) -> ConnectionStatus {
        self.shared.lock_connections().status(device_id)
    }

    /// Ids of the active discovery sessions
    pub fn active_discoveries(&self) -> Vec<u16> {
        self.shared.lock_discovery().active_sessions()
    }

    /// Registry entry for a device
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.shared.read_registry().get_device(device_id).cloned()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Cancel pending pairings, stop discovery and unregister from the service
    pub async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(pump) = self.take_pump() {
            pump.abort();
        }

        let cancelled = self.shared.machine.cancel_all().await;
        let stopped = self.shared.lock_discovery().stop_all();
        for subscribe_id in &stopped {
            if let Err(e) = self.service.stop_discovery(*subscribe_id).await {
                debug!("Could not stop discovery {}: {}", subscribe_id, e);
            }
        }
        self.shared.dispatcher.clear();

        info!(
            "Releasing device manager for {} ({} pairings cancelled, {} discoveries stopped)",
            self.package_name,
            cancelled,
            stopped.len()
        );
        self.service.unregister(&self.package_name).await
    }

    async fn run_verify(&self, pending: &PendingVerify) -> Result<VerifyOutcome> {
        let result = self.service.verify_auth_info(&pending.info).await;
        let outcome = self
            .shared
            .machine
            .finish_verify(&pending.device_id, pending.generation, result)
            .await?;

        self.shared.lock_connections().establish(&pending.device_id);
        Ok(outcome)
    }

    fn poller(&self) -> AuthParamPoller {
        AuthParamPoller::new(
            self.service.clone(),
            self.shared.machine.clone(),
            self.config.poll_interval,
        )
    }

    fn take_pump(&self) -> Option<JoinHandle<()>> {
        self.pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_released() {
            Err(ProtocolError::ServiceUnavailable(format!(
                "device manager for {} was released",
                self.package_name
            )))
        } else {
            Ok(())
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackHub;

    fn phone() -> DeviceInfo {
        DeviceInfo::new("11:22:33", "Phone", 14)
    }

    #[tokio::test]
    async fn test_empty_package_name_rejected() {
        let hub = LoopbackHub::new();
        let result = DeviceManager::create("", hub.endpoint(phone()), ManagerConfig::default()).await;
        assert!(matches!(result, Err(ProtocolError::InvalidValue(_))));
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_session() {
        let hub = LoopbackHub::new();
        let manager = DeviceManager::create("com.example.app", hub.endpoint(phone()), ManagerConfig::default())
            .await
            .unwrap();

        hub.kill();
        let result = manager.start_device_discovery(SubscribeInfo::new(8)).await;
        assert!(matches!(result, Err(ProtocolError::ServiceUnavailable(_))));
        assert!(manager.active_discoveries().is_empty());
    }

    #[tokio::test]
    async fn test_released_manager() {
        let hub = LoopbackHub::new();
        let manager = DeviceManager::create("com.example.app", hub.endpoint(phone()), ManagerConfig::default())
            .await
            .unwrap();

        assert_eq!(manager.get_trusted_device_list_sync(), Some(vec![]));
        manager.release().await.unwrap();
        manager.release().await.unwrap();

        assert!(manager.get_trusted_device_list_sync().is_none());
        assert!(matches!(
            manager.start_device_discovery(SubscribeInfo::new(1)).await,
            Err(ProtocolError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_local_device_info() {
        let hub = LoopbackHub::new();
        let manager = DeviceManager::create("com.example.app", hub.endpoint(phone()), ManagerConfig::default())
            .await
            .unwrap();

        assert_eq!(manager.get_local_device_info_sync(), Some(phone()));
        assert_eq!(manager.get_local_device_info().await.unwrap(), phone());

        manager.release().await.unwrap();
        assert!(manager.get_local_device_info_sync().is_none());
        assert!(matches!(
            manager.get_local_device_info().await,
            Err(ProtocolError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_event_receivers_taken_once() {
        let hub = LoopbackHub::new();
        let manager = DeviceManager::create("com.example.app", hub.endpoint(phone()), ManagerConfig::default())
            .await
            .unwrap();

        assert!(manager.auth_events().is_some());
        assert!(manager.auth_events().is_none());
        assert!(manager.connection_events().is_some());
        assert!(manager.connection_events().is_none());
    }

    #[tokio::test]
    async fn test_next_subscribe_id_is_fresh() {
        let hub = LoopbackHub::new();
        let manager = DeviceManager::create("com.example.app", hub.endpoint(phone()), ManagerConfig::default())
            .await
            .unwrap();

        let first = manager.next_subscribe_id().unwrap();
        manager.start_device_discovery(SubscribeInfo::new(first)).await.unwrap();
        let second = manager.next_subscribe_id().unwrap();
        assert_ne!(first, second);
    }
}
