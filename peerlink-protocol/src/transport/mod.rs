//! Device Service Transport
//!
//! The distributed device service does the actual radio and network work.
//! This module defines the seam the rest of the crate talks to, plus an
//! in-process implementation for tests and local simulation.
//!
//! ## Call Model
//!
//! - Requests are `async fn` calls on [`DeviceService`] returning [`Result`].
//! - Unsolicited notifications arrive on the channel handed out by
//!   [`DeviceService::register`] as [`ServiceEvent`] values.

pub mod loopback;

pub use loopback::{LoopbackHub, LoopbackService};

use crate::discovery::SubscribeInfo;
use crate::pairing::{AuthOutcome, AuthParam, AuthRequest, UserOperation, VerifyAuthInfo, VerifyOutcome};
use crate::{DeviceInfo, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Notifications pushed by the device service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A subscription observed a peer
    DeviceFound {
        subscribe_id: u16,
        device: DeviceInfo,
    },

    /// A subscription hit a transport failure
    DiscoveryFailed { subscribe_id: u16, reason: i32 },

    /// A peer's connection state changed; see `DeviceStateAction` for codes
    DeviceStateChanged { action: i32, device: DeviceInfo },

    /// Opaque payload for the application layer
    FaCall(String),

    /// The service process died; every handle it issued is invalid
    ServiceDied,
}

/// Operations offered by the distributed device service
#[async_trait]
pub trait DeviceService: Send + Sync {
    /// Register a package and obtain its notification channel
    async fn register(&self, package_name: &str) -> Result<mpsc::UnboundedReceiver<ServiceEvent>>;

    /// Drop a package registration
    async fn unregister(&self, package_name: &str) -> Result<()>;

    /// Identity of the device this service runs on
    async fn local_device_info(&self) -> Result<DeviceInfo>;

    /// Start a discovery subscription
    async fn start_discovery(&self, info: &SubscribeInfo) -> Result<()>;

    /// Stop a discovery subscription
    async fn stop_discovery(&self, subscribe_id: u16) -> Result<()>;

    /// Authenticate a peer, resolving once the round concludes
    async fn authenticate_device(
        &self,
        device: &DeviceInfo,
        request: &AuthRequest,
    ) -> Result<AuthOutcome>;

    /// Drop the service-side trust relationship with a peer
    async fn unauthenticate_device(&self, device_id: &str) -> Result<()>;

    /// Fetch the next pending authentication param; `None` means nothing new
    async fn get_authentication_param(&self) -> Result<Option<AuthParam>>;

    /// Submit a typed PIN
    async fn verify_auth_info(&self, info: &VerifyAuthInfo) -> Result<VerifyOutcome>;

    /// Report the user's decision for the round with `device_id`
    async fn set_user_operation(&self, device_id: &str, operation: UserOperation) -> Result<()>;
}
