//! Peer Discovery and Pairing
//!
//! This library implements the device side of a peer discovery and PIN based
//! pairing handshake: subscribe sessions that find nearby devices, an
//! authentication state machine that drives PIN display, PIN entry and
//! approval prompts, and a registry that tracks which peers are trusted.
//!
//! The platform device service sits behind the [`DeviceService`] trait. The
//! in-process [`LoopbackHub`] implements it for tests and simulations.

pub mod connection;
pub mod device;
pub mod discovery;
pub mod events;
pub mod manager;
pub mod pairing;
pub mod transport;

mod error;
pub use device::{Device, DeviceInfo, DeviceRegistry, TrustState};
pub use error::{ProtocolError, Result};
pub use events::{DeviceManagerEvent, EventDispatcher, EventHandler, EventKind};
pub use manager::{DeviceManager, ManagerConfig};
pub use transport::{DeviceService, LoopbackHub, ServiceEvent};
