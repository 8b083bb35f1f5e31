//! Device Connections
//!
//! Once a peer is authenticated it gets a logical connection. The connection
//! follows the device state changes the service reports and is torn down when
//! the peer goes offline or the service dies.

pub mod events;
pub mod manager;

pub use events::ConnectionEvent;
pub use manager::{
    Connection, ConnectionManager, ConnectionStatus, DeviceStateAction, StateChangeEffect,
};
