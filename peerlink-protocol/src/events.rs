//! Application Event Dispatch
//!
//! The subscription surface applications use to follow discovery and
//! connection activity. Event names form a closed set:
//!
//! | Name                | Payload                          |
//! |---------------------|----------------------------------|
//! | `deviceFound`       | subscribe id, device             |
//! | `deviceStateChange` | action code, device              |
//! | `discoverFail`      | subscribe id, reason code        |
//! | `serviceDie`        | none                             |
//! | `dmFaCallback`      | opaque string                    |
//!
//! Handlers are identified by `Arc` pointer identity. Registering the same
//! handler twice is a no-op, and handlers for one event run in registration
//! order.

use crate::{DeviceInfo, ProtocolError};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Names of the events an application can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceFound,
    DeviceStateChange,
    DiscoverFail,
    ServiceDie,
    DmFaCallback,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::DeviceFound,
        EventKind::DeviceStateChange,
        EventKind::DiscoverFail,
        EventKind::ServiceDie,
        EventKind::DmFaCallback,
    ];

    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DeviceFound => "deviceFound",
            EventKind::DeviceStateChange => "deviceStateChange",
            EventKind::DiscoverFail => "discoverFail",
            EventKind::ServiceDie => "serviceDie",
            EventKind::DmFaCallback => "dmFaCallback",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProtocolError;

    /// # Examples
    ///
    /// ```
    /// use peerlink_protocol::EventKind;
    ///
    /// let kind: EventKind = "deviceFound".parse().unwrap();
    /// assert_eq!(kind, EventKind::DeviceFound);
    /// assert!("deviceLost".parse::<EventKind>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::InvalidValue(format!("unknown event '{}'", s)))
    }
}

/// Event delivered to application handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceManagerEvent {
    DeviceFound { subscribe_id: u16, device: DeviceInfo },
    DeviceStateChange { action: i32, device: DeviceInfo },
    DiscoverFail { subscribe_id: u16, reason: i32 },
    ServiceDie,
    DmFaCallback(String),
}

impl DeviceManagerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DeviceManagerEvent::DeviceFound { .. } => EventKind::DeviceFound,
            DeviceManagerEvent::DeviceStateChange { .. } => EventKind::DeviceStateChange,
            DeviceManagerEvent::DiscoverFail { .. } => EventKind::DiscoverFail,
            DeviceManagerEvent::ServiceDie => EventKind::ServiceDie,
            DeviceManagerEvent::DmFaCallback(_) => EventKind::DmFaCallback,
        }
    }
}

/// Application callback
pub type EventHandler = Arc<dyn Fn(&DeviceManagerEvent) + Send + Sync>;

/// Registry of handlers per event kind
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Mutex<HashMap<EventKind, Vec<EventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns `false` if it was already registered
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let list = handlers.entry(kind).or_default();

        if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        list.push(handler);
        debug!("Registered {} handler ({} total)", kind, list.len());
        true
    }

    /// Remove one handler, or every handler for the event when `None`
    ///
    /// Returns how many handlers were removed.
    pub fn off(&self, kind: EventKind, handler: Option<&EventHandler>) -> usize {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&kind) else {
            return 0;
        };

        let before = list.len();
        match handler {
            Some(handler) => list.retain(|h| !Arc::ptr_eq(h, handler)),
            None => list.clear(),
        }
        before - list.len()
    }

    /// Deliver an event to its handlers in registration order
    ///
    /// Handlers run outside the lock, so they may register or remove handlers.
    pub fn dispatch(&self, event: &DeviceManagerEvent) -> usize {
        let snapshot: Vec<EventHandler> = {
            let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers.get(&event.kind()).cloned().unwrap_or_default()
        };

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    /// Number of handlers registered for an event
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Remove every handler
    pub fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> EventHandler {
        let log = log.clone();
        let tag = tag.to_string();
        Arc::new(move |event: &DeviceManagerEvent| {
            log.lock().unwrap().push(format!("{}:{}", tag, event.kind()));
        })
    }

    #[test]
    fn test_event_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_registration_is_idempotent() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder(&log, "a");

        assert!(dispatcher.on(EventKind::ServiceDie, handler.clone()));
        assert!(!dispatcher.on(EventKind::ServiceDie, handler.clone()));
        assert_eq!(dispatcher.dispatch(&DeviceManagerEvent::ServiceDie), 1);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.on(EventKind::DmFaCallback, recorder(&log, "first"));
        dispatcher.on(EventKind::DmFaCallback, recorder(&log, "second"));
        dispatcher.on(EventKind::ServiceDie, recorder(&log, "other"));

        dispatcher.dispatch(&DeviceManagerEvent::DmFaCallback("{}".to_string()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:dmFaCallback".to_string(), "second:dmFaCallback".to_string()]
        );
    }

    #[test]
    fn test_off_one_and_all() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&log, "a");
        let b = recorder(&log, "b");
        dispatcher.on(EventKind::DeviceFound, a.clone());
        dispatcher.on(EventKind::DeviceFound, b.clone());

        assert_eq!(dispatcher.off(EventKind::DeviceFound, Some(&a)), 1);
        assert_eq!(dispatcher.handler_count(EventKind::DeviceFound), 1);

        dispatcher.on(EventKind::DeviceFound, a);
        assert_eq!(dispatcher.off(EventKind::DeviceFound, None), 2);
        assert_eq!(dispatcher.off(EventKind::DiscoverFail, None), 0);
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inner = dispatcher.clone();
        let handler: EventHandler = Arc::new(move |_event: &DeviceManagerEvent| {
            inner.off(EventKind::ServiceDie, None);
        });
        dispatcher.on(EventKind::ServiceDie, handler);

        assert_eq!(dispatcher.dispatch(&DeviceManagerEvent::ServiceDie), 1);
        assert_eq!(dispatcher.dispatch(&DeviceManagerEvent::ServiceDie), 0);
    }
}
