//! Authentication Parameter Polling
//!
//! The service does not push authentication params. A poller queries
//! `get_authentication_param` on a fixed interval and feeds whatever arrives
//! into the state machine. `None` means nothing changed yet; errors are
//! logged and polling continues until the handle is stopped or dropped.

use super::machine::AuthStateMachine;
use super::params::AuthParam;
use crate::transport::DeviceService;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Default polling interval (1 second)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fetches authentication params and applies them to a state machine
pub struct AuthParamPoller {
    service: Arc<dyn DeviceService>,
    machine: AuthStateMachine,
    interval: Duration,
}

impl AuthParamPoller {
    pub fn new(service: Arc<dyn DeviceService>, machine: AuthStateMachine, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };

        Self {
            service,
            machine,
            interval,
        }
    }

    /// Fetch one param and apply it
    pub async fn poll_once(&self) -> Result<Option<AuthParam>> {
        let Some(param) = self.service.get_authentication_param().await? else {
            return Ok(None);
        };

        self.machine.apply_param(&param).await?;
        Ok(Some(param))
    }

    /// Poll in a background task until the returned handle stops it
    pub fn spawn(self) -> PollerHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.poll_once().await {
                        Ok(Some(param)) => {
                            debug!("Applied authentication param from {}", param.peer.device_id);
                        }
                        Ok(None) => {}
                        Err(e) if e.is_stale() => debug!("{}", e),
                        Err(e) => warn!("Authentication param poll failed: {}", e),
                    },
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Authentication param poller stopped");
        });

        PollerHandle { cancel_tx, task }
    }
}

/// Handle to a running poller; dropping it also stops the poller
pub struct PollerHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the poller to stop and wait for it
    pub async fn stop(self) {
        let _ = self.cancel_tx.send(true);
        let _ = self.task.await;
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRegistry;
    use crate::pairing::{AuthRequest, AuthState, AUTH_TIMEOUT};
    use crate::transport::LoopbackHub;
    use crate::DeviceInfo;
    use std::sync::RwLock;

    #[tokio::test]
    async fn test_poller_applies_incoming_request() {
        let hub = LoopbackHub::new();
        let phone = hub.endpoint(DeviceInfo::new("11:22:33", "Phone", 14));
        let printer = hub.endpoint(DeviceInfo::new("AA:BB:CC", "Printer-42", 7));

        let registry = Arc::new(RwLock::new(DeviceRegistry::in_memory()));
        let (machine, _events) = AuthStateMachine::new(registry, printer.clone(), AUTH_TIMEOUT);
        let poller = AuthParamPoller::new(printer, machine.clone(), Duration::from_millis(10));

        // Nothing pending yet
        assert!(poller.poll_once().await.unwrap().is_none());

        let target = DeviceInfo::new("AA:BB:CC", "Printer-42", 7);
        let request = tokio::spawn(async move {
            phone
                .authenticate_device(&target, &AuthRequest::pin("Gallery"))
                .await
        });

        let handle = poller.spawn();
        while machine.state("11:22:33").await != AuthState::PinEntry {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.is_running());
        handle.stop().await;

        machine.cancel("11:22:33").await.unwrap();
        assert!(request.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_poller() {
        let hub = LoopbackHub::new();
        let service = hub.endpoint(DeviceInfo::new("AA:BB:CC", "Printer-42", 7));
        let registry = Arc::new(RwLock::new(DeviceRegistry::in_memory()));
        let (machine, _events) = AuthStateMachine::new(registry, service.clone(), AUTH_TIMEOUT);

        let handle = AuthParamPoller::new(service, machine, Duration::ZERO).spawn();
        drop(handle);
        tokio::task::yield_now().await;
    }
}
