//! Authentication State Machine
//!
//! Drives every pairing attempt of the local endpoint, one [`AuthContext`]
//! per peer device.
//!
//! ## Rules
//!
//! - At most one context exists per device. A second attempt while one is in
//!   flight fails with [`ProtocolError::AlreadyPairing`].
//! - Terminal transitions remove the context. [`AuthStateMachine::state`]
//!   reports [`AuthState::Idle`] for devices without one.
//! - User cancellation and countdown expiry report a [`UserOperation`] to the
//!   service exactly once, before any local state is torn down.
//! - Every asynchronous completion carries the generation of the context it
//!   was issued for. A mismatch yields [`ProtocolError::StaleCallback`] and
//!   the result is not applied.
//!
//! ## Locking
//!
//! Contexts live behind a `tokio::sync::Mutex`. The registry lock is only
//! taken while the contexts lock is held, never the other way round.

use super::context::{AuthContext, PendingVerify, PinProgress};
use super::events::AuthEvent;
use super::params::{
    AuthDirection, AuthFlow, AuthParam, AuthRequest, PinToken, UserOperation, VerifyAuthInfo,
    VerifyOutcome,
};
use super::state::{AuthRole, AuthState};
use crate::device::DeviceRegistry;
use crate::transport::DeviceService;
use crate::{DeviceInfo, ProtocolError, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Default countdown for PIN display, PIN entry and approval (30 seconds)
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry effect of a finished attempt
#[derive(Debug, Clone, Copy)]
enum TrustChange {
    Trust,
    Reject,
    Revert,
}

/// Pairing state machine shared by the device manager and its timer tasks
#[derive(Clone)]
pub struct AuthStateMachine {
    contexts: Arc<Mutex<HashMap<String, AuthContext>>>,
    registry: Arc<RwLock<DeviceRegistry>>,
    service: Arc<dyn DeviceService>,
    event_tx: mpsc::UnboundedSender<AuthEvent>,
    next_generation: Arc<AtomicU64>,
    timeout: Duration,
}

impl AuthStateMachine {
    /// Create a state machine and the receiver for its UI events
    pub fn new(
        registry: Arc<RwLock<DeviceRegistry>>,
        service: Arc<dyn DeviceService>,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<AuthEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let machine = Self {
            contexts: Arc::new(Mutex::new(HashMap::new())),
            registry,
            service,
            event_tx,
            next_generation: Arc::new(AtomicU64::new(1)),
            timeout,
        };

        (machine, event_rx)
    }

    /// Start an initiator attempt, returning its generation
    pub async fn begin_request(&self, device: &DeviceInfo, request: &AuthRequest) -> Result<u64> {
        let device_id = device.device_id.clone();
        let mut contexts = self.contexts.lock().await;

        if contexts.contains_key(&device_id) {
            warn!("Pairing with {} already in progress", device_id);
            return Err(ProtocolError::AlreadyPairing(device_id));
        }

        let generation = self.next_generation();
        let mut context = AuthContext::new(device.clone(), AuthRole::Initiator, generation);
        context.auth_type = request.auth_type;
        context.extra_info = request.extra_info.clone();
        context.state = AuthState::Requesting;

        self.write_registry().begin_authentication(device);
        contexts.insert(device_id.clone(), context);

        info!(
            "Requesting authentication with {} ({})",
            device.device_name, device_id
        );
        self.emit_state(&device_id, AuthState::Requesting);
        Ok(generation)
    }

    /// Abort an initiator attempt whose request failed
    ///
    /// No retry happens; a new attempt needs a fresh `begin_request`.
    pub async fn fail_request(
        &self,
        device_id: &str,
        generation: u64,
        error: &ProtocolError,
    ) -> Result<()> {
        let mut contexts = self.contexts.lock().await;
        let context = take_current(&mut contexts, device_id, generation, "authentication result")?;

        warn!("Authentication with {} failed: {}", device_id, error);
        let (state, change) = match error {
            ProtocolError::AuthRejected(_) => (AuthState::Cancelled, TrustChange::Reject),
            ProtocolError::AuthTimeout(_) => (AuthState::TimedOut, TrustChange::Revert),
            _ => (AuthState::Cancelled, TrustChange::Revert),
        };

        self.emit(AuthEvent::Failed {
            device_id: device_id.to_string(),
            reason: error.to_string(),
        });
        self.finish(context, state, change);
        Ok(())
    }

    /// Apply an authentication param fetched from the service
    ///
    /// Creates a joiner context for incoming requests and attaches main-side
    /// params to the initiator's pending request. Arms the countdown.
    pub async fn apply_param(&self, param: &AuthParam) -> Result<AuthFlow> {
        let flow = param.flow();
        let device_id = param.peer.device_id.clone();
        let mut contexts = self.contexts.lock().await;

        let context = match contexts.entry(device_id.clone()) {
            Entry::Occupied(entry) => {
                let context = entry.into_mut();
                if context.pin_token.as_ref() == Some(&param.pin_token) {
                    debug!("Authentication param for {} already applied", device_id);
                    return Ok(context.flow.unwrap_or(flow));
                }

                let attaches = context.role == AuthRole::Initiator
                    && context.state == AuthState::Requesting
                    && param.direction == AuthDirection::Main;
                if !attaches {
                    warn!(
                        "Ignoring authentication param for {}: pairing already in progress",
                        device_id
                    );
                    return Err(ProtocolError::AlreadyPairing(device_id));
                }
                context
            }
            Entry::Vacant(entry) => {
                if param.direction == AuthDirection::Main {
                    return Err(ProtocolError::StaleCallback(format!(
                        "main-side param for {} without a pending request",
                        device_id
                    )));
                }

                info!(
                    "Incoming authentication request from {} ({})",
                    param.peer.device_name, device_id
                );
                self.write_registry().begin_authentication(&param.peer);
                let generation = self.next_generation();
                entry.insert(AuthContext::new(param.peer.clone(), AuthRole::Joiner, generation))
            }
        };

        context.auth_type = param.auth_type;
        context.pin_token = Some(param.pin_token.clone());
        context.flow = Some(flow);
        context.extra_info.target_pkg_name = param.package_name.clone();
        context.extra_info.app_name = param.app_name.clone();
        context.extra_info.app_description = param.app_description.clone();
        context.extra_info.business = param.business;
        context.state = flow.initial_state();
        self.arm_countdown(context);

        let prompt = match flow {
            AuthFlow::MainPin => AuthEvent::ShowPin {
                device_id: device_id.clone(),
                pin: param.pin_code.clone(),
            },
            AuthFlow::JoinPin => AuthEvent::RequestPin {
                device_id: device_id.clone(),
                device_name: param.peer.device_name.clone(),
            },
            AuthFlow::JoinAuthImage | AuthFlow::JoinAuthorize => AuthEvent::RequestApproval {
                device_id: device_id.clone(),
                device_name: param.peer.device_name.clone(),
                flow,
                app_name: param.app_name.clone(),
                app_icon: param.app_icon.clone(),
            },
        };

        debug!("Authentication with {} uses {:?}", device_id, flow);
        self.emit_state(&device_id, context.state);
        self.emit(prompt);
        Ok(flow)
    }

    /// Type one PIN digit
    ///
    /// The sixth digit moves the context to [`AuthState::Confirming`] and
    /// returns [`PinProgress::Complete`]. Any digit after that is ignored.
    pub async fn enter_digit(&self, device_id: &str, digit: char) -> Result<PinProgress> {
        let mut contexts = self.contexts.lock().await;
        let context = contexts
            .get_mut(device_id)
            .ok_or_else(|| no_pairing(device_id))?;

        match context.state {
            AuthState::PinEntry => {}
            AuthState::Confirming if context.flow == Some(AuthFlow::JoinPin) => {
                debug!("PIN for {} already complete, ignoring input", device_id);
                return Ok(PinProgress::Ignored);
            }
            other => {
                return Err(ProtocolError::InvalidValue(format!(
                    "pairing with {} is not expecting a PIN ({})",
                    device_id, other
                )));
            }
        }

        if !context.pin.push(digit)? {
            return Ok(PinProgress::Ignored);
        }
        if !context.pin.is_full() {
            return Ok(PinProgress::Partial(context.pin.len()));
        }

        let pin_code = context
            .pin
            .to_pin()
            .ok_or_else(|| ProtocolError::InvalidValue("incomplete PIN".to_string()))?;
        let pin_token = context
            .pin_token
            .clone()
            .ok_or_else(|| ProtocolError::InvalidValue(format!("no pin token for {}", device_id)))?;

        context.state = AuthState::Confirming;
        context.stop_countdown();
        let pending = PendingVerify {
            device_id: device_id.to_string(),
            generation: context.generation,
            info: VerifyAuthInfo {
                auth_type: context.auth_type,
                pin_token,
                pin_code,
            },
        };

        debug!("PIN for {} complete, verifying", device_id);
        self.emit_state(device_id, AuthState::Confirming);
        Ok(PinProgress::Complete(pending))
    }

    /// Remove the last typed digit, returning how many remain
    pub async fn remove_digit(&self, device_id: &str) -> Result<usize> {
        let mut contexts = self.contexts.lock().await;
        let context = contexts
            .get_mut(device_id)
            .ok_or_else(|| no_pairing(device_id))?;

        if context.state == AuthState::PinEntry {
            context.pin.pop();
        }
        Ok(context.pin.len())
    }

    /// Approve an icon confirmation or transfer authorization
    ///
    /// The peer becomes trusted only once the service accepts the approval.
    /// A round the peer already closed fails the attempt without trust.
    pub async fn allow(&self, device_id: &str) -> Result<()> {
        let generation = {
            let mut contexts = self.contexts.lock().await;
            let context = contexts
                .get_mut(device_id)
                .ok_or_else(|| no_pairing(device_id))?;

            if context.state != AuthState::Authorizing {
                return Err(ProtocolError::InvalidValue(format!(
                    "pairing with {} is not awaiting approval ({})",
                    device_id, context.state
                )));
            }

            context.state = AuthState::Confirming;
            context.stop_countdown();
            self.emit_state(device_id, AuthState::Confirming);
            context.generation
        };

        let result = self
            .service
            .set_user_operation(device_id, UserOperation::AllowAuth)
            .await;

        let mut contexts = self.contexts.lock().await;
        let context = take_current(&mut contexts, device_id, generation, "approval result")?;

        match result {
            Ok(()) => {
                self.finish(context, AuthState::Authenticated, TrustChange::Trust);
                Ok(())
            }
            Err(e) => {
                warn!("Approval for {} was not accepted: {}", device_id, e);
                self.emit(AuthEvent::Failed {
                    device_id: device_id.to_string(),
                    reason: e.to_string(),
                });
                self.finish(context, AuthState::Cancelled, TrustChange::Revert);
                Err(e)
            }
        }
    }

    /// Cancel the attempt with the operation matching its current flow
    pub async fn cancel(&self, device_id: &str) -> Result<UserOperation> {
        let operation = {
            let contexts = self.contexts.lock().await;
            contexts
                .get(device_id)
                .map(|context| context.cancel_operation())
                .ok_or_else(|| no_pairing(device_id))?
        };
        self.cancel_with(device_id, operation).await
    }

    /// Cancel the attempt, reporting `operation` to the service first
    pub async fn cancel_with(&self, device_id: &str, operation: UserOperation) -> Result<UserOperation> {
        let mut contexts = self.contexts.lock().await;
        if !contexts.contains_key(device_id) {
            return Err(no_pairing(device_id));
        }

        if let Err(e) = self.service.set_user_operation(device_id, operation).await {
            warn!(
                "Failed to report {:?} for {}: {}",
                operation, device_id, e
            );
        }

        let Some(context) = contexts.remove(device_id) else {
            return Err(no_pairing(device_id));
        };

        info!("Pairing with {} cancelled ({:?})", device_id, operation);
        if operation == UserOperation::AuthConfirmTimeout {
            self.finish(context, AuthState::TimedOut, TrustChange::Revert);
        } else {
            self.finish(context, AuthState::Cancelled, TrustChange::Reject);
        }
        Ok(operation)
    }

    /// Complete an attempt once the service reports success
    pub async fn complete(&self, device_id: &str, generation: u64) -> Result<()> {
        let mut contexts = self.contexts.lock().await;
        let context = take_current(&mut contexts, device_id, generation, "authentication success")?;
        self.finish(context, AuthState::Authenticated, TrustChange::Trust);
        Ok(())
    }

    /// Apply the result of a PIN verification
    pub async fn finish_verify(
        &self,
        device_id: &str,
        generation: u64,
        result: Result<VerifyOutcome>,
    ) -> Result<VerifyOutcome> {
        let mut contexts = self.contexts.lock().await;
        let context = take_current(&mut contexts, device_id, generation, "verify result")?;

        match result {
            Ok(outcome) => {
                self.finish(context, AuthState::Authenticated, TrustChange::Trust);
                Ok(outcome)
            }
            Err(e) => {
                warn!("PIN verification for {} failed: {}", device_id, e);
                self.emit(AuthEvent::Failed {
                    device_id: device_id.to_string(),
                    reason: e.to_string(),
                });
                let change = match e {
                    ProtocolError::AuthRejected(_) => TrustChange::Reject,
                    _ => TrustChange::Revert,
                };
                self.finish(context, AuthState::Cancelled, change);
                Err(e)
            }
        }
    }

    /// Tear down the attempt with a device without reporting a user operation
    pub async fn abort_device(&self, device_id: &str) -> bool {
        let mut contexts = self.contexts.lock().await;
        match contexts.remove(device_id) {
            Some(context) => {
                info!("Aborting pairing with {}", device_id);
                self.finish(context, AuthState::Idle, TrustChange::Revert);
                true
            }
            None => false,
        }
    }

    /// Tear down every attempt and revert provisional trust
    pub async fn abort_all(&self) -> usize {
        let mut contexts = self.contexts.lock().await;
        let aborted = contexts.len();
        for (_, context) in contexts.drain() {
            self.finish(context, AuthState::Idle, TrustChange::Revert);
        }
        self.write_registry().revert_provisional();

        if aborted > 0 {
            info!("Aborted {} pairing attempts", aborted);
        }
        aborted
    }

    /// Cancel every attempt, reporting a user operation for each
    pub async fn cancel_all(&self) -> usize {
        let device_ids: Vec<String> = self.contexts.lock().await.keys().cloned().collect();

        let mut cancelled = 0;
        for device_id in device_ids {
            if self.cancel(&device_id).await.is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Current state of the attempt with a device
    pub async fn state(&self, device_id: &str) -> AuthState {
        self.contexts
            .lock()
            .await
            .get(device_id)
            .map(|context| context.state)
            .unwrap_or(AuthState::Idle)
    }

    /// Number of PIN digits typed for a device
    pub async fn pin_len(&self, device_id: &str) -> usize {
        self.contexts
            .lock()
            .await
            .get(device_id)
            .map(|context| context.pin.len())
            .unwrap_or(0)
    }

    /// Device and generation of the context holding `token`
    pub async fn context_for_token(&self, token: &PinToken) -> Option<(String, u64)> {
        self.contexts
            .lock()
            .await
            .values()
            .find(|context| context.pin_token.as_ref() == Some(token))
            .map(|context| (context.device_id().to_string(), context.generation))
    }

    /// Number of attempts in flight
    pub async fn active_count(&self) -> usize {
        self.contexts.lock().await.len()
    }

    async fn expire(&self, device_id: &str, generation: u64) {
        let mut contexts = self.contexts.lock().await;
        let current = contexts
            .get(device_id)
            .is_some_and(|context| context.generation == generation && context.state.has_countdown());
        if !current {
            debug!("Discarding stale countdown for {}", device_id);
            return;
        }

        warn!("Pairing with {} timed out", device_id);
        if let Err(e) = self
            .service
            .set_user_operation(device_id, UserOperation::AuthConfirmTimeout)
            .await
        {
            warn!("Failed to report timeout for {}: {}", device_id, e);
        }

        if let Some(mut context) = contexts.remove(device_id) {
            // Running on the timer task itself, so release the handle instead of aborting.
            drop(context.timer.take());
            self.emit(AuthEvent::TimedOut {
                device_id: device_id.to_string(),
            });
            self.finish(context, AuthState::TimedOut, TrustChange::Revert);
        }
    }

    fn arm_countdown(&self, context: &mut AuthContext) {
        context.stop_countdown();

        let machine = self.clone();
        let device_id = context.device_id().to_string();
        let generation = context.generation;
        let timeout = self.timeout;

        context.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            machine.expire(&device_id, generation).await;
        }));
    }

    fn finish(&self, mut context: AuthContext, state: AuthState, change: TrustChange) {
        context.stop_countdown();
        context.pin.clear();
        context.state = state;

        let device_id = context.device_id().to_string();
        {
            let mut registry = self.write_registry();
            match change {
                TrustChange::Trust => {
                    if let Err(e) = registry.complete_authentication(&device_id) {
                        warn!("Could not record trust for {}: {}", device_id, e);
                    }
                }
                TrustChange::Reject => registry.mark_rejected(&device_id),
                TrustChange::Revert => registry.revert_authentication(&device_id),
            }
        }

        info!("Pairing with {} finished: {}", device_id, state);
        self.emit_state(&device_id, state);
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, DeviceRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_state(&self, device_id: &str, state: AuthState) {
        self.emit(AuthEvent::StateChanged {
            device_id: device_id.to_string(),
            state,
        });
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Remove the context for `device_id` if it still belongs to `generation`
fn take_current(
    contexts: &mut HashMap<String, AuthContext>,
    device_id: &str,
    generation: u64,
    what: &str,
) -> Result<AuthContext> {
    let current = contexts
        .get(device_id)
        .is_some_and(|context| context.generation == generation);

    if current {
        if let Some(context) = contexts.remove(device_id) {
            return Ok(context);
        }
    }

    debug!(
        "Dropping {} for {} (generation {})",
        what, device_id, generation
    );
    Err(ProtocolError::StaleCallback(format!(
        "{} for {} (generation {})",
        what, device_id, generation
    )))
}

fn no_pairing(device_id: &str) -> ProtocolError {
    ProtocolError::InvalidValue(format!("no pairing in progress with {}", device_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackHub;

    fn printer() -> DeviceInfo {
        DeviceInfo::new("AA:BB:CC", "Printer-42", 7)
    }

    fn phone() -> DeviceInfo {
        DeviceInfo::new("11:22:33", "Phone", 14)
    }

    fn join_param(token: &str) -> AuthParam {
        AuthParam::new(phone(), AuthDirection::Join, PinToken::new(token))
    }

    fn machine(hub: &LoopbackHub) -> (AuthStateMachine, mpsc::UnboundedReceiver<AuthEvent>) {
        let service = hub.endpoint(printer());
        let registry = Arc::new(RwLock::new(DeviceRegistry::in_memory()));
        AuthStateMachine::new(registry, service, AUTH_TIMEOUT)
    }

    #[tokio::test]
    async fn test_second_request_is_rejected() {
        let hub = LoopbackHub::new();
        let (machine, _events) = machine(&hub);

        let generation = machine
            .begin_request(&phone(), &AuthRequest::pin("Gallery"))
            .await
            .unwrap();
        assert!(generation > 0);

        let second = machine.begin_request(&phone(), &AuthRequest::pin("Gallery")).await;
        assert!(matches!(second, Err(ProtocolError::AlreadyPairing(_))));
        assert_eq!(machine.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_param_creates_context() {
        let hub = LoopbackHub::new();
        let (machine, mut events) = machine(&hub);

        let flow = machine.apply_param(&join_param("tok-1")).await.unwrap();
        assert_eq!(flow, AuthFlow::JoinPin);
        assert_eq!(machine.state("11:22:33").await, AuthState::PinEntry);

        let first = events.recv().await.unwrap();
        assert_eq!(first.state(), Some(AuthState::PinEntry));
        assert!(events.recv().await.unwrap().is_prompt());

        // Re-applying the same round is a no-op
        assert_eq!(machine.apply_param(&join_param("tok-1")).await.unwrap(), AuthFlow::JoinPin);
        let other = machine.apply_param(&join_param("tok-2")).await;
        assert!(matches!(other, Err(ProtocolError::AlreadyPairing(_))));
    }

    #[tokio::test]
    async fn test_main_param_without_request_is_stale() {
        let hub = LoopbackHub::new();
        let (machine, _events) = machine(&hub);

        let param = AuthParam::new(phone(), AuthDirection::Main, PinToken::new("tok-1"));
        let err = machine.apply_param(&param).await.unwrap_err();
        assert!(err.is_stale());
    }

    #[tokio::test]
    async fn test_six_digits_complete_once() {
        let hub = LoopbackHub::new();
        let (machine, _events) = machine(&hub);
        machine.apply_param(&join_param("tok-1")).await.unwrap();

        let mut completions = 0;
        for digit in "1234567".chars() {
            match machine.enter_digit("11:22:33", digit).await.unwrap() {
                PinProgress::Complete(pending) => {
                    completions += 1;
                    assert_eq!(pending.info.pin_code.as_str(), "123456");
                    assert_eq!(pending.info.pin_token.as_str(), "tok-1");
                }
                PinProgress::Partial(n) => assert!(n < 6),
                PinProgress::Ignored => {}
            }
        }

        assert_eq!(completions, 1);
        assert_eq!(machine.state("11:22:33").await, AuthState::Confirming);
    }

    #[tokio::test]
    async fn test_backspace_and_invalid_digit() {
        let hub = LoopbackHub::new();
        let (machine, _events) = machine(&hub);
        machine.apply_param(&join_param("tok-1")).await.unwrap();

        machine.enter_digit("11:22:33", '4').await.unwrap();
        machine.enter_digit("11:22:33", '2').await.unwrap();
        assert_eq!(machine.remove_digit("11:22:33").await.unwrap(), 1);
        assert!(machine.enter_digit("11:22:33", '#').await.is_err());
        assert_eq!(machine.pin_len("11:22:33").await, 1);
    }

    #[tokio::test]
    async fn test_stale_generation_is_dropped() {
        let hub = LoopbackHub::new();
        let (machine, _events) = machine(&hub);

        let old = machine
            .begin_request(&phone(), &AuthRequest::pin("Gallery"))
            .await
            .unwrap();
        machine.abort_device("11:22:33").await;
        let new = machine
            .begin_request(&phone(), &AuthRequest::pin("Gallery"))
            .await
            .unwrap();

        let err = machine.complete("11:22:33", old).await.unwrap_err();
        assert!(err.is_stale());
        assert_eq!(machine.state("11:22:33").await, AuthState::Requesting);

        machine.complete("11:22:33", new).await.unwrap();
        assert_eq!(machine.state("11:22:33").await, AuthState::Idle);
    }

    #[tokio::test]
    async fn test_complete_trusts_device() {
        let hub = LoopbackHub::new();
        let registry = Arc::new(RwLock::new(DeviceRegistry::in_memory()));
        let (machine, _events) =
            AuthStateMachine::new(registry.clone(), hub.endpoint(printer()), AUTH_TIMEOUT);

        let generation = machine
            .begin_request(&phone(), &AuthRequest::pin("Gallery"))
            .await
            .unwrap();
        machine.complete("11:22:33", generation).await.unwrap();

        let registry = registry.read().unwrap();
        assert!(registry.get_device("11:22:33").unwrap().is_trusted());
    }

    #[tokio::test]
    async fn test_cancel_reports_before_teardown() {
        let hub = LoopbackHub::new();
        let (machine, _events) = machine(&hub);
        machine.apply_param(&join_param("tok-1")).await.unwrap();

        for digit in "123".chars() {
            machine.enter_digit("11:22:33", digit).await.unwrap();
        }

        let operation = machine.cancel("11:22:33").await.unwrap();
        assert_eq!(operation, UserOperation::CancelPinCodeInput);
        assert_eq!(
            hub.user_operations("AA:BB:CC"),
            vec![("11:22:33".to_string(), UserOperation::CancelPinCodeInput)]
        );
        assert_eq!(machine.pin_len("11:22:33").await, 0);
        assert_eq!(machine.state("11:22:33").await, AuthState::Idle);
    }

    #[tokio::test]
    async fn test_allow_without_round_does_not_trust() {
        let hub = LoopbackHub::new();
        let registry = Arc::new(RwLock::new(DeviceRegistry::in_memory()));
        let (machine, mut events) =
            AuthStateMachine::new(registry.clone(), hub.endpoint(printer()), AUTH_TIMEOUT);

        let param = join_param("tok-1").with_request(&AuthRequest::pin("Photos").with_business(0));
        assert_eq!(machine.apply_param(&param).await.unwrap(), AuthFlow::JoinAuthorize);

        let err = machine.allow("11:22:33").await.unwrap_err();
        assert!(matches!(err, ProtocolError::AuthRejected(_)));
        assert_eq!(machine.state("11:22:33").await, AuthState::Idle);
        assert!(!registry
            .read()
            .unwrap()
            .get_device("11:22:33")
            .is_some_and(|d| d.is_trusted()));

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(event, AuthEvent::Failed { .. });
        }
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_reports_timeout_once() {
        let hub = LoopbackHub::new();
        let (machine, mut events) = machine(&hub);
        machine.apply_param(&join_param("tok-1")).await.unwrap();

        tokio::time::sleep(AUTH_TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(
            hub.user_operations("AA:BB:CC"),
            vec![("11:22:33".to_string(), UserOperation::AuthConfirmTimeout)]
        );
        assert_eq!(machine.active_count().await, 0);

        let mut timed_out = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, AuthEvent::TimedOut { .. }) {
                timed_out += 1;
            }
        }
        assert_eq!(timed_out, 1);
    }

    #[tokio::test]
    async fn test_abort_all_reverts_provisional() {
        let hub = LoopbackHub::new();
        let registry = Arc::new(RwLock::new(DeviceRegistry::in_memory()));
        let (machine, _events) =
            AuthStateMachine::new(registry.clone(), hub.endpoint(printer()), AUTH_TIMEOUT);

        machine.apply_param(&join_param("tok-1")).await.unwrap();
        machine
            .begin_request(
                &DeviceInfo::new("DD:EE:FF", "Tablet", 17),
                &AuthRequest::pin("Gallery"),
            )
            .await
            .unwrap();

        assert_eq!(machine.abort_all().await, 2);
        assert!(hub.user_operations("AA:BB:CC").is_empty());
        let registry = registry.read().unwrap();
        assert_eq!(registry.trusted_count(), 0);
        assert!(registry.devices().all(|d| !d.trust_state().is_provisional()));
    }
}
