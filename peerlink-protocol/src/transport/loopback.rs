//! Loopback Device Service
//!
//! An in-process [`DeviceService`] linking several local endpoints. Each
//! endpoint stands for one device. Discovery reports every other endpoint,
//! and authentication runs a pairing round between two endpoints:
//!
//! 1. The initiator's `authenticate_device` opens a round with a fresh PIN
//!    and pin token, queues one [`AuthParam`] per side and waits.
//! 2. The initiator fetches its main-side half (direction 1), the joiner its
//!    join-side half (direction 0).
//! 3. `verify_auth_info` with the right PIN, or an `AllowAuth` user operation,
//!    completes the round. Both sides become trusted and receive an online
//!    state change.
//! 4. Any cancel-class user operation or a wrong PIN aborts the round.
//!
//! PINs come from `ring`'s system random source unless a fixed PIN is set.

use super::{DeviceService, ServiceEvent};
use crate::connection::DeviceStateAction;
use crate::discovery::SubscribeInfo;
use crate::pairing::{
    AuthDirection, AuthOutcome, AuthParam, AuthRequest, PinCode, PinToken, UserOperation,
    VerifyAuthInfo, VerifyOutcome,
};
use crate::{DeviceInfo, ProtocolError, Result};
use async_trait::async_trait;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Trust level reported for a verified PIN
const VERIFY_LEVEL: i32 = 1;

/// Pin token length in random bytes
const TOKEN_BYTES: usize = 8;

/// One local device attached to the hub
struct Endpoint {
    info: DeviceInfo,
    events: Option<mpsc::UnboundedSender<ServiceEvent>>,
    subscriptions: HashSet<u16>,
    pending_params: VecDeque<AuthParam>,
    trusted: HashSet<String>,
    user_operations: Vec<(String, UserOperation)>,
    verify_calls: usize,
}

impl Endpoint {
    fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            events: None,
            subscriptions: HashSet::new(),
            pending_params: VecDeque::new(),
            trusted: HashSet::new(),
            user_operations: Vec::new(),
            verify_calls: 0,
        }
    }

    fn send(&self, event: ServiceEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// A pairing round between two endpoints
struct PairingRound {
    initiator: String,
    joiner: String,
    pin: PinCode,
    reply: oneshot::Sender<Result<AuthOutcome>>,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<String, Endpoint>,
    rounds: HashMap<PinToken, PairingRound>,
    fixed_pin: Option<PinCode>,
    fixed_token: Option<String>,
    dead: bool,
}

impl HubState {
    fn endpoint(&self, device_id: &str) -> Result<&Endpoint> {
        self.endpoints
            .get(device_id)
            .ok_or_else(|| ProtocolError::TransportFailure(format!("{} is not reachable", device_id)))
    }

    fn endpoint_mut(&mut self, device_id: &str) -> Result<&mut Endpoint> {
        self.endpoints
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::TransportFailure(format!("{} is not reachable", device_id)))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.dead {
            Err(ProtocolError::ServiceUnavailable(
                "device service died".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn round_between(&self, a: &str, b: &str) -> Option<PinToken> {
        self.rounds
            .iter()
            .find(|(_, round)| {
                (round.initiator == a && round.joiner == b) || (round.initiator == b && round.joiner == a)
            })
            .map(|(token, _)| token.clone())
    }

    /// Complete a round: trust both sides and announce them online
    fn complete_round(&mut self, token: &PinToken) {
        let Some(round) = self.rounds.remove(token) else {
            return;
        };

        let (initiator_info, joiner_info) = match (
            self.endpoints.get(&round.initiator),
            self.endpoints.get(&round.joiner),
        ) {
            (Some(i), Some(j)) => (i.info.clone(), j.info.clone()),
            _ => {
                let _ = round.reply.send(Err(ProtocolError::TransportFailure(
                    "peer left during pairing".to_string(),
                )));
                return;
            }
        };

        for (owner, peer) in [(&round.initiator, &joiner_info), (&round.joiner, &initiator_info)] {
            if let Some(endpoint) = self.endpoints.get_mut(owner) {
                endpoint.trusted.insert(peer.device_id.clone());
                endpoint.send(ServiceEvent::DeviceStateChanged {
                    action: DeviceStateAction::Online.code(),
                    device: peer.clone(),
                });
            }
        }

        info!(
            "Loopback pairing {} <-> {} complete",
            round.initiator, round.joiner
        );
        let _ = round.reply.send(Ok(AuthOutcome {
            device_id: round.joiner.clone(),
            pin_token: token.clone(),
        }));
    }

    /// Abort a round, failing the initiator's pending request with `error`
    fn abort_round(&mut self, token: &PinToken, error: ProtocolError) {
        let Some(round) = self.rounds.remove(token) else {
            return;
        };

        for owner in [&round.initiator, &round.joiner] {
            if let Some(endpoint) = self.endpoints.get_mut(owner) {
                endpoint.pending_params.retain(|p| &p.pin_token != token);
            }
        }

        debug!(
            "Loopback pairing {} <-> {} aborted: {}",
            round.initiator, round.joiner, error
        );
        let _ = round.reply.send(Err(error));
    }
}

/// In-process hub connecting loopback endpoints
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
    rng: Arc<SystemRandom>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            rng: Arc::new(SystemRandom::new()),
        }
    }

    /// Use this PIN for every round instead of a random one
    pub fn fixed_pin(self, pin: &str) -> Result<Self> {
        let pin = PinCode::new(pin)?;
        self.lock().fixed_pin = Some(pin);
        Ok(self)
    }

    /// Use this pin token for every round instead of a random one
    pub fn fixed_token(self, token: &str) -> Self {
        self.lock().fixed_token = Some(token.to_string());
        self
    }

    /// Attach a device to the hub
    pub fn endpoint(&self, info: DeviceInfo) -> Arc<LoopbackService> {
        let device_id = info.device_id.clone();
        self.lock()
            .endpoints
            .entry(device_id.clone())
            .or_insert_with(|| Endpoint::new(info));

        Arc::new(LoopbackService {
            hub: self.clone(),
            device_id,
        })
    }

    /// Simulate a crash of the service on every endpoint
    pub fn kill(&self) {
        let mut state = self.lock();
        state.dead = true;

        let tokens: Vec<PinToken> = state.rounds.keys().cloned().collect();
        for token in tokens {
            state.abort_round(
                &token,
                ProtocolError::ServiceUnavailable("device service died".to_string()),
            );
        }
        for endpoint in state.endpoints.values_mut() {
            endpoint.subscriptions.clear();
            endpoint.pending_params.clear();
            endpoint.send(ServiceEvent::ServiceDied);
        }
        warn!("Loopback device service killed");
    }

    /// Bring the service back after [`LoopbackHub::kill`]
    pub fn revive(&self) {
        self.lock().dead = false;
    }

    /// Report each device as offline to the other
    pub fn disconnect(&self, a: &str, b: &str) {
        let mut state = self.lock();
        if let Some(token) = state.round_between(a, b) {
            state.abort_round(
                &token,
                ProtocolError::TransportFailure("peer went offline".to_string()),
            );
        }

        let infos = (
            state.endpoints.get(a).map(|e| e.info.clone()),
            state.endpoints.get(b).map(|e| e.info.clone()),
        );
        if let (Some(a_info), Some(b_info)) = infos {
            for (owner, peer) in [(a, b_info), (b, a_info)] {
                if let Some(endpoint) = state.endpoints.get(owner) {
                    endpoint.send(ServiceEvent::DeviceStateChanged {
                        action: DeviceStateAction::Offline.code(),
                        device: peer,
                    });
                }
            }
        }
    }

    /// Report a discovery failure on one of an endpoint's subscriptions
    pub fn fail_discovery(&self, device_id: &str, subscribe_id: u16, reason: i32) {
        let state = self.lock();
        if let Some(endpoint) = state.endpoints.get(device_id) {
            endpoint.send(ServiceEvent::DiscoveryFailed {
                subscribe_id,
                reason,
            });
        }
    }

    /// Deliver an opaque application payload to an endpoint
    pub fn fa_call(&self, device_id: &str, payload: impl Into<String>) {
        let state = self.lock();
        if let Some(endpoint) = state.endpoints.get(device_id) {
            endpoint.send(ServiceEvent::FaCall(payload.into()));
        }
    }

    /// User operations an endpoint reported, as `(peer, operation)`
    pub fn user_operations(&self, device_id: &str) -> Vec<(String, UserOperation)> {
        self.lock()
            .endpoints
            .get(device_id)
            .map(|e| e.user_operations.clone())
            .unwrap_or_default()
    }

    /// Number of `verify_auth_info` calls an endpoint made
    pub fn verify_calls(&self, device_id: &str) -> usize {
        self.lock()
            .endpoints
            .get(device_id)
            .map_or(0, |e| e.verify_calls)
    }

    /// Number of rounds in flight
    pub fn active_rounds(&self) -> usize {
        self.lock().rounds.len()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generate_pin(&self) -> Result<PinCode> {
        let mut bytes = [0u8; 4];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| ProtocolError::TransportFailure("random source unavailable".to_string()))?;
        PinCode::new(format!("{:06}", u32::from_be_bytes(bytes) % 1_000_000))
    }

    fn generate_token(&self) -> Result<PinToken> {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| ProtocolError::TransportFailure("random source unavailable".to_string()))?;
        Ok(PinToken::new(hex::encode(bytes)))
    }
}

/// The hub as seen by one endpoint
pub struct LoopbackService {
    hub: LoopbackHub,
    device_id: String,
}

impl LoopbackService {
    /// Device this endpoint stands for
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[async_trait]
impl DeviceService for LoopbackService {
    async fn register(&self, package_name: &str) -> Result<mpsc::UnboundedReceiver<ServiceEvent>> {
        let mut state = self.hub.lock();
        state.ensure_alive()?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.endpoint_mut(&self.device_id)?.events = Some(tx);
        debug!("{} registered {}", self.device_id, package_name);
        Ok(rx)
    }

    async fn unregister(&self, package_name: &str) -> Result<()> {
        let mut state = self.hub.lock();
        let endpoint = state.endpoint_mut(&self.device_id)?;
        endpoint.events = None;
        endpoint.subscriptions.clear();
        debug!("{} unregistered {}", self.device_id, package_name);
        Ok(())
    }

    async fn local_device_info(&self) -> Result<DeviceInfo> {
        let state = self.hub.lock();
        state.ensure_alive()?;
        Ok(state.endpoint(&self.device_id)?.info.clone())
    }

    async fn start_discovery(&self, info: &SubscribeInfo) -> Result<()> {
        let mut state = self.hub.lock();
        state.ensure_alive()?;

        let endpoint = state.endpoint_mut(&self.device_id)?;
        if !endpoint.subscriptions.insert(info.subscribe_id) {
            return Err(ProtocolError::InvalidConfig(format!(
                "subscribe id {} is already active",
                info.subscribe_id
            )));
        }

        let state = &*state;
        let endpoint = state.endpoint(&self.device_id)?;
        let mut peers: Vec<&Endpoint> = state
            .endpoints
            .values()
            .filter(|e| e.info.device_id != self.device_id)
            .collect();
        peers.sort_by(|a, b| a.info.device_id.cmp(&b.info.device_id));

        for peer in peers {
            endpoint.send(ServiceEvent::DeviceFound {
                subscribe_id: info.subscribe_id,
                device: peer.info.clone(),
            });
        }
        Ok(())
    }

    async fn stop_discovery(&self, subscribe_id: u16) -> Result<()> {
        let mut state = self.hub.lock();
        state.endpoint_mut(&self.device_id)?.subscriptions.remove(&subscribe_id);
        Ok(())
    }

    async fn authenticate_device(
        &self,
        device: &DeviceInfo,
        request: &AuthRequest,
    ) -> Result<AuthOutcome> {
        let reply = {
            let mut state = self.hub.lock();
            state.ensure_alive()?;

            let own_info = state.endpoint(&self.device_id)?.info.clone();
            let peer_info = state.endpoint(&device.device_id)?.info.clone();
            if state.round_between(&self.device_id, &device.device_id).is_some() {
                return Err(ProtocolError::AlreadyPairing(device.device_id.clone()));
            }

            let pin = match &state.fixed_pin {
                Some(pin) => pin.clone(),
                None => self.hub.generate_pin()?,
            };
            let token = match &state.fixed_token {
                Some(token) => PinToken::new(token.clone()),
                None => self.hub.generate_token()?,
            };

            let main = AuthParam::new(peer_info, AuthDirection::Main, token.clone())
                .with_pin(pin.clone());
            let join = AuthParam::new(own_info, AuthDirection::Join, token.clone())
                .with_request(request)
                .with_pin(pin.clone());

            state.endpoint_mut(&self.device_id)?.pending_params.push_back(main);
            state.endpoint_mut(&device.device_id)?.pending_params.push_back(join);

            let (reply_tx, reply_rx) = oneshot::channel();
            state.rounds.insert(
                token,
                PairingRound {
                    initiator: self.device_id.clone(),
                    joiner: device.device_id.clone(),
                    pin,
                    reply: reply_tx,
                },
            );
            info!(
                "Loopback pairing {} -> {} opened",
                self.device_id, device.device_id
            );
            reply_rx
        };

        reply.await.map_err(|_| {
            ProtocolError::ServiceUnavailable("pairing round dropped".to_string())
        })?
    }

    async fn unauthenticate_device(&self, device_id: &str) -> Result<()> {
        let mut state = self.hub.lock();
        state.ensure_alive()?;

        let own_info = state.endpoint(&self.device_id)?.info.clone();
        let removed = state.endpoint_mut(&self.device_id)?.trusted.remove(device_id);
        if !removed {
            return Err(ProtocolError::DeviceNotFound(device_id.to_string()));
        }

        if let Some(peer) = state.endpoints.get_mut(device_id) {
            peer.trusted.remove(&self.device_id);
            peer.send(ServiceEvent::DeviceStateChanged {
                action: DeviceStateAction::Offline.code(),
                device: own_info,
            });
        }
        Ok(())
    }

    async fn get_authentication_param(&self) -> Result<Option<AuthParam>> {
        let mut state = self.hub.lock();
        state.ensure_alive()?;
        Ok(state.endpoint_mut(&self.device_id)?.pending_params.pop_front())
    }

    async fn verify_auth_info(&self, info: &VerifyAuthInfo) -> Result<VerifyOutcome> {
        let mut state = self.hub.lock();
        state.ensure_alive()?;
        state.endpoint_mut(&self.device_id)?.verify_calls += 1;

        let Some(round) = state.rounds.get(&info.pin_token) else {
            return Err(ProtocolError::AuthRejected(format!(
                "unknown pin token {}",
                info.pin_token
            )));
        };
        if round.joiner != self.device_id {
            return Err(ProtocolError::AuthRejected(
                "pin token belongs to another device".to_string(),
            ));
        }

        if round.pin != info.pin_code {
            let error = ProtocolError::AuthRejected("PIN mismatch".to_string());
            state.abort_round(&info.pin_token, ProtocolError::AuthRejected("PIN mismatch".to_string()));
            return Err(error);
        }

        let initiator = round.initiator.clone();
        state.complete_round(&info.pin_token);
        Ok(VerifyOutcome {
            device_id: initiator,
            level: VERIFY_LEVEL,
        })
    }

    async fn set_user_operation(&self, device_id: &str, operation: UserOperation) -> Result<()> {
        let mut state = self.hub.lock();
        state.ensure_alive()?;
        state
            .endpoint_mut(&self.device_id)?
            .user_operations
            .push((device_id.to_string(), operation));

        let Some(token) = state.round_between(&self.device_id, device_id) else {
            debug!("No loopback round with {} for {:?}", device_id, operation);
            // An approval needs a live round
            if operation == UserOperation::AllowAuth {
                return Err(ProtocolError::AuthRejected(format!(
                    "no open pairing round with {}",
                    device_id
                )));
            }
            return Ok(());
        };

        match operation {
            UserOperation::AllowAuth => state.complete_round(&token),
            UserOperation::AuthConfirmTimeout => state.abort_round(
                &token,
                ProtocolError::AuthTimeout(format!("{} did not answer", device_id)),
            ),
            _ => state.abort_round(
                &token,
                ProtocolError::AuthRejected(format!("cancelled by {}", self.device_id)),
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer() -> DeviceInfo {
        DeviceInfo::new("AA:BB:CC", "Printer-42", 7)
    }

    fn phone() -> DeviceInfo {
        DeviceInfo::new("11:22:33", "Phone", 14)
    }

    #[tokio::test]
    async fn test_discovery_reports_other_endpoints() {
        let hub = LoopbackHub::new();
        let phone = hub.endpoint(phone());
        let _printer = hub.endpoint(printer());

        let mut events = phone.register("com.example.app").await.unwrap();
        phone.start_discovery(&SubscribeInfo::new(3)).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            ServiceEvent::DeviceFound {
                subscribe_id: 3,
                device: printer()
            }
        );
        assert!(events.try_recv().is_err());
        assert!(phone.start_discovery(&SubscribeInfo::new(3)).await.is_err());
    }

    #[tokio::test]
    async fn test_random_pin_and_token() {
        let hub = LoopbackHub::new();
        let pin = hub.generate_pin().unwrap();
        assert_eq!(pin.as_str().len(), 6);

        let token = hub.generate_token().unwrap();
        assert_eq!(token.as_str().len(), TOKEN_BYTES * 2);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_round_with_correct_pin() {
        let hub = LoopbackHub::new()
            .fixed_pin("123456")
            .unwrap()
            .fixed_token("tok-1");
        let phone = hub.endpoint(phone());
        let printer_service = hub.endpoint(printer());

        let initiator = phone.clone();
        let request = tokio::spawn(async move {
            initiator
                .authenticate_device(&printer(), &AuthRequest::pin("Gallery"))
                .await
        });
        tokio::task::yield_now().await;

        let main = phone.get_authentication_param().await.unwrap().unwrap();
        assert_eq!(main.direction, AuthDirection::Main);
        assert_eq!(main.peer.device_id, "AA:BB:CC");

        let join = printer_service.get_authentication_param().await.unwrap().unwrap();
        assert_eq!(join.direction, AuthDirection::Join);
        assert_eq!(join.pin_token.as_str(), "tok-1");
        assert_eq!(join.pin_code.as_ref().unwrap().as_str(), "123456");
        assert_eq!(join.app_name.as_deref(), Some("Gallery"));

        let outcome = printer_service
            .verify_auth_info(&VerifyAuthInfo {
                auth_type: 1,
                pin_token: join.pin_token.clone(),
                pin_code: PinCode::new("123456").unwrap(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.device_id, "11:22:33");

        let result = request.await.unwrap().unwrap();
        assert_eq!(result.device_id, "AA:BB:CC");
        assert_eq!(hub.active_rounds(), 0);
        assert_eq!(hub.verify_calls("AA:BB:CC"), 1);
    }

    #[tokio::test]
    async fn test_wrong_pin_rejects_both_sides() {
        let hub = LoopbackHub::new().fixed_pin("123456").unwrap();
        let phone = hub.endpoint(phone());
        let printer_service = hub.endpoint(printer());

        let initiator = phone.clone();
        let request = tokio::spawn(async move {
            initiator
                .authenticate_device(&printer(), &AuthRequest::pin("Gallery"))
                .await
        });
        tokio::task::yield_now().await;

        let join = printer_service.get_authentication_param().await.unwrap().unwrap();
        let result = printer_service
            .verify_auth_info(&VerifyAuthInfo {
                auth_type: 1,
                pin_token: join.pin_token,
                pin_code: PinCode::new("654321").unwrap(),
            })
            .await;

        assert!(matches!(result, Err(ProtocolError::AuthRejected(_))));
        assert!(matches!(
            request.await.unwrap(),
            Err(ProtocolError::AuthRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_allow_without_round_is_rejected() {
        let hub = LoopbackHub::new();
        let phone = hub.endpoint(phone());
        let printer_service = hub.endpoint(printer());

        let initiator = phone.clone();
        let request = tokio::spawn(async move {
            initiator
                .authenticate_device(&printer(), &AuthRequest::pin("Gallery").with_business(0))
                .await
        });
        tokio::task::yield_now().await;

        phone
            .set_user_operation("AA:BB:CC", UserOperation::CancelAuth)
            .await
            .unwrap();
        assert!(matches!(
            request.await.unwrap(),
            Err(ProtocolError::AuthRejected(_))
        ));

        let result = printer_service
            .set_user_operation("11:22:33", UserOperation::AllowAuth)
            .await;
        assert!(matches!(result, Err(ProtocolError::AuthRejected(_))));
        assert!(printer_service
            .set_user_operation("11:22:33", UserOperation::AuthConfirmTimeout)
            .await
            .is_ok());
        assert_eq!(hub.active_rounds(), 0);
    }

    #[tokio::test]
    async fn test_local_device_info() {
        let hub = LoopbackHub::new();
        let service = hub.endpoint(phone());
        assert_eq!(service.local_device_info().await.unwrap(), phone());

        hub.kill();
        assert!(matches!(
            service.local_device_info().await,
            Err(ProtocolError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails() {
        let hub = LoopbackHub::new();
        let phone = hub.endpoint(phone());

        let result = phone
            .authenticate_device(&printer(), &AuthRequest::pin("Gallery"))
            .await;
        assert!(matches!(result, Err(ProtocolError::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_kill_notifies_and_fails_calls() {
        let hub = LoopbackHub::new();
        let phone = hub.endpoint(phone());
        let mut events = phone.register("com.example.app").await.unwrap();

        hub.kill();
        assert_eq!(events.recv().await.unwrap(), ServiceEvent::ServiceDied);
        assert!(matches!(
            phone.get_authentication_param().await,
            Err(ProtocolError::ServiceUnavailable(_))
        ));

        hub.revive();
        assert!(phone.get_authentication_param().await.unwrap().is_none());
    }
}
