//! Per-device authentication context

use super::params::{
    AuthExtraInfo, AuthFlow, PinCode, PinToken, UserOperation, VerifyAuthInfo, AUTH_TYPE_PIN,
    PIN_LENGTH,
};
use super::state::{AuthRole, AuthState};
use crate::{DeviceInfo, ProtocolError, Result};
use std::fmt;
use tokio::task::JoinHandle;

/// Digits typed so far, at most [`PIN_LENGTH`]
#[derive(Default, Clone)]
pub struct PinBuffer {
    digits: String,
}

impl PinBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one digit; returns `false` once the buffer is full
    pub fn push(&mut self, digit: char) -> Result<bool> {
        if !digit.is_ascii_digit() {
            return Err(ProtocolError::InvalidValue(format!(
                "'{}' is not a PIN digit",
                digit.escape_default()
            )));
        }
        if self.is_full() {
            return Ok(false);
        }
        self.digits.push(digit);
        Ok(true)
    }

    /// Remove the last digit
    pub fn pop(&mut self) -> bool {
        self.digits.pop().is_some()
    }

    pub fn clear(&mut self) {
        self.digits.clear();
    }

    pub fn len(&self) -> usize {
        self.digits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.digits.len() == PIN_LENGTH
    }

    /// The collected PIN, once all digits are in
    pub fn to_pin(&self) -> Option<PinCode> {
        if self.is_full() {
            PinCode::new(self.digits.clone()).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PinBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PinBuffer({} digits)", self.digits.len())
    }
}

/// A verification the caller must now submit to the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVerify {
    pub device_id: String,
    pub generation: u64,
    pub info: VerifyAuthInfo,
}

/// Result of typing one PIN digit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinProgress {
    /// Digits collected so far
    Partial(usize),
    /// The sixth digit arrived; verify exactly once
    Complete(PendingVerify),
    /// Input arrived after the PIN was already complete
    Ignored,
}

/// State of one pairing attempt
///
/// Owned by the state machine and dropped when the attempt concludes.
#[derive(Debug)]
pub struct AuthContext {
    pub device: DeviceInfo,
    pub auth_type: i32,
    pub role: AuthRole,
    pub pin: PinBuffer,
    pub pin_token: Option<PinToken>,
    pub extra_info: AuthExtraInfo,
    pub flow: Option<AuthFlow>,
    pub state: AuthState,
    pub generation: u64,
    pub(crate) timer: Option<JoinHandle<()>>,
}

impl AuthContext {
    pub fn new(device: DeviceInfo, role: AuthRole, generation: u64) -> Self {
        Self {
            device,
            auth_type: AUTH_TYPE_PIN,
            role,
            pin: PinBuffer::new(),
            pin_token: None,
            extra_info: AuthExtraInfo::default(),
            flow: None,
            state: AuthState::Idle,
            generation,
            timer: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }

    /// Operation to report when the user cancels in the current state
    pub fn cancel_operation(&self) -> UserOperation {
        self.flow
            .map(|flow| flow.cancel_operation())
            .unwrap_or(UserOperation::CancelAuth)
    }

    /// Stop the countdown; `false` if none was running
    pub(crate) fn stop_countdown(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for AuthContext {
    fn drop(&mut self) {
        self.pin.clear();
        self.stop_countdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_buffer_limits() {
        let mut buffer = PinBuffer::new();
        for digit in "123456".chars() {
            assert!(buffer.push(digit).unwrap());
        }
        assert!(buffer.is_full());
        assert!(!buffer.push('7').unwrap());
        assert_eq!(buffer.to_pin().unwrap().as_str(), "123456");

        assert!(buffer.pop());
        assert_eq!(buffer.len(), 5);
        assert!(buffer.to_pin().is_none());
    }

    #[test]
    fn test_pin_buffer_rejects_non_digits() {
        let mut buffer = PinBuffer::new();
        assert!(buffer.push('x').is_err());
        assert!(buffer.push('٣').is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pin_buffer_debug_redacts() {
        let mut buffer = PinBuffer::new();
        buffer.push('9').unwrap();
        assert_eq!(format!("{:?}", buffer), "PinBuffer(1 digits)");
    }

    #[test]
    fn test_cancel_operation_by_flow() {
        let device = DeviceInfo::new("AA:BB:CC", "Printer-42", 7);
        let mut context = AuthContext::new(device, AuthRole::Initiator, 1);
        assert_eq!(context.cancel_operation(), UserOperation::CancelAuth);

        context.flow = Some(AuthFlow::MainPin);
        assert_eq!(context.cancel_operation(), UserOperation::CancelPinCodeDisplay);
    }
}
