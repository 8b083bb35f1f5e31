//! Authentication Parameters
//!
//! Values exchanged with the device service during a pairing round:
//!
//! - [`AuthRequest`]: what the initiator hands to `authenticate_device`
//! - [`AuthParam`]: what each side receives from `get_authentication_param`
//! - [`VerifyAuthInfo`]: the PIN the joiner submits for verification
//! - [`UserOperation`]: the user's decision, reported back to the service

use super::state::AuthState;
use crate::{DeviceInfo, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of digits in a pairing PIN
pub const PIN_LENGTH: usize = 6;

/// Authentication type for PIN based pairing
pub const AUTH_TYPE_PIN: i32 = 1;

/// A six digit pairing PIN
///
/// The value never appears in `Debug` output.
///
/// # Examples
///
/// ```
/// use peerlink_protocol::pairing::PinCode;
///
/// let pin = PinCode::new("123456").unwrap();
/// assert_eq!(pin.as_str(), "123456");
/// assert_eq!(format!("{:?}", pin), "PinCode(******)");
/// assert!(PinCode::new("12345").is_err());
/// assert!(PinCode::new("12a456").is_err());
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct PinCode(String);

impl PinCode {
    pub fn new(pin: impl Into<String>) -> Result<Self> {
        let pin = pin.into();
        if pin.len() != PIN_LENGTH || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::InvalidValue(format!(
                "PIN must be exactly {} ASCII digits",
                PIN_LENGTH
            )));
        }
        Ok(Self(pin))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PinCode(******)")
    }
}

/// Opaque credential correlating a displayed PIN with its verification round
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinToken(String);

impl PinToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the round displays the PIN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthDirection {
    /// Joining side, enters the PIN or approves
    Join = 0,
    /// Main side, displays the PIN
    Main = 1,
}

impl TryFrom<i32> for AuthDirection {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(AuthDirection::Join),
            1 => Ok(AuthDirection::Main),
            other => Err(ProtocolError::InvalidValue(format!(
                "auth direction {} is not supported",
                other
            ))),
        }
    }
}

/// Business metadata carried alongside an authentication request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthExtraInfo {
    #[serde(default)]
    pub target_pkg_name: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub app_description: Option<String>,
    /// Business classification; only `0` (transfer authorization) has a meaning
    #[serde(default)]
    pub business: Option<i32>,
    #[serde(default)]
    pub display_owner: Option<i32>,
}

/// Initiator's authentication request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    pub auth_type: i32,
    pub app_icon: Option<Vec<u8>>,
    pub app_thumbnail: Option<Vec<u8>>,
    pub extra_info: AuthExtraInfo,
}

impl AuthRequest {
    /// A PIN request on behalf of an application
    pub fn pin(app_name: impl Into<String>) -> Self {
        Self {
            auth_type: AUTH_TYPE_PIN,
            app_icon: None,
            app_thumbnail: None,
            extra_info: AuthExtraInfo {
                app_name: Some(app_name.into()),
                ..AuthExtraInfo::default()
            },
        }
    }

    pub fn with_business(mut self, business: i32) -> Self {
        self.extra_info.business = Some(business);
        self
    }

    pub fn with_icon(mut self, icon: Vec<u8>) -> Self {
        self.app_icon = Some(icon);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.extra_info.app_description = Some(description.into());
        self
    }
}

/// Which UI flow an [`AuthParam`] asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlow {
    /// Show the PIN, wait for the peer to type it
    MainPin,
    /// Approve or reject a request that carries an application icon
    JoinAuthImage,
    /// Approve or reject a transfer authorization
    JoinAuthorize,
    /// Type the PIN shown on the peer
    JoinPin,
}

impl AuthFlow {
    /// State the context enters when this flow starts
    pub fn initial_state(&self) -> AuthState {
        match self {
            AuthFlow::MainPin => AuthState::PinDisplay,
            AuthFlow::JoinAuthImage | AuthFlow::JoinAuthorize => AuthState::Authorizing,
            AuthFlow::JoinPin => AuthState::PinEntry,
        }
    }

    /// Flows resolved by an allow/reject decision instead of a PIN
    pub fn is_approval(&self) -> bool {
        matches!(self, AuthFlow::JoinAuthImage | AuthFlow::JoinAuthorize)
    }

    /// Operation reported when the user cancels this flow
    pub fn cancel_operation(&self) -> UserOperation {
        match self {
            AuthFlow::MainPin => UserOperation::CancelPinCodeDisplay,
            AuthFlow::JoinPin => UserOperation::CancelPinCodeInput,
            AuthFlow::JoinAuthImage | AuthFlow::JoinAuthorize => UserOperation::CancelAuth,
        }
    }
}

/// One side's view of a pairing round, as returned by `get_authentication_param`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthParam {
    /// The device on the other end of the round
    pub peer: DeviceInfo,
    pub auth_type: i32,
    pub direction: AuthDirection,
    pub pin_token: PinToken,
    pub pin_code: Option<PinCode>,
    pub package_name: Option<String>,
    pub app_name: Option<String>,
    pub app_description: Option<String>,
    pub business: Option<i32>,
    pub app_icon: Option<Vec<u8>>,
    pub app_thumbnail: Option<Vec<u8>>,
}

impl AuthParam {
    /// Classify the round into a UI flow
    ///
    /// # Examples
    ///
    /// ```
    /// use peerlink_protocol::pairing::{AuthDirection, AuthFlow, AuthParam, PinToken};
    /// use peerlink_protocol::DeviceInfo;
    ///
    /// let param = AuthParam::new(
    ///     DeviceInfo::new("AA:BB:CC", "Printer-42", 7),
    ///     AuthDirection::Join,
    ///     PinToken::new("tok-1"),
    /// );
    /// assert_eq!(param.flow(), AuthFlow::JoinPin);
    /// ```
    pub fn flow(&self) -> AuthFlow {
        match self.direction {
            AuthDirection::Main => AuthFlow::MainPin,
            AuthDirection::Join if self.app_icon.is_some() => AuthFlow::JoinAuthImage,
            AuthDirection::Join if self.business == Some(0) => AuthFlow::JoinAuthorize,
            AuthDirection::Join => AuthFlow::JoinPin,
        }
    }

    /// A bare PIN param with no application metadata
    pub fn new(peer: DeviceInfo, direction: AuthDirection, pin_token: PinToken) -> Self {
        Self {
            peer,
            auth_type: AUTH_TYPE_PIN,
            direction,
            pin_token,
            pin_code: None,
            package_name: None,
            app_name: None,
            app_description: None,
            business: None,
            app_icon: None,
            app_thumbnail: None,
        }
    }

    pub fn with_pin(mut self, pin: PinCode) -> Self {
        self.pin_code = Some(pin);
        self
    }

    /// Copy application metadata from the initiator's request
    pub fn with_request(mut self, request: &AuthRequest) -> Self {
        self.auth_type = request.auth_type;
        self.package_name = request.extra_info.target_pkg_name.clone();
        self.app_name = request.extra_info.app_name.clone();
        self.app_description = request.extra_info.app_description.clone();
        self.business = request.extra_info.business;
        self.app_icon = request.app_icon.clone();
        self.app_thumbnail = request.app_thumbnail.clone();
        self
    }
}

/// PIN submitted for verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyAuthInfo {
    pub auth_type: i32,
    pub pin_token: PinToken,
    pub pin_code: PinCode,
}

/// Successful verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    /// The device that displayed the PIN
    pub device_id: String,
    /// Trust level granted by the service
    pub level: i32,
}

/// Final result of `authenticate_device`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub device_id: String,
    pub pin_token: PinToken,
}

/// The user's decision for a pairing round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOperation {
    AllowAuth = 0,
    CancelAuth = 1,
    AuthConfirmTimeout = 2,
    CancelPinCodeDisplay = 3,
    CancelPinCodeInput = 4,
}

impl UserOperation {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Operations that end the round without pairing
    pub fn is_cancel(&self) -> bool {
        !matches!(self, UserOperation::AllowAuth)
    }
}

impl TryFrom<i32> for UserOperation {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(UserOperation::AllowAuth),
            1 => Ok(UserOperation::CancelAuth),
            2 => Ok(UserOperation::AuthConfirmTimeout),
            3 => Ok(UserOperation::CancelPinCodeDisplay),
            4 => Ok(UserOperation::CancelPinCodeInput),
            other => Err(ProtocolError::InvalidValue(format!(
                "user operation {} out of range",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_param() -> AuthParam {
        AuthParam::new(
            DeviceInfo::new("AA:BB:CC", "Printer-42", 7),
            AuthDirection::Join,
            PinToken::new("tok-1"),
        )
    }

    #[test]
    fn test_flow_classification() {
        let mut param = join_param();
        param.direction = AuthDirection::Main;
        param.app_icon = Some(vec![1, 2, 3]);
        assert_eq!(param.flow(), AuthFlow::MainPin);

        let param = join_param().with_request(&AuthRequest::pin("Gallery").with_icon(vec![0xFF]));
        assert_eq!(param.flow(), AuthFlow::JoinAuthImage);

        let param = join_param().with_request(&AuthRequest::pin("Gallery").with_business(0));
        assert_eq!(param.flow(), AuthFlow::JoinAuthorize);

        let param = join_param().with_request(&AuthRequest::pin("Gallery").with_business(3));
        assert_eq!(param.flow(), AuthFlow::JoinPin);
    }

    #[test]
    fn test_cancel_operations() {
        assert_eq!(
            AuthFlow::MainPin.cancel_operation(),
            UserOperation::CancelPinCodeDisplay
        );
        assert_eq!(
            AuthFlow::JoinPin.cancel_operation(),
            UserOperation::CancelPinCodeInput
        );
        assert_eq!(
            AuthFlow::JoinAuthorize.cancel_operation(),
            UserOperation::CancelAuth
        );
        assert_eq!(AuthFlow::JoinAuthImage.initial_state(), AuthState::Authorizing);
    }

    #[test]
    fn test_user_operation_codes() {
        for code in 0..=4 {
            assert_eq!(UserOperation::try_from(code).unwrap().code(), code);
        }
        assert!(UserOperation::try_from(5).is_err());
        assert!(!UserOperation::AllowAuth.is_cancel());
        assert!(UserOperation::AuthConfirmTimeout.is_cancel());
    }

    #[test]
    fn test_direction_codes() {
        assert_eq!(AuthDirection::try_from(1).unwrap(), AuthDirection::Main);
        assert_eq!(AuthDirection::try_from(0).unwrap(), AuthDirection::Join);
        assert!(AuthDirection::try_from(2).is_err());
    }

    #[test]
    fn test_extra_info_json() {
        let info: AuthExtraInfo = serde_json::from_str(
            r#"{"targetPkgName":"com.example.gallery","appName":"Gallery","business":0,"displayOwner":0}"#,
        )
        .unwrap();
        assert_eq!(info.business, Some(0));
        assert_eq!(info.app_description, None);
    }
}
