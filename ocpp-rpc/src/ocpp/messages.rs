//! OCPP-J message framing
//!
//! Every OCPP-J frame is a JSON array whose first element is the message type:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Decoding never panics. Malformed input yields a [`DecodeError`] that keeps
//! the raw text and whatever message id could be recovered, so the connection
//! can decide whether a CALLERROR answer is possible.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_i64(value: i64) -> Option<Self> {
        match value {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// OCPP-J error codes carried by CALLERROR frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    #[serde(alias = "FormatViolation")]
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
        }
    }

    /// Parse a wire error code; unknown codes collapse to `GenericError`.
    pub fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OCPP 1.6 action names known to this crate.
///
/// Frames carry the action as a plain string so that an unknown action is a
/// dispatch outcome (CALLERROR), not a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // Station -> central system
    Authorize,
    BootNotification,
    Heartbeat,
    MeterValues,
    StartTransaction,
    StatusNotification,
    StopTransaction,

    // Central system -> station
    CancelReservation,
    ChangeAvailability,
    ChangeConfiguration,
    ClearCache,
    ClearChargingProfile,
    GetCompositeSchedule,
    GetConfiguration,
    RemoteStartTransaction,
    RemoteStopTransaction,
    ReserveNow,
    Reset,
    SetChargingProfile,
    TriggerMessage,
    UnlockConnector,

    // Bidirectional
    DataTransfer,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::MeterValues => "MeterValues",
            Action::StartTransaction => "StartTransaction",
            Action::StatusNotification => "StatusNotification",
            Action::StopTransaction => "StopTransaction",
            Action::CancelReservation => "CancelReservation",
            Action::ChangeAvailability => "ChangeAvailability",
            Action::ChangeConfiguration => "ChangeConfiguration",
            Action::ClearCache => "ClearCache",
            Action::ClearChargingProfile => "ClearChargingProfile",
            Action::GetCompositeSchedule => "GetCompositeSchedule",
            Action::GetConfiguration => "GetConfiguration",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::ReserveNow => "ReserveNow",
            Action::Reset => "Reset",
            Action::SetChargingProfile => "SetChargingProfile",
            Action::TriggerMessage => "TriggerMessage",
            Action::UnlockConnector => "UnlockConnector",
            Action::DataTransfer => "DataTransfer",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Authorize" => Ok(Action::Authorize),
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "MeterValues" => Ok(Action::MeterValues),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StatusNotification" => Ok(Action::StatusNotification),
            "StopTransaction" => Ok(Action::StopTransaction),
            "CancelReservation" => Ok(Action::CancelReservation),
            "ChangeAvailability" => Ok(Action::ChangeAvailability),
            "ChangeConfiguration" => Ok(Action::ChangeConfiguration),
            "ClearCache" => Ok(Action::ClearCache),
            "ClearChargingProfile" => Ok(Action::ClearChargingProfile),
            "GetCompositeSchedule" => Ok(Action::GetCompositeSchedule),
            "GetConfiguration" => Ok(Action::GetConfiguration),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            "ReserveNow" => Ok(Action::ReserveNow),
            "Reset" => Ok(Action::Reset),
            "SetChargingProfile" => Ok(Action::SetChargingProfile),
            "TriggerMessage" => Ok(Action::TriggerMessage),
            "UnlockConnector" => Ok(Action::UnlockConnector),
            "DataTransfer" => Ok(Action::DataTransfer),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown action: {0}")]
pub struct UnknownAction(pub String);

/// Why a raw message could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    InvalidJson(String),
    NotAnArray,
    InvalidMessageType,
    UnknownMessageType(i64),
    InvalidLength { expected: usize, actual: usize },
    InvalidMessageId,
    InvalidAction,
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeErrorKind::InvalidJson(e) => write!(f, "JSON parse error: {}", e),
            DecodeErrorKind::NotAnArray => f.write_str("frame is not a JSON array"),
            DecodeErrorKind::InvalidMessageType => f.write_str("message type is not an integer"),
            DecodeErrorKind::UnknownMessageType(t) => write!(f, "unknown message type: {}", t),
            DecodeErrorKind::InvalidLength { expected, actual } => {
                write!(f, "expected {} elements, got {}", expected, actual)
            }
            DecodeErrorKind::InvalidMessageId => f.write_str("message id is not a string or number"),
            DecodeErrorKind::InvalidAction => f.write_str("action is not a string"),
        }
    }
}

/// A raw message that could not be turned into a [`Frame`]
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub raw: String,
    /// Message id recovered from the frame, if any
    pub message_id: Option<String>,
    /// Whether the frame announced itself as a CALL
    pub looks_like_call: bool,
}

impl DecodeError {
    /// A CALLERROR can be sent back only for CALL-shaped frames with a usable id.
    pub fn answerable_id(&self) -> Option<&str> {
        if self.looks_like_call {
            self.message_id.as_deref()
        } else {
            None
        }
    }

    /// Error code to answer with when the frame is answerable
    pub fn error_code(&self) -> ErrorCode {
        match self.kind {
            DecodeErrorKind::InvalidAction => ErrorCode::ProtocolError,
            _ => ErrorCode::FormationViolation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("CALL frame without action")]
    MissingAction,

    #[error("frame without message id")]
    MissingMessageId,
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL with a fresh UUID message id
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        }
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// A decoded OCPP-J frame (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Frame::Call(c) => &c.message_id,
            Frame::CallResult(r) => &r.message_id,
            Frame::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to the OCPP-J wire format
    pub fn encode(&self) -> Result<String, EncodeError> {
        if self.message_id().is_empty() {
            return Err(EncodeError::MissingMessageId);
        }

        let array = match self {
            Frame::Call(call) => {
                if call.action.is_empty() {
                    return Err(EncodeError::MissingAction);
                }
                serde_json::json!([
                    MessageType::Call as i32,
                    &call.message_id,
                    &call.action,
                    &call.payload
                ])
            }
            Frame::CallResult(result) => serde_json::json!([
                MessageType::CallResult as i32,
                &result.message_id,
                &result.payload
            ]),
            Frame::CallError(error) => serde_json::json!([
                MessageType::CallError as i32,
                &error.message_id,
                error.error_code.as_str(),
                &error.error_description,
                &error.error_details
            ]),
        };

        Ok(array.to_string())
    }

    /// Parse a raw text message
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let fail = |kind: DecodeErrorKind, message_id: Option<String>, looks_like_call: bool| {
            DecodeError {
                kind,
                raw: raw.to_string(),
                message_id,
                looks_like_call,
            }
        };

        let value: Value = serde_json::from_str(raw)
            .map_err(|e| fail(DecodeErrorKind::InvalidJson(e.to_string()), None, false))?;

        let array = match value {
            Value::Array(array) => array,
            _ => return Err(fail(DecodeErrorKind::NotAnArray, None, false)),
        };

        let message_id = array.get(1).and_then(normalize_message_id);

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| fail(DecodeErrorKind::InvalidMessageType, message_id.clone(), false))?;

        let msg_type = MessageType::from_i64(msg_type).ok_or_else(|| {
            fail(
                DecodeErrorKind::UnknownMessageType(msg_type),
                message_id.clone(),
                false,
            )
        })?;

        let looks_like_call = msg_type == MessageType::Call;
        let expected = match msg_type {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        };
        if array.len() != expected {
            return Err(fail(
                DecodeErrorKind::InvalidLength {
                    expected,
                    actual: array.len(),
                },
                message_id,
                looks_like_call,
            ));
        }

        let message_id = message_id
            .ok_or_else(|| fail(DecodeErrorKind::InvalidMessageId, None, looks_like_call))?;

        let mut array = array;
        match msg_type {
            MessageType::Call => {
                let action = match array[2].as_str() {
                    Some(action) if !action.is_empty() => action.to_string(),
                    _ => {
                        return Err(fail(
                            DecodeErrorKind::InvalidAction,
                            Some(message_id),
                            true,
                        ))
                    }
                };

                Ok(Frame::Call(Call {
                    message_id,
                    action,
                    payload: array[3].take(),
                }))
            }
            MessageType::CallResult => Ok(Frame::CallResult(CallResult {
                message_id,
                payload: array[2].take(),
            })),
            MessageType::CallError => {
                let error_code = array[2]
                    .as_str()
                    .map(ErrorCode::from_wire)
                    .unwrap_or(ErrorCode::GenericError);

                let error_description = array[3].as_str().unwrap_or("").to_string();

                Ok(Frame::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].take(),
                }))
            }
        }
    }
}

impl From<Call> for Frame {
    fn from(call: Call) -> Self {
        Frame::Call(call)
    }
}

impl From<CallResult> for Frame {
    fn from(result: CallResult) -> Self {
        Frame::CallResult(result)
    }
}

impl From<CallError> for Frame {
    fn from(error: CallError) -> Self {
        Frame::CallError(error)
    }
}

/// Message ids may arrive as numbers from some firmwares
fn normalize_message_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
