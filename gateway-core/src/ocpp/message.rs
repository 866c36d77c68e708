//! OCPP-J RPC framing
//!
//! Every OCPP-J frame is a JSON array whose first two elements are the
//! message type and the message id:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! [`Message`] only understands the leading two elements. The remaining
//! elements are kept as raw JSON values and interpreted by the caller.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for MessageType {
    type Error = OcppError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            other => Err(OcppError::UnknownMessageType(other)),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        MessageType::try_from(raw).map_err(serde::de::Error::custom)
    }
}

/// OCPP error codes.
///
/// The named variants are the OCPP 2.0.1 codes the gateway itself emits.
/// Any other code (OCPP 1.6 spellings such as `FormationViolation`, vendor
/// codes) is carried as [`ErrorCode::Other`] and written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::Other(code) => code,
        }
    }

    /// Parse a wire error code. Never fails: unknown codes are kept verbatim.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "FormatViolation" => ErrorCode::FormatViolation,
            "GenericError" => ErrorCode::GenericError,
            "InternalError" => ErrorCode::InternalError,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "ProtocolError" => ErrorCode::ProtocolError,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            "SecurityError" => ErrorCode::SecurityError,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ErrorCode::from_wire(&raw))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Format violation: {0}")]
    FormatViolation(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),
}

impl OcppError {
    /// The OCPP error code to report back to the peer that sent the frame
    pub fn error_code(&self) -> ErrorCode {
        match self {
            OcppError::UnknownMessageType(_) => ErrorCode::MessageTypeNotSupported,
            _ => ErrorCode::FormatViolation,
        }
    }
}

/// A decoded OCPP-J frame
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub message_id: String,
    pub data: Vec<Value>,
}

impl Message {
    /// Build a CALL frame
    pub fn call(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: MessageType::Call,
            message_id: message_id.into(),
            data: vec![Value::String(action.into()), payload],
        }
    }

    /// Build a CALLRESULT frame
    pub fn call_result(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: MessageType::CallResult,
            message_id: message_id.into(),
            data: vec![payload],
        }
    }

    /// Build a CALLERROR frame
    pub fn call_error(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
        error_details: Value,
    ) -> Self {
        Self {
            message_type: MessageType::CallError,
            message_id: message_id.into(),
            data: vec![
                Value::String(error_code.as_str().to_string()),
                Value::String(error_description.into()),
                error_details,
            ],
        }
    }

    /// Element `index` of the frame payload (the elements after the id)
    pub fn element(&self, index: usize) -> Option<&Value> {
        self.data.get(index)
    }

    fn to_array(&self) -> Vec<Value> {
        let mut array = Vec::with_capacity(self.data.len() + 2);
        array.push(Value::from(self.message_type.as_i64()));
        array.push(Value::String(self.message_id.clone()));
        array.extend(self.data.iter().cloned());
        array
    }

    /// Serialize to OCPP wire format: [type, messageId, ...data]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_array())?)
    }

    /// Serialize to OCPP wire format as a websocket text payload
    pub fn to_text(&self) -> Result<String, OcppError> {
        Ok(serde_json::to_string(&self.to_array())?)
    }

    /// Parse an OCPP-J frame from JSON bytes.
    ///
    /// Only the message type is mandatory. The id and the data elements are
    /// filled in when present.
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let mut array: Vec<Value> = serde_json::from_slice(bytes)?;

        if array.is_empty() {
            return Err(OcppError::FormatViolation("no message type".to_string()));
        }

        let raw_type = array[0].as_i64().ok_or_else(|| {
            OcppError::FormatViolation(format!("message type is not an integer: {}", array[0]))
        })?;
        let message_type = MessageType::try_from(raw_type)?;

        let message_id = match array.get(1) {
            Some(Value::String(id)) => id.clone(),
            Some(other) => {
                return Err(OcppError::FormatViolation(format!(
                    "message id is not a string: {}",
                    other
                )))
            }
            None => String::new(),
        };

        let data = if array.len() > 2 {
            array.split_off(2)
        } else {
            Vec::new()
        };

        Ok(Self {
            message_type,
            message_id,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_serialization() {
        let msg = Message::call("1", "ActionName", json!("Payload"));
        let text = String::from_utf8(msg.to_bytes().unwrap()).unwrap();

        assert_eq!(text, r#"[2,"1","ActionName","Payload"]"#);
    }

    #[test]
    fn test_call_parsing() {
        let msg = Message::parse(br#"[2, "1", "ActionName", "Payload"]"#).unwrap();

        assert_eq!(msg, Message::call("1", "ActionName", json!("Payload")));
    }

    #[test]
    fn test_call_error_serialization() {
        let msg = Message::call_error("42", ErrorCode::NotImplemented, "nope", json!({}));
        let text = String::from_utf8(msg.to_bytes().unwrap()).unwrap();

        assert_eq!(text, r#"[4,"42","NotImplemented","nope",{}]"#);
    }

    #[test]
    fn test_parse_tolerates_short_frames() {
        let msg = Message::parse(b"[3]").unwrap();
        assert_eq!(msg.message_type, MessageType::CallResult);
        assert_eq!(msg.message_id, "");
        assert!(msg.data.is_empty());

        let msg = Message::parse(br#"[2, "abc"]"#).unwrap();
        assert_eq!(msg.message_id, "abc");
        assert!(msg.element(0).is_none());
    }

    #[test]
    fn test_parse_rejects_empty_array() {
        let err = Message::parse(b"[]").unwrap_err();
        assert!(matches!(err, OcppError::FormatViolation(_)));
        assert_eq!(err.error_code(), ErrorCode::FormatViolation);
    }

    #[test]
    fn test_parse_rejects_bad_type() {
        assert!(matches!(
            Message::parse(br#"["2", "1"]"#),
            Err(OcppError::FormatViolation(_))
        ));

        let err = Message::parse(br#"[7, "1"]"#).unwrap_err();
        assert!(matches!(err, OcppError::UnknownMessageType(7)));
        assert_eq!(err.error_code(), ErrorCode::MessageTypeNotSupported);
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(matches!(
            Message::parse(br#"{"type": 2}"#),
            Err(OcppError::Json(_))
        ));
        assert!(matches!(
            Message::parse(br#"[2, 17, "Heartbeat", {}]"#),
            Err(OcppError::FormatViolation(_))
        ));
    }

    #[test]
    fn test_error_code_from_wire() {
        assert_eq!(ErrorCode::from_wire("NotSupported"), ErrorCode::NotSupported);
        assert_eq!(
            ErrorCode::from_wire("FormationViolation"),
            ErrorCode::Other("FormationViolation".to_string())
        );
    }

    #[test]
    fn test_ocpp16_error_code_kept_verbatim() {
        let code = ErrorCode::from_wire("OccurenceConstraintViolation");
        assert_eq!(code.as_str(), "OccurenceConstraintViolation");
        assert_eq!(
            serde_json::to_value(&code).unwrap(),
            json!("OccurenceConstraintViolation")
        );

        let msg = Message::call_error("9", code, "x", json!({}));
        let text = msg.to_text().unwrap();
        assert_eq!(text, r#"[4,"9","OccurenceConstraintViolation","x",{}]"#);
    }
}
