//! Direction-agnostic representation of one RPC exchange unit
//!
//! A [`GatewayMessage`] is what the transport adapters hand to the pipe and
//! what the pipe hands back. On the message-bus side it travels as a flat
//! JSON object:
//!
//! ```text
//! { "type": 3, "action": "Reset", "id": "19",
//!   "request": {...}, "response": {...},
//!   "error_code": "...", "error_description": "...", "state": {...} }
//! ```
//!
//! On the device side it is converted to and from an OCPP-J [`Message`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ocpp::{ErrorCode, Message, MessageType, OcppError};

/// A request from either peer
#[derive(Debug, Clone, PartialEq)]
pub struct CallMessage {
    pub message_id: String,
    pub action: String,
    pub request_payload: Value,
    pub state: Option<Value>,
}

/// A successful response.
///
/// `action` and `request_payload` are empty on ingress from the device and
/// are filled in by the pipe from the call being answered.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResultMessage {
    pub message_id: String,
    pub action: Option<String>,
    pub request_payload: Option<Value>,
    pub response_payload: Value,
    pub state: Option<Value>,
}

/// An error response
#[derive(Debug, Clone, PartialEq)]
pub struct CallErrorMessage {
    pub message_id: String,
    pub action: Option<String>,
    pub request_payload: Option<Value>,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub state: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "FlatGatewayMessage", try_from = "FlatGatewayMessage")]
pub enum GatewayMessage {
    Call(CallMessage),
    CallResult(CallResultMessage),
    CallError(CallErrorMessage),
}

impl GatewayMessage {
    pub fn call(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        GatewayMessage::Call(CallMessage {
            message_id: message_id.into(),
            action: action.into(),
            request_payload: payload,
            state: None,
        })
    }

    pub fn call_result(message_id: impl Into<String>, payload: Value) -> Self {
        GatewayMessage::CallResult(CallResultMessage {
            message_id: message_id.into(),
            action: None,
            request_payload: None,
            response_payload: payload,
            state: None,
        })
    }

    pub fn call_error(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        GatewayMessage::CallError(CallErrorMessage {
            message_id: message_id.into(),
            action: None,
            request_payload: None,
            error_code,
            error_description: error_description.into(),
            state: None,
        })
    }

    /// Attach opaque state that the back end expects echoed back
    pub fn with_state(mut self, state: Value) -> Self {
        match &mut self {
            GatewayMessage::Call(m) => m.state = Some(state),
            GatewayMessage::CallResult(m) => m.state = Some(state),
            GatewayMessage::CallError(m) => m.state = Some(state),
        }
        self
    }

    pub fn message_id(&self) -> &str {
        match self {
            GatewayMessage::Call(m) => &m.message_id,
            GatewayMessage::CallResult(m) => &m.message_id,
            GatewayMessage::CallError(m) => &m.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            GatewayMessage::Call(_) => MessageType::Call,
            GatewayMessage::CallResult(_) => MessageType::CallResult,
            GatewayMessage::CallError(_) => MessageType::CallError,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, GatewayMessage::Call(_))
    }

    pub fn as_call(&self) -> Option<&CallMessage> {
        match self {
            GatewayMessage::Call(call) => Some(call),
            _ => None,
        }
    }

    /// Action this message belongs to, if known
    pub fn action(&self) -> Option<&str> {
        match self {
            GatewayMessage::Call(m) => Some(&m.action),
            GatewayMessage::CallResult(m) => m.action.as_deref(),
            GatewayMessage::CallError(m) => m.action.as_deref(),
        }
    }

    /// Copy the action and request payload of `call` onto this response.
    /// Calls are left untouched.
    pub fn enrich_from(&mut self, call: &CallMessage) {
        let (action, request_payload) = match self {
            GatewayMessage::Call(_) => return,
            GatewayMessage::CallResult(m) => (&mut m.action, &mut m.request_payload),
            GatewayMessage::CallError(m) => (&mut m.action, &mut m.request_payload),
        };
        *action = Some(call.action.clone());
        *request_payload = Some(call.request_payload.clone());
    }

    /// Convert to the OCPP-J frame written to the device.
    ///
    /// Enrichment fields and state never leave the gateway towards the device.
    pub fn to_ocpp(&self) -> Message {
        match self {
            GatewayMessage::Call(m) => {
                Message::call(&m.message_id, &m.action, m.request_payload.clone())
            }
            GatewayMessage::CallResult(m) => {
                Message::call_result(&m.message_id, m.response_payload.clone())
            }
            GatewayMessage::CallError(m) => Message::call_error(
                &m.message_id,
                m.error_code.clone(),
                &m.error_description,
                Value::Object(Map::new()),
            ),
        }
    }

    /// Decode an OCPP-J frame received from the device
    pub fn from_ocpp_bytes(bytes: &[u8]) -> Result<Self, OcppError> {
        Message::parse(bytes)?.try_into()
    }

    pub fn to_ocpp_bytes(&self) -> Result<Vec<u8>, OcppError> {
        self.to_ocpp().to_bytes()
    }

    pub fn to_ocpp_text(&self) -> Result<String, OcppError> {
        self.to_ocpp().to_text()
    }
}

impl TryFrom<Message> for GatewayMessage {
    type Error = OcppError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        let Message {
            message_type,
            message_id,
            mut data,
        } = msg;

        let mut elements = data.drain(..);
        let mut next = |name: &str| {
            elements
                .next()
                .ok_or_else(|| OcppError::FormatViolation(format!("missing {} element", name)))
        };

        match message_type {
            MessageType::Call => {
                let action = match next("action")? {
                    Value::String(action) => action,
                    other => {
                        return Err(OcppError::FormatViolation(format!(
                            "action is not a string: {}",
                            other
                        )))
                    }
                };
                let request_payload = next("request payload")?;
                Ok(GatewayMessage::Call(CallMessage {
                    message_id,
                    action,
                    request_payload,
                    state: None,
                }))
            }
            MessageType::CallResult => {
                let response_payload = next("response payload")?;
                Ok(GatewayMessage::CallResult(CallResultMessage {
                    message_id,
                    action: None,
                    request_payload: None,
                    response_payload,
                    state: None,
                }))
            }
            MessageType::CallError => {
                let error_code = match next("error code")? {
                    Value::String(code) => ErrorCode::from_wire(&code),
                    other => {
                        return Err(OcppError::FormatViolation(format!(
                            "error code is not a string: {}",
                            other
                        )))
                    }
                };
                let error_description = match next("error description")? {
                    Value::String(description) => description,
                    other => {
                        return Err(OcppError::FormatViolation(format!(
                            "error description is not a string: {}",
                            other
                        )))
                    }
                };
                Ok(GatewayMessage::CallError(CallErrorMessage {
                    message_id,
                    action: None,
                    request_payload: None,
                    error_code,
                    error_description,
                    state: None,
                }))
            }
        }
    }
}

/// Flat JSON shape used on the message bus
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatGatewayMessage {
    #[serde(rename = "type")]
    message_type: MessageType,
    #[serde(default)]
    action: String,
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<Value>,
}

fn non_empty(action: String) -> Option<String> {
    if action.is_empty() {
        None
    } else {
        Some(action)
    }
}

impl From<GatewayMessage> for FlatGatewayMessage {
    fn from(msg: GatewayMessage) -> Self {
        match msg {
            GatewayMessage::Call(m) => FlatGatewayMessage {
                message_type: MessageType::Call,
                action: m.action,
                id: m.message_id,
                request: Some(m.request_payload),
                response: None,
                error_code: None,
                error_description: None,
                state: m.state,
            },
            GatewayMessage::CallResult(m) => FlatGatewayMessage {
                message_type: MessageType::CallResult,
                action: m.action.unwrap_or_default(),
                id: m.message_id,
                request: m.request_payload,
                response: Some(m.response_payload),
                error_code: None,
                error_description: None,
                state: m.state,
            },
            GatewayMessage::CallError(m) => FlatGatewayMessage {
                message_type: MessageType::CallError,
                action: m.action.unwrap_or_default(),
                id: m.message_id,
                request: m.request_payload,
                response: None,
                error_code: Some(m.error_code.as_str().to_string()),
                error_description: Some(m.error_description),
                state: m.state,
            },
        }
    }
}

impl TryFrom<FlatGatewayMessage> for GatewayMessage {
    type Error = OcppError;

    fn try_from(flat: FlatGatewayMessage) -> Result<Self, Self::Error> {
        match flat.message_type {
            MessageType::Call => {
                if flat.action.is_empty() {
                    return Err(OcppError::FormatViolation(format!(
                        "call {} has no action",
                        flat.id
                    )));
                }
                Ok(GatewayMessage::Call(CallMessage {
                    message_id: flat.id,
                    action: flat.action,
                    request_payload: flat.request.unwrap_or(Value::Null),
                    state: flat.state,
                }))
            }
            MessageType::CallResult => Ok(GatewayMessage::CallResult(CallResultMessage {
                message_id: flat.id,
                action: non_empty(flat.action),
                request_payload: flat.request,
                response_payload: flat.response.unwrap_or(Value::Null),
                state: flat.state,
            })),
            MessageType::CallError => Ok(GatewayMessage::CallError(CallErrorMessage {
                message_id: flat.id,
                action: non_empty(flat.action),
                request_payload: flat.request,
                error_code: flat
                    .error_code
                    .as_deref()
                    .map(ErrorCode::from_wire)
                    .unwrap_or(ErrorCode::GenericError),
                error_description: flat.error_description.unwrap_or_default(),
                state: flat.state,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enrich_call_result() {
        let call = CallMessage {
            message_id: "4321".to_string(),
            action: "CSMSCall".to_string(),
            request_payload: json!({"call": true}),
            state: None,
        };
        let mut response = GatewayMessage::call_result("4321", json!({"call": false}));
        response.enrich_from(&call);

        assert_eq!(response.action(), Some("CSMSCall"));
        match response {
            GatewayMessage::CallResult(m) => {
                assert_eq!(m.request_payload, Some(json!({"call": true})));
                assert_eq!(m.response_payload, json!({"call": false}));
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_enrich_leaves_calls_alone() {
        let original = GatewayMessage::call("1", "Heartbeat", json!({}));
        let mut msg = original.clone();
        msg.enrich_from(&CallMessage {
            message_id: "1".to_string(),
            action: "Reset".to_string(),
            request_payload: json!({"type": "Hard"}),
            state: None,
        });
        assert_eq!(msg, original);
    }

    #[test]
    fn test_bus_json_shape() {
        let msg = GatewayMessage::call("19", "Reset", json!({"type": "Immediate"}))
            .with_state(json!({"attempt": 1}));
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(
            value,
            json!({
                "type": 2,
                "action": "Reset",
                "id": "19",
                "request": {"type": "Immediate"},
                "state": {"attempt": 1}
            })
        );
    }

    #[test]
    fn test_bus_json_call_error() {
        let text = r#"{"type":4,"action":"","id":"7","error_code":"NotSupported","error_description":"no"}"#;
        let msg: GatewayMessage = serde_json::from_str(text).unwrap();

        assert_eq!(
            msg,
            GatewayMessage::call_error("7", ErrorCode::NotSupported, "no")
        );
    }

    #[test]
    fn test_bus_json_rejects_call_without_action() {
        let text = r#"{"type":2,"id":"7","request":{}}"#;
        assert!(serde_json::from_str::<GatewayMessage>(text).is_err());
    }

    #[test]
    fn test_from_ocpp_call() {
        let msg = GatewayMessage::from_ocpp_bytes(br#"[2,"1234","CSCall",{"call":true}]"#).unwrap();
        assert_eq!(msg, GatewayMessage::call("1234", "CSCall", json!({"call": true})));
    }

    #[test]
    fn test_from_ocpp_call_error_ignores_details() {
        let msg =
            GatewayMessage::from_ocpp_bytes(br#"[4,"9","InternalError","boom",{"why":"x"}]"#)
                .unwrap();
        assert_eq!(
            msg,
            GatewayMessage::call_error("9", ErrorCode::InternalError, "boom")
        );
    }

    #[test]
    fn test_from_ocpp_missing_elements() {
        assert!(matches!(
            GatewayMessage::from_ocpp_bytes(br#"[2,"1","Heartbeat"]"#),
            Err(OcppError::FormatViolation(_))
        ));
        assert!(matches!(
            GatewayMessage::from_ocpp_bytes(br#"[3,"1"]"#),
            Err(OcppError::FormatViolation(_))
        ));
        assert!(matches!(
            GatewayMessage::from_ocpp_bytes(br#"[2,"1",5,{}]"#),
            Err(OcppError::FormatViolation(_))
        ));
    }

    #[test]
    fn test_ocpp16_error_code_passes_through() {
        let msg = GatewayMessage::from_ocpp_bytes(br#"[4,"42","FormationViolation","bad",{}]"#)
            .unwrap();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["error_code"], json!("FormationViolation"));

        let text = r#"{"type":4,"id":"9","error_code":"OccurenceConstraintViolation","error_description":"x"}"#;
        let msg: GatewayMessage = serde_json::from_str(text).unwrap();
        assert_eq!(
            msg.to_ocpp_text().unwrap(),
            r#"[4,"9","OccurenceConstraintViolation","x",{}]"#
        );
    }

    #[test]
    fn test_to_ocpp_drops_enrichment() {
        let msg = GatewayMessage::CallError(CallErrorMessage {
            message_id: "5".to_string(),
            action: Some("Reset".to_string()),
            request_payload: Some(json!({})),
            error_code: ErrorCode::NotSupported,
            error_description: "no reset".to_string(),
            state: Some(json!("s")),
        });
        let text = msg.to_ocpp_text().unwrap();
        assert_eq!(text, r#"[4,"5","NotSupported","no reset",{}]"#);
        assert_eq!(msg.to_ocpp_bytes().unwrap(), text.into_bytes());
    }
}
