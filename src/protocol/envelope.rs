//! OCPP message framing
//!
//! Two wire grammars carry the same semantic messages:
//!
//! - **Standard OCPP-J arrays**
//!   - Call        `[2, "<uniqueId>", "<action>", {<payload>}]`
//!   - CallResult  `[3, "<uniqueId>", {<payload>}]`
//!   - CallError   `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`
//! - **Simplified objects** (legacy/simulated devices)
//!   - Call        `{"action": "...", "payload": {...}}`
//!   - CallResult  `{"action": "...", "response": {...}}`
//!   - CallError   `{"action": "...", "error": {"code": "...", "description": "..."}}`
//!
//! The decoder tries the array grammar first and falls back to the object
//! grammar, so downstream code only ever sees an [`Envelope`]. Replies are
//! re-encoded in whichever [`WireFormat`] the decoder reported.

use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// Which grammar a message arrived in (and should be replied in).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Standard,
    Simplified,
}

// ── Envelope ───────────────────────────────────────────────────

/// A decoded OCPP message, independent of wire grammar.
///
/// The simplified object grammar carries no unique id; the decoder
/// synthesizes one for calls, and responses keep the action name so
/// adapters can correlate them by `(device, action)` instead.
#[derive(Debug, Clone)]
pub enum Envelope {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
        /// Required for simplified-shape encoding; `None` when the
        /// standard grammar is in play.
        action: Option<String>,
    },
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
        action: Option<String>,
    },
}

impl Envelope {
    // ── Decoding ───────────────────────────────────────────

    /// Decode raw JSON text in either grammar.
    pub fn decode(text: &str) -> Result<(Self, WireFormat), ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        match value {
            Value::Array(arr) => Self::decode_array(&arr).map(|e| (e, WireFormat::Standard)),
            Value::Object(obj) => {
                Self::decode_object(&obj).map(|e| (e, WireFormat::Simplified))
            }
            _ => Err(ProtocolError::UnsupportedShape),
        }
    }

    fn decode_array(arr: &[Value]) -> Result<Self, ProtocolError> {
        if arr.is_empty() {
            return Err(ProtocolError::EmptyArray);
        }

        let msg_type = arr[0].as_u64().ok_or(ProtocolError::InvalidMessageType)?;

        match msg_type {
            MSG_TYPE_CALL => {
                if arr.len() < 4 {
                    return Err(ProtocolError::MissingFields {
                        expected: 4,
                        got: arr.len(),
                    });
                }
                Ok(Self::Call {
                    unique_id: require_str(&arr[1], "uniqueId")?,
                    action: require_str(&arr[2], "action")?,
                    payload: arr[3].clone(),
                })
            }
            MSG_TYPE_CALL_RESULT => {
                if arr.len() < 3 {
                    return Err(ProtocolError::MissingFields {
                        expected: 3,
                        got: arr.len(),
                    });
                }
                Ok(Self::CallResult {
                    unique_id: require_str(&arr[1], "uniqueId")?,
                    payload: arr[2].clone(),
                    action: None,
                })
            }
            MSG_TYPE_CALL_ERROR => {
                if arr.len() < 4 {
                    return Err(ProtocolError::MissingFields {
                        expected: 4,
                        got: arr.len(),
                    });
                }
                Ok(Self::CallError {
                    unique_id: require_str(&arr[1], "uniqueId")?,
                    error_code: arr[2].as_str().unwrap_or("InternalError").to_string(),
                    error_description: arr
                        .get(3)
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    error_details: arr.get(4).cloned().unwrap_or_else(|| json!({})),
                    action: None,
                })
            }
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    fn decode_object(obj: &serde_json::Map<String, Value>) -> Result<Self, ProtocolError> {
        let action = obj
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or(ProtocolError::MissingAction)?
            .to_string();

        if let Some(error) = obj.get("error") {
            return Ok(Self::CallError {
                unique_id: String::new(),
                error_code: error
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("InternalError")
                    .to_string(),
                error_description: error
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                error_details: json!({}),
                action: Some(action),
            });
        }

        if let Some(response) = obj.get("response") {
            return Ok(Self::CallResult {
                unique_id: String::new(),
                payload: response.clone(),
                action: Some(action),
            });
        }

        let payload = obj.get("payload").cloned().unwrap_or_else(|| json!({}));
        Ok(Self::Call {
            // The object grammar has no id; synthesize one so the rest of
            // the pipeline can treat both grammars uniformly.
            unique_id: Uuid::new_v4().to_string(),
            action,
            payload,
        })
    }

    // ── Encoding ───────────────────────────────────────────

    /// Serialize this envelope in the given grammar.
    pub fn encode(&self, format: WireFormat) -> Result<String, ProtocolError> {
        let value = match format {
            WireFormat::Standard => self.encode_array(),
            WireFormat::Simplified => self.encode_object()?,
        };
        // to_string on a Value never fails
        Ok(serde_json::to_string(&value).unwrap_or_default())
    }

    fn encode_array(&self) -> Value {
        match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => json!([MSG_TYPE_CALL, unique_id, action, payload]),
            Self::CallResult {
                unique_id, payload, ..
            } => json!([MSG_TYPE_CALL_RESULT, unique_id, payload]),
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
                ..
            } => json!([
                MSG_TYPE_CALL_ERROR,
                unique_id,
                error_code,
                error_description,
                error_details
            ]),
        }
    }

    fn encode_object(&self) -> Result<Value, ProtocolError> {
        match self {
            Self::Call {
                action, payload, ..
            } => Ok(json!({ "action": action, "payload": payload })),
            Self::CallResult {
                payload, action, ..
            } => {
                let action = action.as_deref().ok_or(ProtocolError::MissingAction)?;
                Ok(json!({ "action": action, "response": payload }))
            }
            Self::CallError {
                error_code,
                error_description,
                action,
                ..
            } => {
                let action = action.as_deref().ok_or(ProtocolError::MissingAction)?;
                Ok(json!({
                    "action": action,
                    "error": { "code": error_code, "description": error_description }
                }))
            }
        }
    }

    // ── Helpers ────────────────────────────────────────────

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Build a `CallError` reply to a call.
    pub fn error_reply(
        unique_id: impl Into<String>,
        action: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: json!({}),
            action: Some(action.into()),
        }
    }

    /// Build a `CallResult` reply to a call.
    pub fn result_reply(
        unique_id: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::CallResult {
            unique_id: unique_id.into(),
            payload,
            action: Some(action.into()),
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }

    /// Recover the unique id from a frame that failed to decode, so the
    /// adapter can still answer with a CALLERROR. Responses (types 3/4)
    /// are never answered, and the object grammar carries no id at all.
    pub fn salvage_unique_id(text: &str) -> Option<String> {
        let value: Value = serde_json::from_str(text).ok()?;
        let arr = value.as_array()?;
        let msg_type = arr.first()?.as_u64()?;
        if msg_type == MSG_TYPE_CALL_RESULT || msg_type == MSG_TYPE_CALL_ERROR {
            return None;
        }
        let unique_id = arr.get(1)?.as_str()?;
        (!unique_id.is_empty()).then(|| unique_id.to_string())
    }
}

fn require_str(value: &Value, field: &'static str) -> Result<String, ProtocolError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(ProtocolError::FieldTypeMismatch(field))
}

// ── Errors ─────────────────────────────────────────────────────

/// Malformed-envelope errors. The connection survives these; the adapter
/// answers with a CALLERROR where a reply is possible.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Empty OCPP message array")]
    EmptyArray,
    #[error("Message type is not a number")]
    InvalidMessageType,
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u64),
    #[error("Expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },
    #[error("Field type mismatch: {0} must be a string")]
    FieldTypeMismatch(&'static str),
    #[error("Message is neither an array nor an object")]
    UnsupportedShape,
    #[error("Object-shape message has no action")]
    MissingAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_standard_call() {
        let text = r#"[2,"abc123","BootNotification",{"chargePointVendor":"Vendor"}]"#;
        let (envelope, format) = Envelope::decode(text).unwrap();
        assert_eq!(format, WireFormat::Standard);
        match envelope {
            Envelope::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(action, "BootNotification");
                assert_eq!(payload["chargePointVendor"], "Vendor");
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn decode_simplified_call_synthesizes_id() {
        let text = r#"{"action":"Heartbeat","payload":{}}"#;
        let (envelope, format) = Envelope::decode(text).unwrap();
        assert_eq!(format, WireFormat::Simplified);
        match envelope {
            Envelope::Call {
                unique_id, action, ..
            } => {
                assert_eq!(action, "Heartbeat");
                assert!(!unique_id.is_empty());
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn decode_simplified_response() {
        let text = r#"{"action":"Reset","response":{"status":"Accepted"}}"#;
        let (envelope, _) = Envelope::decode(text).unwrap();
        match envelope {
            Envelope::CallResult {
                payload, action, ..
            } => {
                assert_eq!(payload["status"], "Accepted");
                assert_eq!(action.as_deref(), Some("Reset"));
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[test]
    fn decode_simplified_error() {
        let text = r#"{"action":"Reset","error":{"code":"NotSupported","description":"nope"}}"#;
        let (envelope, _) = Envelope::decode(text).unwrap();
        match envelope {
            Envelope::CallError {
                error_code,
                error_description,
                ..
            } => {
                assert_eq!(error_code, "NotSupported");
                assert_eq!(error_description, "nope");
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn roundtrip_standard_call() {
        let envelope = Envelope::Call {
            unique_id: "id1".into(),
            action: "Heartbeat".into(),
            payload: json!({}),
        };
        let text = envelope.encode(WireFormat::Standard).unwrap();
        let (parsed, format) = Envelope::decode(&text).unwrap();
        assert_eq!(format, WireFormat::Standard);
        match parsed {
            Envelope::Call {
                unique_id, action, ..
            } => {
                assert_eq!(unique_id, "id1");
                assert_eq!(action, "Heartbeat");
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn roundtrip_simplified_call() {
        let envelope = Envelope::Call {
            unique_id: "ignored".into(),
            action: "StartTransaction".into(),
            payload: json!({"connectorId": 1}),
        };
        let text = envelope.encode(WireFormat::Simplified).unwrap();
        let (parsed, format) = Envelope::decode(&text).unwrap();
        assert_eq!(format, WireFormat::Simplified);
        match parsed {
            Envelope::Call {
                action, payload, ..
            } => {
                assert_eq!(action, "StartTransaction");
                assert_eq!(payload["connectorId"], 1);
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn simplified_result_requires_action() {
        let envelope = Envelope::CallResult {
            unique_id: "id".into(),
            payload: json!({}),
            action: None,
        };
        assert!(envelope.encode(WireFormat::Simplified).is_err());
        assert!(envelope.encode(WireFormat::Standard).is_ok());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode("[]").is_err());
        assert!(Envelope::decode("[9,\"id\"]").is_err());
        assert!(Envelope::decode("42").is_err());
        assert!(Envelope::decode(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn salvage_recovers_id_from_truncated_call() {
        assert_eq!(
            Envelope::salvage_unique_id(r#"[2,"id9"]"#),
            Some("id9".to_string())
        );
        // Unknown message type still carries an answerable id
        assert_eq!(
            Envelope::salvage_unique_id(r#"[9,"id9"]"#),
            Some("id9".to_string())
        );
    }

    #[test]
    fn salvage_never_answers_responses_or_idless_frames() {
        assert_eq!(Envelope::salvage_unique_id(r#"[3,"id9"]"#), None);
        assert_eq!(Envelope::salvage_unique_id(r#"[4,"id9"]"#), None);
        assert_eq!(Envelope::salvage_unique_id(r#"[2,""]"#), None);
        assert_eq!(Envelope::salvage_unique_id(r#"[2,7]"#), None);
        assert_eq!(Envelope::salvage_unique_id(r#"{"payload":{}}"#), None);
        assert_eq!(Envelope::salvage_unique_id("not json"), None);
    }

    #[test]
    fn error_reply_mirrors_both_shapes() {
        let reply = Envelope::error_reply("id7", "Reset", "NotImplemented", "unsupported");
        let standard = reply.encode(WireFormat::Standard).unwrap();
        assert!(standard.starts_with("[4,"));
        let simplified = reply.encode(WireFormat::Simplified).unwrap();
        let (parsed, _) = Envelope::decode(&simplified).unwrap();
        assert!(matches!(parsed, Envelope::CallError { .. }));
    }
}
