//! Typed OCPP 1.6 action payloads
//!
//! Inbound actions are parsed once at the dispatcher boundary into
//! [`CallAction`] and matched exhaustively; adding an action is a
//! compile-time-visible change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OCPP CALLERROR code constants.
pub mod error_code {
    pub const NOT_IMPLEMENTED: &str = "NotImplemented";
    pub const FORMATION_VIOLATION: &str = "FormationViolation";
    pub const INTERNAL_ERROR: &str = "InternalError";
}

/// A rejection that becomes a CALLERROR on the wire.
#[derive(Debug, Clone)]
pub struct CallRejection {
    pub code: &'static str,
    pub description: String,
}

impl CallRejection {
    pub fn not_implemented(action: &str) -> Self {
        Self {
            code: error_code::NOT_IMPLEMENTED,
            description: format!("Action not supported: {}", action),
        }
    }

    pub fn formation(detail: impl std::fmt::Display) -> Self {
        Self {
            code: error_code::FORMATION_VIOLATION,
            description: detail.to_string(),
        }
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self {
            code: error_code::INTERNAL_ERROR,
            description: detail.to_string(),
        }
    }
}

// ── Inbound actions ────────────────────────────────────────────

/// One variant per device-initiated OCPP action this gateway accepts.
#[derive(Debug, Clone)]
pub enum CallAction {
    BootNotification(BootNotificationRequest),
    Heartbeat,
    StatusNotification(StatusNotificationRequest),
    Authorize(AuthorizeRequest),
    StartTransaction(StartTransactionRequest),
    StopTransaction(StopTransactionRequest),
    MeterValues(MeterValuesRequest),
}

impl CallAction {
    /// Parse an `(action, payload)` pair from the envelope.
    pub fn parse(action: &str, payload: Value) -> Result<Self, CallRejection> {
        fn typed<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, CallRejection> {
            serde_json::from_value(payload).map_err(CallRejection::formation)
        }

        match action {
            "BootNotification" => Ok(Self::BootNotification(typed(payload)?)),
            "Heartbeat" => Ok(Self::Heartbeat),
            "StatusNotification" => Ok(Self::StatusNotification(typed(payload)?)),
            "Authorize" => Ok(Self::Authorize(typed(payload)?)),
            "StartTransaction" => Ok(Self::StartTransaction(typed(payload)?)),
            "StopTransaction" => Ok(Self::StopTransaction(typed(payload)?)),
            "MeterValues" => Ok(Self::MeterValues(typed(payload)?)),
            other => Err(CallRejection::not_implemented(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BootNotification(_) => "BootNotification",
            Self::Heartbeat => "Heartbeat",
            Self::StatusNotification(_) => "StatusNotification",
            Self::Authorize(_) => "Authorize",
            Self::StartTransaction(_) => "StartTransaction",
            Self::StopTransaction(_) => "StopTransaction",
            Self::MeterValues(_) => "MeterValues",
        }
    }
}

// ── Request payloads ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(default)]
    pub charge_point_serial_number: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: u32,
    pub status: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_tag: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i64,
    #[serde(default)]
    pub transaction_id: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    pub transaction_id: i64,
    pub meter_stop: i64,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: u32,
    #[serde(default)]
    pub transaction_id: Option<i64>,
    /// Raw sample objects; the handler extracts the energy measurand and
    /// keeps the original for audit.
    #[serde(default)]
    pub meter_value: Vec<Value>,
}

// ── Response payloads ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: RegistrationStatus,
    pub current_time: DateTime<Utc>,
    pub interval: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Accepted,
    Invalid,
    ConcurrentTx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub transaction_id: i64,
    pub id_tag_info: IdTagInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

/// `{}` — used by fire-and-forget actions per OCPP convention.
#[derive(Debug, Clone, Serialize)]
pub struct EmptyResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_boot_notification() {
        let payload = json!({
            "chargePointVendor": "VendorX",
            "chargePointModel": "ModelY",
            "chargePointSerialNumber": "SN1"
        });
        match CallAction::parse("BootNotification", payload).unwrap() {
            CallAction::BootNotification(req) => {
                assert_eq!(req.charge_point_vendor, "VendorX");
                assert_eq!(req.charge_point_serial_number.as_deref(), Some("SN1"));
                assert!(req.firmware_version.is_none());
            }
            other => panic!("Unexpected action: {:?}", other),
        }
    }

    #[test]
    fn parse_unknown_action_is_not_implemented() {
        let err = CallAction::parse("GetDiagnostics", json!({})).unwrap_err();
        assert_eq!(err.code, error_code::NOT_IMPLEMENTED);
    }

    #[test]
    fn parse_bad_payload_is_formation_violation() {
        let err = CallAction::parse("StartTransaction", json!({"connectorId": "one"})).unwrap_err();
        assert_eq!(err.code, error_code::FORMATION_VIOLATION);
    }

    #[test]
    fn responses_serialize_camel_case() {
        let resp = StartTransactionResponse {
            transaction_id: 7,
            id_tag_info: IdTagInfo {
                status: AuthorizationStatus::Accepted,
            },
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["transactionId"], 7);
        assert_eq!(value["idTagInfo"]["status"], "Accepted");
    }
}
