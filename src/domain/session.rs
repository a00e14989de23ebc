//! Charging session and meter sample entities

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Charging session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ongoing,
    Completed,
    /// Closed abnormally, e.g. by a status transition to `Available`
    /// while the transaction was still open.
    Cancelled,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ongoing => write!(f, "ongoing"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One OCPP transaction.
///
/// `(charge_point_id, evse_id, transaction_id)` is unique across all
/// sessions, enforced by the store.
#[derive(Debug, Clone)]
pub struct ChargingSession {
    /// Store-assigned surrogate id.
    pub id: i64,
    pub charge_point_id: String,
    pub evse_id: u32,
    pub transaction_id: i64,
    pub id_tag: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Meter reading at session start, in Wh.
    pub meter_start: i64,
    pub meter_stop: Option<i64>,
    pub status: SessionStatus,
    pub stop_reason: Option<String>,
}

impl ChargingSession {
    pub fn is_ongoing(&self) -> bool {
        self.status == SessionStatus::Ongoing
    }
}

/// Parameters for creating a session via the store.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub charge_point_id: String,
    pub evse_id: u32,
    /// `None` asks the store to generate a monotonically-distinct value.
    pub transaction_id: Option<i64>,
    pub id_tag: String,
    pub meter_start: i64,
    pub start_time: DateTime<Utc>,
}

/// One meter sample, append-only, owned by a session.
#[derive(Debug, Clone)]
pub struct MeterValue {
    pub session_id: i64,
    pub timestamp: DateTime<Utc>,
    /// Energy.Active.Import.Register reading, in Wh.
    pub value: i64,
    /// Original JSON sample, kept for audit.
    pub raw_sample: Value,
}
