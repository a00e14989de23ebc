//! Append-only device event log entries

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Kind of audit/telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Heartbeat,
    StatusChange,
    Boot,
    Error,
}

impl DeviceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::StatusChange => "status_change",
            Self::Boot => "boot",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for DeviceEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit/telemetry log row, keyed by charge point and timestamp.
/// Never mutated after insert.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub charge_point_id: String,
    pub kind: DeviceEventKind,
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
}

impl DeviceEvent {
    pub fn new(charge_point_id: impl Into<String>, kind: DeviceEventKind, detail: Value) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            kind,
            detail,
            timestamp: Utc::now(),
        }
    }
}
