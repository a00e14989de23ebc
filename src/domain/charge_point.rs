//! Charge point and EVSE domain entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single EVSE (connector), as reported by the device.
///
/// The device is authoritative: the dispatcher applies reported transitions
/// verbatim, with one safety rule around `Available` (see the status
/// notification handler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvseState {
    Available,
    Preparing,
    Charging,
    SuspendedEVSE,
    SuspendedEV,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl EvseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::SuspendedEVSE => "SuspendedEVSE",
            Self::SuspendedEV => "SuspendedEV",
            Self::Finishing => "Finishing",
            Self::Reserved => "Reserved",
            Self::Unavailable => "Unavailable",
            Self::Faulted => "Faulted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Available" => Some(Self::Available),
            "Preparing" => Some(Self::Preparing),
            "Charging" => Some(Self::Charging),
            "SuspendedEVSE" => Some(Self::SuspendedEVSE),
            "SuspendedEV" => Some(Self::SuspendedEV),
            "Finishing" => Some(Self::Finishing),
            "Reserved" => Some(Self::Reserved),
            "Unavailable" => Some(Self::Unavailable),
            "Faulted" => Some(Self::Faulted),
            _ => None,
        }
    }
}

impl Default for EvseState {
    fn default() -> Self {
        Self::Available
    }
}

impl std::fmt::Display for EvseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Charge point connectivity, maintained by the liveness monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Heard from recently (liveness marker alive)
    Online,
    /// Liveness marker expired
    Offline,
    /// Never connected
    Unknown,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "Online"),
            Self::Offline => write!(f, "Offline"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One EVSE (pluggable outlet) on a charge point.
#[derive(Debug, Clone)]
pub struct Evse {
    pub charge_point_id: String,
    pub evse_id: u32,
}

/// Live status of one EVSE.
///
/// Invariant: `state == Available` implies `current_session.is_none()`.
#[derive(Debug, Clone)]
pub struct EvseStatus {
    pub charge_point_id: String,
    pub evse_id: u32,
    pub state: EvseState,
    pub last_seen: DateTime<Utc>,
    /// Surrogate id of the session currently occupying this EVSE, if any.
    pub current_session: Option<i64>,
}

impl EvseStatus {
    pub fn new(charge_point_id: impl Into<String>, evse_id: u32) -> Self {
        Self {
            charge_point_id: charge_point_id.into(),
            evse_id,
            state: EvseState::default(),
            last_seen: Utc::now(),
            current_session: None,
        }
    }
}

/// Charge point entity, created/updated on BootNotification.
#[derive(Debug, Clone)]
pub struct ChargePoint {
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub connectivity: Connectivity,
    pub registered_at: DateTime<Utc>,
}

impl ChargePoint {
    pub fn new(id: impl Into<String>, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vendor: vendor.into(),
            model: model.into(),
            firmware_version: None,
            serial_number: None,
            connectivity: Connectivity::default(),
            registered_at: Utc::now(),
        }
    }

    /// Strip a caller-supplied identifier to alphanumerics only.
    ///
    /// Identifiers end up in MQTT topics and URL paths, so anything else is
    /// dropped before the first boot persists the charge point.
    pub fn sanitize_id(raw: &str) -> String {
        raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evse_state_roundtrip() {
        for state in [
            EvseState::Available,
            EvseState::Preparing,
            EvseState::Charging,
            EvseState::SuspendedEVSE,
            EvseState::SuspendedEV,
            EvseState::Finishing,
            EvseState::Reserved,
            EvseState::Unavailable,
            EvseState::Faulted,
        ] {
            assert_eq!(EvseState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn evse_state_rejects_unknown() {
        assert_eq!(EvseState::parse("Charging2"), None);
        assert_eq!(EvseState::parse(""), None);
    }

    #[test]
    fn sanitize_strips_topic_metacharacters() {
        assert_eq!(ChargePoint::sanitize_id("CP-01/../#+x"), "CP01x");
        assert_eq!(ChargePoint::sanitize_id("SN12345678901234"), "SN12345678901234");
    }
}
