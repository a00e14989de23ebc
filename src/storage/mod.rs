//! Session & state store capability
//!
//! Storage technology is a deployment choice; the gateway only depends on
//! this trait. Session-affecting operations on a single EVSE are serialized
//! by the implementation (per-row guarded update), which is what makes
//! concurrent `StartTransaction`/`StatusNotification` on one connector
//! deterministic.

mod memory;

pub use memory::InMemoryGatewayStore;

use async_trait::async_trait;

use crate::domain::{
    ChargePoint, ChargingSession, Connectivity, Device, DeviceEvent, DomainResult, EvseState,
    EvseStatus, MeterValue, NewSession,
};

/// Outcome of a device-reported status transition.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub previous: EvseState,
    /// A session that was still `ongoing` when the EVSE went `Available`,
    /// closed implicitly by the transition.
    pub closed_session: Option<ChargingSession>,
}

/// Outcome of marking a charge point offline.
#[derive(Debug, Clone, Default)]
pub struct OfflineSweep {
    /// EVSEs flipped to `Unavailable`.
    pub marked: Vec<u32>,
    /// EVSEs left untouched because a charge was in progress.
    pub left_active: Vec<u32>,
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    // Charge points
    async fn get_charge_point(&self, id: &str) -> DomainResult<Option<ChargePoint>>;
    async fn find_charge_point_by_serial(&self, serial: &str)
        -> DomainResult<Option<ChargePoint>>;
    async fn upsert_charge_point(&self, charge_point: ChargePoint) -> DomainResult<()>;
    async fn set_connectivity(&self, id: &str, connectivity: Connectivity) -> DomainResult<()>;

    // EVSEs and their live status
    async fn ensure_evse(&self, charge_point_id: &str, evse_id: u32) -> DomainResult<()>;
    async fn get_evse_status(
        &self,
        charge_point_id: &str,
        evse_id: u32,
    ) -> DomainResult<Option<EvseStatus>>;
    async fn list_evse_statuses(&self, charge_point_id: &str) -> DomainResult<Vec<EvseStatus>>;
    /// Apply a device-reported state, creating the EVSE lazily. Going
    /// `Available` with an ongoing session closes that session.
    async fn apply_status(
        &self,
        charge_point_id: &str,
        evse_id: u32,
        state: EvseState,
    ) -> DomainResult<StatusTransition>;
    /// Refresh `last_seen` on every EVSE of the charge point.
    async fn touch_evses(&self, charge_point_id: &str) -> DomainResult<()>;
    /// Mark the charge point's EVSEs `Unavailable`, skipping any that are
    /// `Charging` or reference an ongoing session.
    async fn sweep_offline(&self, charge_point_id: &str) -> DomainResult<OfflineSweep>;

    // Charging sessions
    async fn start_session(&self, new: NewSession) -> DomainResult<ChargingSession>;
    /// Close the unique ongoing session for `(charge_point_id,
    /// transaction_id)`; flips the EVSE back to `Available` and clears its
    /// session reference. `None` if no such session.
    async fn stop_session(
        &self,
        charge_point_id: &str,
        transaction_id: i64,
        meter_stop: i64,
        reason: Option<String>,
    ) -> DomainResult<Option<ChargingSession>>;
    async fn find_ongoing_session(
        &self,
        charge_point_id: &str,
        transaction_id: i64,
    ) -> DomainResult<Option<ChargingSession>>;
    async fn get_session(&self, session_id: i64) -> DomainResult<Option<ChargingSession>>;

    // Meter samples (append-only)
    async fn append_meter_value(&self, value: MeterValue) -> DomainResult<()>;
    async fn list_meter_values(&self, session_id: i64) -> DomainResult<Vec<MeterValue>>;

    // Audit log (append-only)
    async fn record_event(&self, event: DeviceEvent) -> DomainResult<()>;

    // Device credentials
    async fn get_device(&self, serial_number: &str) -> DomainResult<Option<Device>>;
    async fn upsert_device(&self, device: Device) -> DomainResult<()>;
    async fn touch_device(&self, serial_number: &str) -> DomainResult<()>;
    async fn list_device_type_codes(&self) -> DomainResult<Vec<String>>;
}
