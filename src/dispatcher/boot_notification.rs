//! BootNotification handler
//!
//! Registers (or re-registers) the charge point. The reported serial
//! number is the preferred identity: a serial that maps to a known charge
//! point reclaims it (a replaced controller board keeps its history), and
//! a first boot with a serial registers under that serial. The
//! transport-level id is the fallback for devices that report none.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::domain::{ChargePoint, DeviceEvent, DeviceEventKind, EvseState};
use crate::protocol::{BootNotificationRequest, BootNotificationResponse, RegistrationStatus};

use super::ProtocolDispatcher;

pub async fn handle_boot_notification(
    dispatcher: &ProtocolDispatcher,
    charge_point_id: &str,
    request: BootNotificationRequest,
) -> BootNotificationResponse {
    info!(
        charge_point_id,
        vendor = request.charge_point_vendor.as_str(),
        model = request.charge_point_model.as_str(),
        "BootNotification"
    );

    let effective_id = resolve_subject(dispatcher, charge_point_id, &request).await;
    if effective_id.is_empty() {
        warn!(charge_point_id, "Boot with unusable charge point id; rejecting");
        return rejected(dispatcher.heartbeat_interval);
    }

    let mut charge_point = match dispatcher.store.get_charge_point(&effective_id).await {
        Ok(Some(existing)) => existing,
        Ok(None) => ChargePoint::new(
            &effective_id,
            &request.charge_point_vendor,
            &request.charge_point_model,
        ),
        Err(e) => {
            warn!(charge_point_id, error = %e, "Boot lookup failed; rejecting");
            return rejected(dispatcher.heartbeat_interval);
        }
    };

    charge_point.vendor = request.charge_point_vendor.clone();
    charge_point.model = request.charge_point_model.clone();
    charge_point.firmware_version = request.firmware_version.clone();
    if request.charge_point_serial_number.is_some() {
        charge_point.serial_number = request.charge_point_serial_number.clone();
    }

    if let Err(e) = dispatcher.store.upsert_charge_point(charge_point).await {
        warn!(charge_point_id, error = %e, "Boot persist failed; rejecting");
        return rejected(dispatcher.heartbeat_interval);
    }

    // Every charge point has at least one EVSE, and a reboot means the
    // device is back in service: EVSE 1 comes up Available even when an
    // offline sweep had marked it Unavailable.
    match dispatcher
        .store
        .apply_status(&effective_id, 1, EvseState::Available)
        .await
    {
        Ok(transition) => {
            if let Some(session) = transition.closed_session {
                warn!(
                    charge_point_id = effective_id.as_str(),
                    transaction_id = session.transaction_id,
                    "Reboot with open session; session cancelled"
                );
            }
        }
        Err(e) => {
            warn!(charge_point_id = effective_id.as_str(), error = %e, "Failed to reset EVSE 1");
        }
    }

    let event = DeviceEvent::new(
        &effective_id,
        DeviceEventKind::Boot,
        json!({
            "vendor": request.charge_point_vendor,
            "model": request.charge_point_model,
            "firmwareVersion": request.firmware_version,
            "serialNumber": request.charge_point_serial_number,
        }),
    );
    if let Err(e) = dispatcher.store.record_event(event).await {
        warn!(charge_point_id = effective_id.as_str(), error = %e, "Failed to record boot event");
    }

    BootNotificationResponse {
        status: RegistrationStatus::Accepted,
        current_time: Utc::now(),
        interval: dispatcher.heartbeat_interval,
    }
}

/// Pick the charge point identity the boot applies to.
async fn resolve_subject(
    dispatcher: &ProtocolDispatcher,
    charge_point_id: &str,
    request: &BootNotificationRequest,
) -> String {
    if let Some(serial) = &request.charge_point_serial_number {
        if let Ok(Some(existing)) = dispatcher.store.find_charge_point_by_serial(serial).await {
            if existing.id != charge_point_id {
                info!(
                    charge_point_id,
                    known_id = existing.id.as_str(),
                    "Boot serial maps to a known charge point; using its identity"
                );
            }
            return existing.id;
        }
    }

    // A charge point that already registered under the transport id keeps
    // that identity; the serial recorded above re-links future boots.
    let connection_id = ChargePoint::sanitize_id(charge_point_id);
    if !connection_id.is_empty() {
        if let Ok(Some(existing)) = dispatcher.store.get_charge_point(&connection_id).await {
            return existing.id;
        }
    }

    // First sight: the serial number is the identity when one is reported.
    if let Some(serial) = &request.charge_point_serial_number {
        let from_serial = ChargePoint::sanitize_id(serial);
        if !from_serial.is_empty() {
            return from_serial;
        }
    }
    connection_id
}

fn rejected(interval: u32) -> BootNotificationResponse {
    BootNotificationResponse {
        status: RegistrationStatus::Rejected,
        current_time: Utc::now(),
        interval,
    }
}
