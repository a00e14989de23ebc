//! StatusNotification handler
//!
//! The device is authoritative for connector state: reported transitions
//! are applied verbatim. The one safety rule lives in the store: going
//! `Available` while a session is still open force-closes that session,
//! so a crashed device can never leave a connector both free and billed.

use serde_json::json;
use tracing::{info, warn};

use crate::domain::{DeviceEvent, DeviceEventKind, EvseState};
use crate::protocol::{EmptyResponse, StatusNotificationRequest};

use super::ProtocolDispatcher;

pub async fn handle_status_notification(
    dispatcher: &ProtocolDispatcher,
    charge_point_id: &str,
    request: StatusNotificationRequest,
) -> EmptyResponse {
    info!(
        charge_point_id,
        connector_id = request.connector_id,
        status = request.status.as_str(),
        "StatusNotification"
    );

    let state = match EvseState::parse(&request.status) {
        Some(state) => state,
        None => {
            // Unknown vendor states are logged, not applied; the reply is
            // still a plain CALLRESULT so the device does not retry forever.
            warn!(
                charge_point_id,
                status = request.status.as_str(),
                "Unrecognized connector status; recording only"
            );
            let event = DeviceEvent::new(
                charge_point_id,
                DeviceEventKind::Error,
                json!({
                    "connectorId": request.connector_id,
                    "status": request.status,
                    "errorCode": request.error_code,
                }),
            );
            if let Err(e) = dispatcher.store.record_event(event).await {
                warn!(charge_point_id, error = %e, "Failed to record status event");
            }
            return EmptyResponse {};
        }
    };

    // connectorId 0 addresses the charge point as a whole; only the audit
    // row is written for it.
    let previous = if request.connector_id > 0 {
        match dispatcher
            .store
            .apply_status(charge_point_id, request.connector_id, state)
            .await
        {
            Ok(transition) => {
                if let Some(closed) = transition.closed_session {
                    warn!(
                        charge_point_id,
                        connector_id = request.connector_id,
                        transaction_id = closed.transaction_id,
                        "Available reported with open session; session cancelled"
                    );
                }
                Some(transition.previous)
            }
            Err(e) => {
                warn!(charge_point_id, error = %e, "Failed to apply status");
                None
            }
        }
    } else {
        None
    };

    let event = DeviceEvent::new(
        charge_point_id,
        DeviceEventKind::StatusChange,
        json!({
            "connectorId": request.connector_id,
            "from": previous.map(|s| s.as_str()),
            "to": state.as_str(),
            "errorCode": request.error_code,
        }),
    );
    if let Err(e) = dispatcher.store.record_event(event).await {
        warn!(charge_point_id, error = %e, "Failed to record status event");
    }

    EmptyResponse {}
}
