//! Heartbeat handler

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::{DeviceEvent, DeviceEventKind};
use crate::protocol::HeartbeatResponse;

use super::ProtocolDispatcher;

pub async fn handle_heartbeat(
    dispatcher: &ProtocolDispatcher,
    charge_point_id: &str,
) -> HeartbeatResponse {
    debug!(charge_point_id, "Heartbeat");

    // Bookkeeping is best-effort; the device always gets the current time
    // back so its clock stays in sync.
    if let Err(e) = dispatcher.store.touch_evses(charge_point_id).await {
        warn!(charge_point_id, error = %e, "Failed to touch EVSEs on heartbeat");
    }
    let event = DeviceEvent::new(charge_point_id, DeviceEventKind::Heartbeat, json!({}));
    if let Err(e) = dispatcher.store.record_event(event).await {
        warn!(charge_point_id, error = %e, "Failed to record heartbeat event");
    }

    HeartbeatResponse {
        current_time: Utc::now(),
    }
}
