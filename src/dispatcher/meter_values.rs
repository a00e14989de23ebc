//! MeterValues handler
//!
//! Each sample is attached to the session it belongs to: by transactionId
//! when the device echoes one, otherwise by whichever session currently
//! occupies the connector. Samples with no resolvable session are dropped
//! (the raw JSON still went through the access log at the transport).

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::domain::{ChargingSession, MeterValue};
use crate::protocol::{EmptyResponse, MeterValuesRequest};

use super::ProtocolDispatcher;

const ENERGY_MEASURAND: &str = "Energy.Active.Import.Register";

pub async fn handle_meter_values(
    dispatcher: &ProtocolDispatcher,
    charge_point_id: &str,
    request: MeterValuesRequest,
) -> EmptyResponse {
    info!(
        charge_point_id,
        connector_id = request.connector_id,
        samples = request.meter_value.len(),
        "MeterValues"
    );

    let session = match resolve_session(dispatcher, charge_point_id, &request).await {
        Some(session) => session,
        None => {
            debug!(
                charge_point_id,
                connector_id = request.connector_id,
                "No session for meter values; dropping"
            );
            return EmptyResponse {};
        }
    };

    for sample in &request.meter_value {
        let Some(value) = extract_energy_wh(sample) else {
            debug!(charge_point_id, "Sample without energy reading; skipping");
            continue;
        };
        let timestamp = sample
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);

        let meter_value = MeterValue {
            session_id: session.id,
            timestamp,
            value,
            raw_sample: sample.clone(),
        };
        if let Err(e) = dispatcher.store.append_meter_value(meter_value).await {
            warn!(charge_point_id, error = %e, "Failed to append meter value");
        }
    }

    EmptyResponse {}
}

async fn resolve_session(
    dispatcher: &ProtocolDispatcher,
    charge_point_id: &str,
    request: &MeterValuesRequest,
) -> Option<ChargingSession> {
    if let Some(transaction_id) = request.transaction_id {
        if let Ok(found) = dispatcher
            .store
            .find_ongoing_session(charge_point_id, transaction_id)
            .await
        {
            if found.is_some() {
                return found;
            }
        }
    }
    // No (or stale) transaction id: fall back to the connector's current
    // occupant.
    let status = dispatcher
        .store
        .get_evse_status(charge_point_id, request.connector_id)
        .await
        .ok()??;
    let session_id = status.current_session?;
    dispatcher.store.get_session(session_id).await.ok()?
}

/// Pull the energy register reading out of one OCPP meter sample.
///
/// Preference order: the explicit `Energy.Active.Import.Register`
/// measurand, then a sampled value with no measurand (which defaults to
/// the energy register per OCPP 1.6), then a bare `value` field as some
/// simplified devices send.
fn extract_energy_wh(sample: &Value) -> Option<i64> {
    if let Some(sampled) = sample.get("sampledValue").and_then(|v| v.as_array()) {
        if let Some(value) = sampled
            .iter()
            .find(|sv| sv.get("measurand").and_then(|m| m.as_str()) == Some(ENERGY_MEASURAND))
            .and_then(numeric_value)
        {
            return Some(value);
        }
        if let Some(value) = sampled
            .iter()
            .find(|sv| sv.get("measurand").is_none())
            .and_then(numeric_value)
        {
            return Some(value);
        }
        return None;
    }
    sample.get("value").and_then(|v| as_wh(v))
}

fn numeric_value(sampled_value: &Value) -> Option<i64> {
    sampled_value.get("value").and_then(as_wh)
}

fn as_wh(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_explicit_energy_measurand() {
        let sample = json!({
            "timestamp": "2026-01-15T10:00:00Z",
            "sampledValue": [
                {"value": "42.0", "measurand": "Voltage"},
                {"value": "209", "measurand": "Energy.Active.Import.Register"}
            ]
        });
        assert_eq!(extract_energy_wh(&sample), Some(209));
    }

    #[test]
    fn missing_measurand_defaults_to_energy() {
        let sample = json!({"sampledValue": [{"value": "1500"}]});
        assert_eq!(extract_energy_wh(&sample), Some(1500));
    }

    #[test]
    fn bare_value_field_is_accepted() {
        assert_eq!(extract_energy_wh(&json!({"value": 77})), Some(77));
    }

    #[test]
    fn non_energy_samples_yield_nothing() {
        let sample = json!({
            "sampledValue": [{"value": "230.1", "measurand": "Voltage"}]
        });
        assert_eq!(extract_energy_wh(&sample), None);
        assert_eq!(extract_energy_wh(&json!({})), None);
    }
}
