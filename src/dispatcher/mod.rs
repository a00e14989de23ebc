//! Protocol dispatcher
//!
//! The single transport-independent entry point for inbound OCPP Calls.
//! Payloads are parsed into typed actions at this boundary; each action
//! has its own handler module. The device is authoritative for EVSE
//! state, so handlers apply what was reported and answer permissively
//! rather than failing the whole call.

mod authorize;
mod boot_notification;
mod heartbeat;
mod meter_values;
mod start_transaction;
mod status_notification;
mod stop_transaction;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::protocol::{CallAction, CallRejection};
use crate::storage::GatewayStore;
use crate::transport::InboundHandler;

/// Transport-independent handler for device-initiated calls.
pub struct ProtocolDispatcher {
    store: Arc<dyn GatewayStore>,
    /// Heartbeat cadence handed to devices in BootNotification, seconds.
    heartbeat_interval: u32,
}

impl ProtocolDispatcher {
    pub fn new(store: Arc<dyn GatewayStore>, heartbeat_interval: u32) -> Self {
        Self {
            store,
            heartbeat_interval,
        }
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        &self.store
    }
}

#[async_trait]
impl InboundHandler for ProtocolDispatcher {
    async fn handle_call(
        &self,
        charge_point_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CallRejection> {
        let call = CallAction::parse(action, payload)?;
        debug!(charge_point_id, action = call.name(), "Dispatching call");
        metrics::counter!("ocpp_calls_total", "action" => call.name()).increment(1);

        match call {
            CallAction::BootNotification(req) => {
                to_payload(boot_notification::handle_boot_notification(self, charge_point_id, req).await)
            }
            CallAction::Heartbeat => {
                to_payload(heartbeat::handle_heartbeat(self, charge_point_id).await)
            }
            CallAction::StatusNotification(req) => {
                to_payload(status_notification::handle_status_notification(self, charge_point_id, req).await)
            }
            CallAction::Authorize(req) => {
                to_payload(authorize::handle_authorize(self, charge_point_id, req).await)
            }
            CallAction::StartTransaction(req) => {
                to_payload(start_transaction::handle_start_transaction(self, charge_point_id, req).await)
            }
            CallAction::StopTransaction(req) => {
                to_payload(stop_transaction::handle_stop_transaction(self, charge_point_id, req).await)
            }
            CallAction::MeterValues(req) => {
                to_payload(meter_values::handle_meter_values(self, charge_point_id, req).await)
            }
        }
    }
}

fn to_payload<T: Serialize>(response: T) -> Result<Value, CallRejection> {
    serde_json::to_value(response).map_err(CallRejection::internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EvseState, SessionStatus};
    use crate::protocol::error_code;
    use crate::storage::InMemoryGatewayStore;
    use serde_json::json;

    const CP: &str = "CP100";

    fn dispatcher() -> (ProtocolDispatcher, Arc<InMemoryGatewayStore>) {
        let store = Arc::new(InMemoryGatewayStore::new());
        let dispatcher = ProtocolDispatcher::new(store.clone() as Arc<dyn GatewayStore>, 300);
        (dispatcher, store)
    }

    async fn boot(dispatcher: &ProtocolDispatcher) -> Value {
        dispatcher
            .handle_call(
                CP,
                "BootNotification",
                json!({"chargePointVendor": "VendorX", "chargePointModel": "ModelY"}),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_charging_flow() {
        let (dispatcher, store) = dispatcher();

        // Boot registers the charge point and its first EVSE
        let boot_resp = boot(&dispatcher).await;
        assert_eq!(boot_resp["status"], "Accepted");
        assert_eq!(boot_resp["interval"], 300);
        assert!(store.get_charge_point(CP).await.unwrap().is_some());
        assert!(store.get_evse_status(CP, 1).await.unwrap().is_some());

        // Device reports Preparing
        let status_resp = dispatcher
            .handle_call(
                CP,
                "StatusNotification",
                json!({"connectorId": 1, "status": "Preparing"}),
            )
            .await
            .unwrap();
        assert_eq!(status_resp, json!({}));

        // Transaction starts
        let start_resp = dispatcher
            .handle_call(
                CP,
                "StartTransaction",
                json!({"connectorId": 1, "idTag": "TAG1", "meterStart": 0}),
            )
            .await
            .unwrap();
        assert_eq!(start_resp["idTagInfo"]["status"], "Accepted");
        let transaction_id = start_resp["transactionId"].as_i64().unwrap();
        assert!(transaction_id > 0);

        // A meter sample lands on the ongoing session
        let meter_resp = dispatcher
            .handle_call(
                CP,
                "MeterValues",
                json!({
                    "connectorId": 1,
                    "transactionId": transaction_id,
                    "meterValue": [{
                        "timestamp": "2026-01-15T10:00:00Z",
                        "sampledValue": [{
                            "value": "209",
                            "measurand": "Energy.Active.Import.Register"
                        }]
                    }]
                }),
            )
            .await
            .unwrap();
        assert_eq!(meter_resp, json!({}));

        let session = store
            .find_ongoing_session(CP, transaction_id)
            .await
            .unwrap()
            .unwrap();
        let samples = store.list_meter_values(session.id).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 209);

        // Stop closes the session and frees the EVSE
        let stop_resp = dispatcher
            .handle_call(
                CP,
                "StopTransaction",
                json!({"transactionId": transaction_id, "meterStop": 209}),
            )
            .await
            .unwrap();
        assert_eq!(stop_resp["idTagInfo"]["status"], "Accepted");

        let session = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.meter_stop, Some(209));
        let status = store.get_evse_status(CP, 1).await.unwrap().unwrap();
        assert_eq!(status.state, EvseState::Available);
        assert!(status.current_session.is_none());
    }

    #[tokio::test]
    async fn concurrent_start_transactions_one_wins() {
        let (dispatcher, _store) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        boot(&dispatcher).await;

        let payload = json!({"connectorId": 1, "idTag": "TAG1", "meterStart": 0});
        let a = {
            let dispatcher = dispatcher.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                dispatcher
                    .handle_call(CP, "StartTransaction", payload)
                    .await
                    .unwrap()
            })
        };
        let b = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .handle_call(CP, "StartTransaction", payload)
                    .await
                    .unwrap()
            })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let statuses = [
            a["idTagInfo"]["status"].as_str().unwrap().to_string(),
            b["idTagInfo"]["status"].as_str().unwrap().to_string(),
        ];
        assert!(statuses.contains(&"Accepted".to_string()));
        assert!(statuses.contains(&"ConcurrentTx".to_string()));

        // The loser got transactionId 0
        for resp in [&a, &b] {
            if resp["idTagInfo"]["status"] == "ConcurrentTx" {
                assert_eq!(resp["transactionId"], 0);
            }
        }
    }

    #[tokio::test]
    async fn boot_serial_becomes_charge_point_id() {
        let (dispatcher, store) = dispatcher();

        let resp = dispatcher
            .handle_call(
                "WS-CP-01",
                "BootNotification",
                json!({
                    "chargePointVendor": "VendorX",
                    "chargePointModel": "ModelY",
                    "chargePointSerialNumber": "SN1"
                }),
            )
            .await
            .unwrap();
        assert_eq!(resp["status"], "Accepted");

        // The serial is the identity; nothing registers under the
        // sanitized connection id
        let cp = store.get_charge_point("SN1").await.unwrap().unwrap();
        assert_eq!(cp.serial_number.as_deref(), Some("SN1"));
        assert!(store.get_charge_point("WSCP01").await.unwrap().is_none());
        assert!(store.get_evse_status("SN1", 1).await.unwrap().is_some());

        // A later boot from another connection maps back by serial
        dispatcher
            .handle_call(
                "OTHER-CONN",
                "BootNotification",
                json!({
                    "chargePointVendor": "VendorX",
                    "chargePointModel": "ModelY",
                    "chargePointSerialNumber": "SN1"
                }),
            )
            .await
            .unwrap();
        assert!(store.get_charge_point("OTHERCONN").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reboot_restores_evse_one_available() {
        let (dispatcher, store) = dispatcher();
        boot(&dispatcher).await;

        store.sweep_offline(CP).await.unwrap();
        let status = store.get_evse_status(CP, 1).await.unwrap().unwrap();
        assert_eq!(status.state, EvseState::Unavailable);

        boot(&dispatcher).await;
        let status = store.get_evse_status(CP, 1).await.unwrap().unwrap();
        assert_eq!(status.state, EvseState::Available);
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let (dispatcher, _store) = dispatcher();
        let err = dispatcher
            .handle_call(CP, "GetDiagnostics", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_code::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn heartbeat_always_answers_with_time() {
        let (dispatcher, _store) = dispatcher();
        // No boot first: heartbeat still succeeds
        let resp = dispatcher.handle_call(CP, "Heartbeat", json!({})).await.unwrap();
        assert!(resp["currentTime"].is_string());
    }

    #[tokio::test]
    async fn stop_without_session_is_still_accepted() {
        let (dispatcher, _store) = dispatcher();
        boot(&dispatcher).await;
        let resp = dispatcher
            .handle_call(CP, "StopTransaction", json!({"transactionId": 999, "meterStop": 5}))
            .await
            .unwrap();
        assert_eq!(resp["idTagInfo"]["status"], "Accepted");
    }

    #[tokio::test]
    async fn available_status_closes_stuck_session() {
        let (dispatcher, store) = dispatcher();
        boot(&dispatcher).await;

        let start_resp = dispatcher
            .handle_call(
                CP,
                "StartTransaction",
                json!({"connectorId": 1, "idTag": "TAG1", "meterStart": 10}),
            )
            .await
            .unwrap();
        let transaction_id = start_resp["transactionId"].as_i64().unwrap();

        dispatcher
            .handle_call(
                CP,
                "StatusNotification",
                json!({"connectorId": 1, "status": "Available"}),
            )
            .await
            .unwrap();

        assert!(store
            .find_ongoing_session(CP, transaction_id)
            .await
            .unwrap()
            .is_none());
    }
}
