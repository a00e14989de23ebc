//! Transport-agnostic device messaging
//!
//! Every transport (MQTT, WebSocket, HTTP poll) plugs into a single
//! `TransportManager`. Inbound Calls are handed to the registered
//! `InboundHandler`, responses resolve the shared correlation table, and
//! outbound Calls are routed to the transport each charge point last
//! talked on.

mod correlation;
pub mod http_poll;
pub mod mqtt;
pub mod ws;

pub use correlation::PendingCalls;

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::liveness::LivenessHandle;
use crate::protocol::CallRejection;

/// Default wait for a device response to a CSMS-initiated call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// The transports a charge point can be reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Mqtt,
    WebSocket,
    HttpPoll,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::WebSocket => "websocket",
            Self::HttpPoll => "http-poll",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure modes of a CSMS-initiated call.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Charge point not connected: {0}")]
    NotConnected(String),
    #[error("Failed to send message: {0}")]
    SendFailed(String),
    #[error("Timed out waiting for device response")]
    Timeout,
    #[error("Device returned error {code}: {description}")]
    Remote { code: String, description: String },
    #[error("Device response was not usable: {0}")]
    InvalidResponse(String),
}

/// Protocol-layer sink for inbound device Calls.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one inbound Call and produce the response payload, or a
    /// rejection that the adapter turns into a CALLERROR.
    async fn handle_call(
        &self,
        charge_point_id: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, CallRejection>;
}

/// One transport's outbound surface.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether the adapter currently has a way to reach the charge point.
    fn is_connected(&self, charge_point_id: &str) -> bool;

    /// Push one CSMS-initiated Call to the device. Delivery only; the
    /// response comes back through `TransportManager::complete_response`.
    async fn send_call(
        &self,
        charge_point_id: &str,
        unique_id: &str,
        action: &str,
        payload: &Value,
    ) -> Result<(), CommandError>;
}

/// Shared hub between the protocol layer and the transport adapters.
pub struct TransportManager {
    adapters: RwLock<Vec<Arc<dyn TransportAdapter>>>,
    handler: OnceLock<Arc<dyn InboundHandler>>,
    pending: PendingCalls,
    /// Last transport each charge point was heard on.
    routes: DashMap<String, TransportKind>,
    liveness: LivenessHandle,
    call_timeout: Duration,
}

impl TransportManager {
    pub fn new(liveness: LivenessHandle, call_timeout: Duration) -> Self {
        Self {
            adapters: RwLock::new(Vec::new()),
            handler: OnceLock::new(),
            pending: PendingCalls::new(),
            routes: DashMap::new(),
            liveness,
            call_timeout,
        }
    }

    /// Wire in the protocol layer. Only the first registration wins.
    pub fn register_handler(&self, handler: Arc<dyn InboundHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("Inbound handler already registered; ignoring replacement");
        }
    }

    pub fn register_adapter(&self, adapter: Arc<dyn TransportAdapter>) {
        let mut adapters = self
            .adapters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        adapters.push(adapter);
    }

    /// Record activity from a charge point: refresh its liveness marker
    /// and remember which transport it spoke on.
    pub fn note_inbound(&self, charge_point_id: &str, kind: TransportKind) {
        self.routes.insert(charge_point_id.to_string(), kind);
        self.liveness.ping(charge_point_id);
    }

    /// Dispatch one inbound Call to the protocol layer.
    pub async fn handle_call(
        &self,
        charge_point_id: &str,
        kind: TransportKind,
        action: &str,
        payload: Value,
    ) -> Result<Value, CallRejection> {
        self.note_inbound(charge_point_id, kind);
        match self.handler.get() {
            Some(handler) => handler.handle_call(charge_point_id, action, payload).await,
            None => {
                warn!(charge_point_id, action, "No inbound handler registered");
                Err(CallRejection::internal("Gateway not ready"))
            }
        }
    }

    /// Resolve a device response against the correlation table. Returns
    /// the action of the completed call when a waiter was found.
    pub fn complete_response(
        &self,
        charge_point_id: &str,
        kind: TransportKind,
        correlation_id: &str,
        result: Result<Value, CommandError>,
    ) -> Option<String> {
        self.note_inbound(charge_point_id, kind);
        match self.pending.complete(correlation_id, result) {
            Some((_, action)) => Some(action),
            None => {
                // Most likely the call already timed out
                debug!(
                    charge_point_id,
                    correlation_id, "Response for unknown correlation id; dropping"
                );
                None
            }
        }
    }

    /// Fail all in-flight calls for a charge point that dropped its link.
    pub fn drop_charge_point(&self, charge_point_id: &str) {
        self.pending.disconnect(charge_point_id);
    }

    pub fn is_connected(&self, charge_point_id: &str) -> bool {
        self.pick_adapter(charge_point_id, None).is_some()
    }

    /// Transport each currently reachable adapter reports for the charge
    /// point, preferring the one it last spoke on.
    fn pick_adapter(
        &self,
        charge_point_id: &str,
        preferred: Option<TransportKind>,
    ) -> Option<Arc<dyn TransportAdapter>> {
        let adapters = self
            .adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let wanted = preferred.or_else(|| self.routes.get(charge_point_id).map(|r| *r.value()));
        if let Some(kind) = wanted {
            if let Some(adapter) = adapters
                .iter()
                .find(|a| a.kind() == kind && a.is_connected(charge_point_id))
            {
                return Some(adapter.clone());
            }
        }
        adapters
            .iter()
            .find(|a| a.is_connected(charge_point_id))
            .cloned()
    }

    /// Send a CSMS-initiated Call and wait for the device's response.
    pub async fn send_message(
        &self,
        charge_point_id: &str,
        action: &str,
        payload: Value,
        preferred: Option<TransportKind>,
        timeout: Option<Duration>,
    ) -> Result<Value, CommandError> {
        let adapter = self
            .pick_adapter(charge_point_id, preferred)
            .ok_or_else(|| CommandError::NotConnected(charge_point_id.to_string()))?;

        let correlation_id = Uuid::new_v4().to_string();
        let rx = self
            .pending
            .register(&correlation_id, charge_point_id, action);

        debug!(
            charge_point_id,
            action,
            correlation_id,
            transport = %adapter.kind(),
            "Sending call to device"
        );

        if let Err(e) = adapter
            .send_call(charge_point_id, &correlation_id, action, &payload)
            .await
        {
            self.pending.abandon(&correlation_id);
            return Err(e);
        }

        let wait = timeout.unwrap_or(self.call_timeout);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Waiter dropped without a response (adapter shutdown)
                Err(CommandError::SendFailed(
                    "Response channel closed".to_string(),
                ))
            }
            Err(_) => {
                self.pending.abandon(&correlation_id);
                warn!(charge_point_id, action, correlation_id, "Call timed out");
                Err(CommandError::Timeout)
            }
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct MockAdapter {
        kind: TransportKind,
        connected: bool,
        sent: Mutex<Vec<(String, String, String)>>,
    }

    impl MockAdapter {
        fn new(kind: TransportKind, connected: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                connected,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TransportAdapter for MockAdapter {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn is_connected(&self, _charge_point_id: &str) -> bool {
            self.connected
        }

        async fn send_call(
            &self,
            charge_point_id: &str,
            unique_id: &str,
            action: &str,
            _payload: &Value,
        ) -> Result<(), CommandError> {
            self.sent.lock().unwrap().push((
                charge_point_id.to_string(),
                unique_id.to_string(),
                action.to_string(),
            ));
            Ok(())
        }
    }

    fn manager() -> Arc<TransportManager> {
        Arc::new(TransportManager::new(
            LivenessHandle::disconnected(),
            Duration::from_millis(200),
        ))
    }

    #[tokio::test]
    async fn send_message_resolves_with_the_device_response() {
        let manager = manager();
        let adapter = MockAdapter::new(TransportKind::WebSocket, true);
        manager.register_adapter(adapter.clone());

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_message("CP1", "Reset", json!({"type": "Soft"}), None, None)
                    .await
            })
        };

        // Wait for the call to be registered, then answer it
        let unique_id = loop {
            if let Some((_, id, _)) = adapter.sent.lock().unwrap().first().cloned() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let action = manager.complete_response(
            "CP1",
            TransportKind::WebSocket,
            &unique_id,
            Ok(json!({"status": "Accepted"})),
        );
        assert_eq!(action.as_deref(), Some("Reset"));

        let result = task.await.unwrap().unwrap();
        assert_eq!(result["status"], "Accepted");
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_get_distinct_correlation_ids() {
        let manager = manager();
        let adapter = MockAdapter::new(TransportKind::Mqtt, true);
        manager.register_adapter(adapter.clone());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .send_message(&format!("CP{i}"), "Reset", json!({}), None, None)
                    .await
            }));
        }

        // Wait until every call is in flight
        while adapter.sent.lock().unwrap().len() < 8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sent = adapter.sent.lock().unwrap().clone();
        let mut ids: Vec<&str> = sent.iter().map(|(_, id, _)| id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8, "correlation ids must be unique");

        for (cp, id, _) in &sent {
            manager.complete_response(cp, TransportKind::Mqtt, id, Ok(json!({"ok": true})));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn timeout_cleans_up_the_pending_entry() {
        let manager = manager();
        manager.register_adapter(MockAdapter::new(TransportKind::WebSocket, true));

        let err = manager
            .send_message(
                "CP1",
                "Reset",
                json!({}),
                None,
                Some(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout));
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unreachable_charge_point_is_rejected_up_front() {
        let manager = manager();
        manager.register_adapter(MockAdapter::new(TransportKind::WebSocket, false));

        let err = manager
            .send_message("CP1", "Reset", json!({}), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotConnected(_)));
    }

    #[tokio::test]
    async fn route_prefers_last_seen_transport() {
        let manager = manager();
        let ws = MockAdapter::new(TransportKind::WebSocket, true);
        let mqtt = MockAdapter::new(TransportKind::Mqtt, true);
        manager.register_adapter(ws.clone());
        manager.register_adapter(mqtt.clone());

        manager.note_inbound("CP1", TransportKind::Mqtt);

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_message("CP1", "Reset", json!({}), None, None)
                    .await
            })
        };

        let unique_id = loop {
            if let Some((_, id, _)) = mqtt.sent.lock().unwrap().first().cloned() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(ws.sent.lock().unwrap().is_empty());

        manager.complete_response("CP1", TransportKind::Mqtt, &unique_id, Ok(json!({})));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_dropped() {
        let manager = manager();
        let adapter = MockAdapter::new(TransportKind::WebSocket, true);
        manager.register_adapter(adapter.clone());

        let err = manager
            .send_message(
                "CP1",
                "Reset",
                json!({}),
                None,
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout));

        let (_, unique_id, _) = adapter.sent.lock().unwrap().first().cloned().unwrap();
        let action = manager.complete_response(
            "CP1",
            TransportKind::WebSocket,
            &unique_id,
            Ok(json!({})),
        );
        assert!(action.is_none());
    }
}
