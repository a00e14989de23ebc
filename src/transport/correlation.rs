//! Request/response correlation
//!
//! The pending-call table is the only cross-transport shared mutable
//! state. Each entry is removed exactly once: whichever of the resolving
//! response or the timeout cleanup gets there first wins, and a late
//! arrival for a missing entry is logged and dropped by the caller.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use super::CommandError;

/// A pending CSMS-initiated call waiting for its response.
struct PendingCall {
    charge_point_id: String,
    action: String,
    responder: oneshot::Sender<Result<Value, CommandError>>,
}

/// Correlation table: `correlation_id → waiter`.
pub struct PendingCalls {
    calls: DashMap<String, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Register a waiter for `correlation_id` and return its receiver.
    pub fn register(
        &self,
        correlation_id: &str,
        charge_point_id: &str,
        action: &str,
    ) -> oneshot::Receiver<Result<Value, CommandError>> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            correlation_id.to_string(),
            PendingCall {
                charge_point_id: charge_point_id.to_string(),
                action: action.to_string(),
                responder: tx,
            },
        );
        rx
    }

    /// Resolve a waiter. Returns the `(charge_point_id, action)` of the
    /// completed call, or `None` if no waiter was registered (the caller
    /// most likely timed out already).
    pub fn complete(
        &self,
        correlation_id: &str,
        result: Result<Value, CommandError>,
    ) -> Option<(String, String)> {
        // Remove first: single resolution even against a racing timeout.
        let (_, pending) = self.calls.remove(correlation_id)?;
        let _ = pending.responder.send(result);
        Some((pending.charge_point_id, pending.action))
    }

    /// Drop a waiter after timeout or send failure. Returns `false` if it
    /// was already resolved.
    pub fn abandon(&self, correlation_id: &str) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    /// Fail every in-flight call for a disconnecting charge point.
    pub fn disconnect(&self, charge_point_id: &str) {
        let ids: Vec<String> = self
            .calls
            .iter()
            .filter(|entry| entry.charge_point_id == charge_point_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.complete(&id, Err(CommandError::NotConnected(charge_point_id.into())));
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn complete_resolves_the_waiter_once() {
        let pending = PendingCalls::new();
        let rx = pending.register("c1", "CP1", "Reset");

        let completed = pending.complete("c1", Ok(json!({"status": "Accepted"})));
        assert_eq!(completed, Some(("CP1".to_string(), "Reset".to_string())));

        // Second resolution finds nothing
        assert!(pending.complete("c1", Ok(json!({}))).is_none());

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["status"], "Accepted");
    }

    #[tokio::test]
    async fn abandon_beats_late_response() {
        let pending = PendingCalls::new();
        let _rx = pending.register("c1", "CP1", "Reset");

        assert!(pending.abandon("c1"));
        // The late response is dropped, not double-delivered
        assert!(pending.complete("c1", Ok(json!({}))).is_none());
        assert!(!pending.abandon("c1"));
    }

    #[tokio::test]
    async fn disconnect_fails_only_that_charge_point() {
        let pending = PendingCalls::new();
        let rx1 = pending.register("c1", "CP1", "Reset");
        let rx2 = pending.register("c2", "CP2", "Reset");

        pending.disconnect("CP1");

        assert!(matches!(
            rx1.await.unwrap(),
            Err(CommandError::NotConnected(_))
        ));
        assert_eq!(pending.len(), 1);
        drop(rx2);
    }
}
