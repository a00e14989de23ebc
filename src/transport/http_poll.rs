//! HTTP long-poll transport
//!
//! Fallback for devices that cannot hold a socket open. The device POSTs
//! envelopes to `/poll/v1/{serial}/message` and fetches queued
//! gateway-initiated calls from `/poll/v1/{serial}/inbox`, optionally
//! long-polling with `?wait=<seconds>`. Both endpoints require HTTP Basic
//! credentials derived the same way as the broker password.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::CredentialStore;
use crate::protocol::{Envelope, WireFormat};
use crate::shutdown::ShutdownSignal;
use crate::transport::{CommandError, TransportAdapter, TransportKind, TransportManager};

/// Longest supported `?wait=` value.
const MAX_WAIT_SECS: u64 = 25;

/// Per-device outbound queue.
struct Mailbox {
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    last_poll: Mutex<Instant>,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            last_poll: Mutex::new(Instant::now()),
        }
    }
}

/// HTTP long-poll transport adapter.
pub struct HttpPollAdapter {
    bind_addr: String,
    manager: Arc<TransportManager>,
    credentials: Arc<CredentialStore>,
    mailboxes: DashMap<String, Arc<Mailbox>>,
    /// `charge_point_id → serial` routing for outbound calls.
    serials: DashMap<String, String>,
    formats: DashMap<String, WireFormat>,
    aliases: DashMap<(String, String), String>,
    /// How recently a device must have polled to count as reachable.
    poll_window: Duration,
    shutdown: ShutdownSignal,
}

impl HttpPollAdapter {
    pub fn new(
        bind_addr: String,
        manager: Arc<TransportManager>,
        credentials: Arc<CredentialStore>,
        poll_window: Duration,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            manager,
            credentials,
            mailboxes: DashMap::new(),
            serials: DashMap::new(),
            formats: DashMap::new(),
            aliases: DashMap::new(),
            poll_window,
            shutdown,
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/poll/v1/{serial}/message", post(post_message))
            .route("/poll/v1/{serial}/inbox", get(get_inbox))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve the poll endpoints until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        info!("HTTP poll transport listening on http://{}/poll/v1", self.bind_addr);
        let shutdown = self.shutdown.clone();
        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;
        info!("HTTP poll transport shut down");
        Ok(())
    }

    fn mailbox(&self, serial_number: &str) -> Arc<Mailbox> {
        self.mailboxes
            .entry(serial_number.to_string())
            .or_insert_with(|| Arc::new(Mailbox::new()))
            .clone()
    }

    async fn authorize(&self, serial_number: &str, headers: &HeaderMap) -> Result<(), Response> {
        let denied = || {
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"ocpp-gateway\"")],
                Json(json!({"error": "unauthorized"})),
            )
                .into_response()
        };

        let (username, password) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_basic)
            .ok_or_else(denied)?;

        self.credentials
            .validate_basic(serial_number, &username, &password)
            .await
            .map_err(|e| {
                warn!(serial_number, error = %e, "Rejected poll request");
                denied()
            })
    }

    /// Record that the device is alive on this transport.
    async fn note_device(&self, serial_number: &str) -> String {
        let charge_point_id = self.credentials.charge_point_id_for(serial_number).await;
        self.serials
            .insert(charge_point_id.clone(), serial_number.to_string());
        *self.mailbox(serial_number).last_poll.lock().await = Instant::now();
        self.manager
            .note_inbound(&charge_point_id, TransportKind::HttpPoll);
        charge_point_id
    }

    async fn handle_envelope(
        &self,
        serial_number: &str,
        charge_point_id: &str,
        text: &str,
    ) -> Response {
        let (envelope, format) = match Envelope::decode(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": e.to_string()})),
                )
                    .into_response();
            }
        };
        self.formats.insert(serial_number.to_string(), format);

        match envelope {
            Envelope::Call {
                unique_id,
                action,
                payload,
            } => {
                let reply = match self
                    .manager
                    .handle_call(charge_point_id, TransportKind::HttpPoll, &action, payload)
                    .await
                {
                    Ok(response) => Envelope::result_reply(&unique_id, &action, response),
                    Err(rejection) => Envelope::error_reply(
                        &unique_id,
                        &action,
                        rejection.code,
                        &rejection.description,
                    ),
                };
                match reply.encode(format) {
                    Ok(body) => (
                        StatusCode::OK,
                        [(header::CONTENT_TYPE, "application/json")],
                        body,
                    )
                        .into_response(),
                    Err(e) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"error": e.to_string()})),
                    )
                        .into_response(),
                }
            }
            Envelope::CallResult {
                unique_id,
                payload,
                action,
            } => {
                match self.resolve_correlation(serial_number, &unique_id, action) {
                    Some(correlation_id) => {
                        self.manager.complete_response(
                            charge_point_id,
                            TransportKind::HttpPoll,
                            &correlation_id,
                            Ok(payload),
                        );
                    }
                    None => warn!(charge_point_id, "Uncorrelatable poll response; dropping"),
                }
                StatusCode::NO_CONTENT.into_response()
            }
            Envelope::CallError {
                unique_id,
                error_code,
                error_description,
                action,
                ..
            } => {
                match self.resolve_correlation(serial_number, &unique_id, action) {
                    Some(correlation_id) => {
                        self.manager.complete_response(
                            charge_point_id,
                            TransportKind::HttpPoll,
                            &correlation_id,
                            Err(CommandError::Remote {
                                code: error_code,
                                description: error_description,
                            }),
                        );
                    }
                    None => warn!(charge_point_id, "Uncorrelatable poll error; dropping"),
                }
                StatusCode::NO_CONTENT.into_response()
            }
        }
    }

    fn resolve_correlation(
        &self,
        serial_number: &str,
        unique_id: &str,
        action: Option<String>,
    ) -> Option<String> {
        if !unique_id.is_empty() {
            return Some(unique_id.to_string());
        }
        let action = action?;
        self.aliases
            .remove(&(serial_number.to_string(), action))
            .map(|(_, correlation_id)| correlation_id)
    }

    /// Drain queued calls, long-polling up to `wait` if the queue is empty.
    async fn drain_inbox(&self, serial_number: &str, wait: Duration) -> Vec<Value> {
        let mailbox = self.mailbox(serial_number);
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut queue = mailbox.queue.lock().await;
                if !queue.is_empty() {
                    return queue
                        .drain(..)
                        .filter_map(|text| serde_json::from_str(&text).ok())
                        .collect();
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            tokio::select! {
                _ = mailbox.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Vec::new(),
            }
        }
    }
}

#[async_trait]
impl TransportAdapter for HttpPollAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpPoll
    }

    fn is_connected(&self, charge_point_id: &str) -> bool {
        let serial = match self.serials.get(charge_point_id) {
            Some(serial) => serial.clone(),
            None => return false,
        };
        match self.mailboxes.get(&serial) {
            Some(mailbox) => match mailbox.last_poll.try_lock() {
                Ok(last_poll) => last_poll.elapsed() < self.poll_window,
                // Contended lock means a poll is happening right now
                Err(_) => true,
            },
            None => false,
        }
    }

    async fn send_call(
        &self,
        charge_point_id: &str,
        unique_id: &str,
        action: &str,
        payload: &Value,
    ) -> Result<(), CommandError> {
        let serial_number = self
            .serials
            .get(charge_point_id)
            .map(|s| s.clone())
            .ok_or_else(|| CommandError::NotConnected(charge_point_id.to_string()))?;

        let format = self
            .formats
            .get(&serial_number)
            .map(|f| *f.value())
            .unwrap_or(WireFormat::Standard);

        if format == WireFormat::Simplified {
            self.aliases.insert(
                (serial_number.clone(), action.to_string()),
                unique_id.to_string(),
            );
        }

        let envelope = Envelope::Call {
            unique_id: unique_id.to_string(),
            action: action.to_string(),
            payload: payload.clone(),
        };
        let text = envelope
            .encode(format)
            .map_err(|e| CommandError::SendFailed(e.to_string()))?;

        let mailbox = self.mailbox(&serial_number);
        mailbox.queue.lock().await.push_back(text);
        // notify_one stores a permit, so a poller arriving between the
        // queue check and the wait still wakes immediately
        mailbox.notify.notify_one();
        debug!(charge_point_id, action, "Queued call for next poll");
        Ok(())
    }
}

/// Decode an HTTP Basic `Authorization` header value.
fn parse_basic(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[derive(Debug, Deserialize)]
struct InboxParams {
    wait: Option<u64>,
}

async fn post_message(
    State(adapter): State<Arc<HttpPollAdapter>>,
    Path(serial): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(denied) = adapter.authorize(&serial, &headers).await {
        return denied;
    }
    let charge_point_id = adapter.note_device(&serial).await;
    adapter.handle_envelope(&serial, &charge_point_id, &body).await
}

async fn get_inbox(
    State(adapter): State<Arc<HttpPollAdapter>>,
    Path(serial): Path<String>,
    Query(params): Query<InboxParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = adapter.authorize(&serial, &headers).await {
        return denied;
    }
    adapter.note_device(&serial).await;

    let wait = Duration::from_secs(params.wait.unwrap_or(0).min(MAX_WAIT_SECS));
    let messages = adapter.drain_inbox(&serial, wait).await;
    Json(messages).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SecretCipher;
    use crate::domain::Device;
    use crate::liveness::LivenessHandle;
    use crate::storage::{GatewayStore, InMemoryGatewayStore};
    use serde_json::json;

    const SERIAL: &str = "SN200";

    async fn fixture() -> (Arc<HttpPollAdapter>, Arc<TransportManager>) {
        let store = Arc::new(InMemoryGatewayStore::new());
        let cipher = SecretCipher::new(b"test-master-key");
        let encrypted = cipher.encrypt(b"secret").unwrap();
        store
            .upsert_device(Device::new(SERIAL, "EVC01", encrypted))
            .await
            .unwrap();

        let credentials = Arc::new(CredentialStore::new(
            store as Arc<dyn GatewayStore>,
            cipher,
        ));
        let manager = Arc::new(TransportManager::new(
            LivenessHandle::disconnected(),
            Duration::from_millis(300),
        ));
        let adapter = HttpPollAdapter::new(
            "127.0.0.1:0".to_string(),
            manager.clone(),
            credentials,
            Duration::from_secs(60),
            ShutdownSignal::new(),
        );
        manager.register_adapter(adapter.clone());
        (adapter, manager)
    }

    #[test]
    fn basic_header_parsing() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("SN200:pass123");
        assert_eq!(
            parse_basic(&format!("Basic {}", encoded)),
            Some(("SN200".to_string(), "pass123".to_string()))
        );
        assert!(parse_basic("Bearer token").is_none());
        assert!(parse_basic("Basic !!!").is_none());
    }

    #[tokio::test]
    async fn queued_call_is_drained_by_inbox() {
        let (adapter, _manager) = fixture().await;
        adapter.note_device(SERIAL).await;

        adapter
            .send_call(SERIAL, "corr-1", "Reset", &json!({"type": "Soft"}))
            .await
            .unwrap();

        let messages = adapter.drain_inbox(SERIAL, Duration::ZERO).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0][0], 2);
        assert_eq!(messages[0][1], "corr-1");
        assert_eq!(messages[0][2], "Reset");

        // Queue is drained
        assert!(adapter.drain_inbox(SERIAL, Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn long_poll_wakes_on_new_call() {
        let (adapter, _manager) = fixture().await;
        adapter.note_device(SERIAL).await;

        let waiter = {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                adapter
                    .drain_inbox(SERIAL, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        adapter
            .send_call(SERIAL, "corr-2", "Reset", &json!({}))
            .await
            .unwrap();

        let messages = waiter.await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn response_resolves_pending_call() {
        let (adapter, manager) = fixture().await;
        adapter.note_device(SERIAL).await;

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_message(SERIAL, "Reset", json!({}), None, None)
                    .await
            })
        };

        // Pick up the queued call to learn its correlation id
        let messages = adapter.drain_inbox(SERIAL, Duration::from_secs(1)).await;
        let correlation_id = messages[0][1].as_str().unwrap().to_string();

        let body = json!([3, correlation_id, {"status": "Accepted"}]).to_string();
        let response = adapter.handle_envelope(SERIAL, SERIAL, &body).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let result = task.await.unwrap().unwrap();
        assert_eq!(result["status"], "Accepted");
    }

    #[tokio::test]
    async fn unknown_charge_point_cannot_be_sent_to() {
        let (adapter, _manager) = fixture().await;
        let err = adapter
            .send_call("CP_NOWHERE", "c", "Reset", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotConnected(_)));
    }
}
