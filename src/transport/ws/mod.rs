//! OCPP 1.6 WebSocket transport
//!
//! Accepts charge-point connections at `ws://<host>:<port>/ocpp/{charge_point_id}`
//! (or with an explicit `?chargePointId=` query parameter) and bridges each
//! socket into the transport manager.

pub mod registry;

pub use registry::ConnectionRegistry;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::protocol::{error_code, Envelope, WireFormat};
use crate::shutdown::ShutdownSignal;
use crate::transport::{CommandError, TransportAdapter, TransportKind, TransportManager};

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// WebSocket transport adapter.
pub struct WsAdapter {
    bind_addr: String,
    registry: Arc<ConnectionRegistry>,
    manager: Arc<TransportManager>,
    shutdown: ShutdownSignal,
}

impl WsAdapter {
    pub fn new(bind_addr: String, manager: Arc<TransportManager>, shutdown: ShutdownSignal) -> Self {
        Self {
            bind_addr,
            registry: Arc::new(ConnectionRegistry::new()),
            manager,
            shutdown,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Accept loop. Runs until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(
            "OCPP WebSocket transport listening on ws://{}/ocpp/{{charge_point_id}}",
            self.bind_addr
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                _ = self.shutdown.notified().wait() => {
                    info!("WebSocket transport shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let registry = self.registry.clone();
        let manager = self.manager.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, registry, manager, shutdown).await {
                error!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

#[async_trait]
impl TransportAdapter for WsAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn is_connected(&self, charge_point_id: &str) -> bool {
        self.registry.is_connected(charge_point_id)
    }

    async fn send_call(
        &self,
        charge_point_id: &str,
        unique_id: &str,
        action: &str,
        payload: &Value,
    ) -> Result<(), CommandError> {
        let envelope = Envelope::Call {
            unique_id: unique_id.to_string(),
            action: action.to_string(),
            payload: payload.clone(),
        };
        let text = envelope
            .encode(WireFormat::Standard)
            .map_err(|e| CommandError::SendFailed(e.to_string()))?;
        self.registry
            .send_to(charge_point_id, text)
            .map_err(CommandError::SendFailed)
    }
}

/// Identify the charge point from the handshake: explicit `chargePointId`
/// query parameter first, then the `/ocpp/{id}` path segment.
fn extract_charge_point_id(path: &str, query: Option<&str>) -> Option<String> {
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == "chargePointId" && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    let path = path.trim_start_matches('/');
    if let Some(id) = path.strip_prefix("ocpp/") {
        let id = id.trim_start_matches('/');
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    if !path.is_empty() && !path.contains('/') {
        return Some(path.to_string());
    }
    None
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    manager: Arc<TransportManager>,
    shutdown: ShutdownSignal,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    debug!("New TCP connection from {}", addr);

    let mut charge_point_id: Option<String> = None;
    let mut subprotocol_ok = false;

    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, mut response: Response| {
            let path = req.uri().path();
            let requested_protocols = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            subprotocol_ok = requested_protocols
                .split(',')
                .map(|s| s.trim())
                .any(|p| p == OCPP_SUBPROTOCOL);

            if subprotocol_ok {
                if let Ok(value) = OCPP_SUBPROTOCOL.parse() {
                    response
                        .headers_mut()
                        .insert("Sec-WebSocket-Protocol", value);
                }
            }

            charge_point_id = extract_charge_point_id(path, req.uri().query());
            Ok(response)
        },
    )
    .await?;

    if !subprotocol_ok {
        // Handshake completes, then the socket closes with a protocol
        // error so the charge point sees a clean rejection.
        warn!(addr = %addr, "Client did not offer the {} subprotocol", OCPP_SUBPROTOCOL);
        let (mut sender, _) = ws_stream.split();
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Protocol,
                reason: "ocpp1.6 subprotocol required".into(),
            })))
            .await;
        return Ok(());
    }

    let charge_point_id = match charge_point_id {
        Some(id) => id,
        None => {
            warn!(addr = %addr, "No charge point id in handshake path; closing");
            let (mut sender, _) = ws_stream.split();
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "charge point id required".into(),
                })))
                .await;
            return Ok(());
        }
    };

    info!(charge_point_id, addr = %addr, "Charge point connected over WebSocket");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = registry.register(&charge_point_id, tx);
    manager.note_inbound(&charge_point_id, TransportKind::WebSocket);

    // Writer task: owns the socket sink
    let cp_id_send = charge_point_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            debug!(charge_point_id = cp_id_send.as_str(), "-> {}", msg);
            if let Err(e) = ws_sender.send(Message::Text(msg)).await {
                error!(charge_point_id = cp_id_send.as_str(), "Send error: {}", e);
                break;
            }
        }
    });

    // Reader task: decodes frames and dispatches into the manager
    let cp_id_recv = charge_point_id.clone();
    let recv_registry = registry.clone();
    let recv_manager = manager.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    debug!(charge_point_id = cp_id_recv.as_str(), "<- {}", text);
                    recv_registry.touch(&cp_id_recv);
                    if let Some(reply) =
                        process_inbound(&recv_manager, &cp_id_recv, &text).await
                    {
                        if let Err(e) = recv_registry.send_to(&cp_id_recv, reply) {
                            error!(
                                charge_point_id = cp_id_recv.as_str(),
                                "Failed to send response: {}", e
                            );
                            break;
                        }
                    }
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    recv_registry.touch(&cp_id_recv);
                    recv_manager.note_inbound(&cp_id_recv, TransportKind::WebSocket);
                }
                Ok(Message::Close(frame)) => {
                    debug!(
                        charge_point_id = cp_id_recv.as_str(),
                        "Close frame received: {:?}", frame
                    );
                    break;
                }
                Ok(Message::Binary(data)) => {
                    warn!(
                        charge_point_id = cp_id_recv.as_str(),
                        "Ignoring binary message ({} bytes)",
                        data.len()
                    );
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    error!(charge_point_id = cp_id_recv.as_str(), "WebSocket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
        _ = shutdown.notified().wait() => {
            debug!(charge_point_id, "Connection closing due to server shutdown");
        }
    }

    registry.unregister(&charge_point_id, connection_id);
    manager.drop_charge_point(&charge_point_id);
    info!(charge_point_id, "Charge point disconnected");

    Ok(())
}

/// Decode one inbound frame and produce the reply text, if any. The reply
/// mirrors the wire format the charge point spoke.
async fn process_inbound(
    manager: &TransportManager,
    charge_point_id: &str,
    text: &str,
) -> Option<String> {
    let (envelope, format) = match Envelope::decode(text) {
        Ok(decoded) => decoded,
        Err(e) => {
            // A malformed call with a recoverable unique id still gets a
            // CALLERROR; anything else can only be dropped.
            return match Envelope::salvage_unique_id(text) {
                Some(unique_id) => {
                    warn!(charge_point_id, error = %e, "Malformed frame; answering CALLERROR");
                    Envelope::error_reply(
                        &unique_id,
                        "",
                        error_code::FORMATION_VIOLATION,
                        e.to_string(),
                    )
                    .encode(WireFormat::Standard)
                    .ok()
                }
                None => {
                    warn!(charge_point_id, error = %e, "Undecodable frame; dropping");
                    None
                }
            };
        }
    };

    match envelope {
        Envelope::Call {
            unique_id,
            action,
            payload,
        } => {
            let reply = match manager
                .handle_call(charge_point_id, TransportKind::WebSocket, &action, payload)
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
                Ok(text) => Some(text),
                Err(e) => {
                    error!(charge_point_id, error = %e, "Failed to encode reply");
                    None
                }
            }
        }
        Envelope::CallResult { unique_id, payload, .. } => {
            if unique_id.is_empty() {
                warn!(charge_point_id, "Response without correlation id on WebSocket; dropping");
                return None;
            }
            manager.complete_response(
                charge_point_id,
                TransportKind::WebSocket,
                &unique_id,
                Ok(payload),
            );
            None
        }
        Envelope::CallError {
            unique_id,
            error_code,
            error_description,
            ..
        } => {
            if unique_id.is_empty() {
                warn!(charge_point_id, "Error without correlation id on WebSocket; dropping");
                return None;
            }
            manager.complete_response(
                charge_point_id,
                TransportKind::WebSocket,
                &unique_id,
                Err(CommandError::Remote {
                    code: error_code,
                    description: error_description,
                }),
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LivenessHandle;
    use std::time::Duration;

    #[tokio::test]
    async fn malformed_frame_with_id_gets_callerror() {
        let manager = TransportManager::new(
            LivenessHandle::disconnected(),
            Duration::from_millis(100),
        );

        let reply = process_inbound(&manager, "CP1", r#"[2,"id7"]"#)
            .await
            .unwrap();
        assert!(reply.starts_with(r#"[4,"id7""#));
        assert!(reply.contains("FormationViolation"));

        // No recoverable id: stay silent
        assert!(process_inbound(&manager, "CP1", "not json").await.is_none());
        assert!(process_inbound(&manager, "CP1", r#"[3,"id8"]"#).await.is_none());
    }

    #[test]
    fn charge_point_id_from_query_parameter() {
        assert_eq!(
            extract_charge_point_id("/ocpp", Some("chargePointId=CP42")),
            Some("CP42".to_string())
        );
        assert_eq!(
            extract_charge_point_id("/ocpp/PATH_ID", Some("foo=1&chargePointId=CP42")),
            Some("CP42".to_string())
        );
    }

    #[test]
    fn charge_point_id_from_path() {
        assert_eq!(
            extract_charge_point_id("/ocpp/CP001", None),
            Some("CP001".to_string())
        );
        assert_eq!(
            extract_charge_point_id("/CP001", None),
            Some("CP001".to_string())
        );
        assert_eq!(extract_charge_point_id("/ocpp/", None), None);
        assert_eq!(extract_charge_point_id("/", None), None);
    }

    #[test]
    fn empty_query_value_falls_back_to_path() {
        assert_eq!(
            extract_charge_point_id("/ocpp/CP9", Some("chargePointId=")),
            Some("CP9".to_string())
        );
    }
}
