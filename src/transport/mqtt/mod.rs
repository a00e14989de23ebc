//! MQTT transport
//!
//! Bridges per-device topic pairs on the broker into the transport
//! manager. The gateway subscribes to every device's `up` channel, and
//! re-checks the publisher's topic ACL on each message rather than
//! trusting the broker alone.
//!
//! Correlation: devices speaking the standard array grammar echo the
//! unique id; devices on the simplified object grammar cannot, so an
//! in-flight call is remembered by `(serial, action)` and the next
//! response for that pair resolves it.

pub mod topic;

pub use topic::{down_topic, up_topic, DeviceTopic};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::auth::{ChannelDirection, CredentialStore, TopicAccess};
use crate::protocol::{error_code, Envelope, WireFormat};
use crate::shutdown::ShutdownSignal;
use crate::storage::GatewayStore;
use crate::transport::{CommandError, TransportAdapter, TransportKind, TransportManager};

/// Broker connection settings for the gateway's own MQTT session.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// How recently a device must have published to count as reachable.
    pub liveness_window: Duration,
}

/// A device the gateway has heard from over MQTT.
#[derive(Debug, Clone)]
struct Peer {
    type_code: String,
    serial_number: String,
    last_seen: Instant,
}

/// MQTT transport adapter.
pub struct MqttAdapter {
    client: AsyncClient,
    manager: Arc<TransportManager>,
    credentials: Arc<CredentialStore>,
    store: Arc<dyn GatewayStore>,
    /// `charge_point_id → device` routing for outbound calls.
    peers: DashMap<String, Peer>,
    /// Wire grammar each device last spoke.
    formats: DashMap<String, WireFormat>,
    /// `(serial, action) → correlation_id` for simplified-grammar calls.
    aliases: DashMap<(String, String), String>,
    liveness_window: Duration,
}

impl MqttAdapter {
    /// Connect to the broker and spawn the event loop task.
    pub fn start(
        settings: MqttSettings,
        manager: Arc<TransportManager>,
        credentials: Arc<CredentialStore>,
        store: Arc<dyn GatewayStore>,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(false);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 256);

        let adapter = Arc::new(Self {
            client,
            manager,
            credentials,
            store,
            peers: DashMap::new(),
            formats: DashMap::new(),
            aliases: DashMap::new(),
            liveness_window: settings.liveness_window,
        });

        let task_adapter = adapter.clone();
        tokio::spawn(async move {
            info!(
                host = settings.host.as_str(),
                port = settings.port,
                "MQTT transport connecting to broker"
            );
            loop {
                tokio::select! {
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                let text = String::from_utf8_lossy(&publish.payload).to_string();
                                task_adapter.handle_publish(&publish.topic, &text).await;
                            }
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                info!("Connected to MQTT broker");
                                task_adapter.subscribe_up_channels().await;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!("MQTT event loop error: {}", e);
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                    _ = shutdown.wait() => {
                        info!("MQTT transport shutting down");
                        let _ = task_adapter.client.disconnect().await;
                        return;
                    }
                }
            }
        });

        adapter
    }

    /// (Re)subscribe to device up channels after every ConnAck, so a broker
    /// restart does not leave the gateway deaf.
    async fn subscribe_up_channels(&self) {
        let type_codes = match self.store.list_device_type_codes().await {
            Ok(codes) => codes,
            Err(e) => {
                warn!(error = %e, "Failed to list device types; subscribing broadly");
                Vec::new()
            }
        };

        for filter in up_channel_filters(&type_codes) {
            debug!(filter = filter.as_str(), "Subscribing to device up channel");
            if let Err(e) = self.client.subscribe(&filter, QoS::AtLeastOnce).await {
                error!(filter = filter.as_str(), "Failed to subscribe: {}", e);
            }
        }
    }

    async fn handle_publish(&self, topic: &str, text: &str) {
        let device_topic = match DeviceTopic::parse(topic) {
            Some(parsed) => parsed,
            None => {
                warn!(topic, "Publish on unrecognized topic; dropping");
                return;
            }
        };
        if device_topic.direction != ChannelDirection::Up {
            warn!(topic, "Publish on a down channel; dropping");
            return;
        }

        // The broker enforces the ACL at CONNECT/SUBSCRIBE time; this is
        // the gateway-side half of the same check, fail closed.
        if let Err(e) = self
            .credentials
            .validate_topic(
                &device_topic.serial_number,
                &device_topic.type_code,
                device_topic.direction,
                TopicAccess::Publish,
            )
            .await
        {
            warn!(topic, error = %e, "Rejected publish failing topic ACL");
            return;
        }

        let (envelope, format) = match Envelope::decode(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                // A malformed call with a recoverable unique id still gets
                // a CALLERROR; anything else can only be dropped.
                match Envelope::salvage_unique_id(text) {
                    Some(unique_id) => {
                        warn!(topic, error = %e, "Malformed MQTT payload; answering CALLERROR");
                        let reply = Envelope::error_reply(
                            &unique_id,
                            "",
                            error_code::FORMATION_VIOLATION,
                            e.to_string(),
                        );
                        self.publish_down(
                            &device_topic.type_code,
                            &device_topic.serial_number,
                            &reply,
                            WireFormat::Standard,
                        )
                        .await;
                    }
                    None => warn!(topic, error = %e, "Undecodable MQTT payload; dropping"),
                }
                return;
            }
        };

        let serial = device_topic.serial_number.clone();
        self.formats.insert(serial.clone(), format);

        let charge_point_id = self.credentials.charge_point_id_for(&serial).await;
        self.peers.insert(
            charge_point_id.clone(),
            Peer {
                type_code: device_topic.type_code.clone(),
                serial_number: serial.clone(),
                last_seen: Instant::now(),
            },
        );

        match envelope {
            Envelope::Call {
                unique_id,
                action,
                payload,
            } => {
                let reply = match self
                    .manager
                    .handle_call(&charge_point_id, TransportKind::Mqtt, &action, payload)
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
                self.publish_down(&device_topic.type_code, &serial, &reply, format)
                    .await;
            }
            Envelope::CallResult {
                unique_id,
                payload,
                action,
            } => {
                if let Some(correlation_id) = self.resolve_correlation(&serial, &unique_id, action)
                {
                    self.manager.complete_response(
                        &charge_point_id,
                        TransportKind::Mqtt,
                        &correlation_id,
                        Ok(payload),
                    );
                } else {
                    warn!(charge_point_id, "Uncorrelatable MQTT response; dropping");
                }
            }
            Envelope::CallError {
                unique_id,
                error_code,
                error_description,
                action,
                ..
            } => {
                if let Some(correlation_id) = self.resolve_correlation(&serial, &unique_id, action)
                {
                    self.manager.complete_response(
                        &charge_point_id,
                        TransportKind::Mqtt,
                        &correlation_id,
                        Err(CommandError::Remote {
                            code: error_code,
                            description: error_description,
                        }),
                    );
                } else {
                    warn!(charge_point_id, "Uncorrelatable MQTT error; dropping");
                }
            }
        }
    }

    /// Map a response back to its correlation id: the echoed unique id for
    /// the standard grammar, the `(serial, action)` alias otherwise.
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

    async fn publish_down(
        &self,
        type_code: &str,
        serial_number: &str,
        envelope: &Envelope,
        format: WireFormat,
    ) {
        let text = match envelope.encode(format) {
            Ok(text) => text,
            Err(e) => {
                error!(serial_number, error = %e, "Failed to encode reply");
                return;
            }
        };
        let topic = down_topic(type_code, serial_number);
        debug!(topic = topic.as_str(), "-> {}", text);
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, text)
            .await
        {
            error!(topic = topic.as_str(), "Failed to publish: {}", e);
        }
    }

    #[cfg(test)]
    fn note_peer(&self, charge_point_id: &str, type_code: &str, serial_number: &str) {
        self.peers.insert(
            charge_point_id.to_string(),
            Peer {
                type_code: type_code.to_string(),
                serial_number: serial_number.to_string(),
                last_seen: Instant::now(),
            },
        );
    }
}

/// The broad wildcard keeps the gateway hearing devices whose type code
/// was provisioned after the last ConnAck; the per-type filters cover the
/// known fleet explicitly.
fn up_channel_filters(type_codes: &[String]) -> Vec<String> {
    let mut filters = vec!["+/+/user/up".to_string()];
    filters.extend(type_codes.iter().map(|code| format!("{}/+/user/up", code)));
    filters
}

#[async_trait]
impl TransportAdapter for MqttAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    fn is_connected(&self, charge_point_id: &str) -> bool {
        self.peers
            .get(charge_point_id)
            .map(|peer| peer.last_seen.elapsed() < self.liveness_window)
            .unwrap_or(false)
    }

    async fn send_call(
        &self,
        charge_point_id: &str,
        unique_id: &str,
        action: &str,
        payload: &Value,
    ) -> Result<(), CommandError> {
        let (type_code, serial_number) = match self.peers.get(charge_point_id) {
            Some(peer) => (peer.type_code.clone(), peer.serial_number.clone()),
            None => return Err(CommandError::NotConnected(charge_point_id.to_string())),
        };

        let format = self
            .formats
            .get(&serial_number)
            .map(|f| *f.value())
            .unwrap_or(WireFormat::Standard);

        if format == WireFormat::Simplified {
            // The device will answer without an id; remember the call by
            // (serial, action) so the response can still be correlated.
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

        let topic = down_topic(&type_code, &serial_number);
        debug!(topic = topic.as_str(), "-> {}", text);
        self.client
            .publish(&topic, QoS::AtLeastOnce, false, text)
            .await
            .map_err(|e| {
                self.aliases
                    .remove(&(serial_number.clone(), action.to_string()));
                CommandError::SendFailed(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SecretCipher;
    use crate::domain::Device;
    use crate::liveness::LivenessHandle;
    use crate::storage::InMemoryGatewayStore;
    use serde_json::json;

    const SERIAL: &str = "SN100";
    const TYPE: &str = "EVC01";

    async fn adapter_fixture() -> (Arc<MqttAdapter>, Arc<TransportManager>) {
        let store = Arc::new(InMemoryGatewayStore::new());
        let cipher = SecretCipher::new(b"test-master-key");
        let encrypted = cipher.encrypt(b"secret").unwrap();
        store
            .upsert_device(Device::new(SERIAL, TYPE, encrypted))
            .await
            .unwrap();

        let credentials = Arc::new(CredentialStore::new(
            store.clone() as Arc<dyn GatewayStore>,
            cipher,
        ));
        let manager = Arc::new(TransportManager::new(
            LivenessHandle::disconnected(),
            Duration::from_millis(300),
        ));
        let adapter = MqttAdapter::start(
            MqttSettings {
                host: "127.0.0.1".to_string(),
                port: 1883,
                client_id: "gateway-test".to_string(),
                username: None,
                password: None,
                keep_alive: Duration::from_secs(30),
                liveness_window: Duration::from_secs(60),
            },
            manager.clone(),
            credentials,
            store as Arc<dyn GatewayStore>,
            ShutdownSignal::new(),
        );
        manager.register_adapter(adapter.clone());
        (adapter, manager)
    }

    #[tokio::test]
    async fn simplified_response_resolves_by_action_alias() {
        let (adapter, manager) = adapter_fixture().await;
        adapter.note_peer(SERIAL, TYPE, SERIAL);
        adapter
            .formats
            .insert(SERIAL.to_string(), WireFormat::Simplified);

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_message(SERIAL, "Reset", json!({"type": "Soft"}), None, None)
                    .await
            })
        };

        // Wait for the alias to appear, then feed the device's reply
        while adapter.aliases.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        adapter
            .handle_publish(
                &up_topic(TYPE, SERIAL),
                r#"{"action":"Reset","response":{"status":"Accepted"}}"#,
            )
            .await;

        let result = task.await.unwrap().unwrap();
        assert_eq!(result["status"], "Accepted");
        assert!(adapter.aliases.is_empty());
    }

    #[tokio::test]
    async fn publish_from_unknown_device_is_dropped() {
        let (adapter, manager) = adapter_fixture().await;
        adapter
            .handle_publish(
                &up_topic(TYPE, "SN_UNKNOWN"),
                r#"{"action":"Heartbeat","payload":{}}"#,
            )
            .await;
        // No peer recorded: the device never got past the ACL
        assert!(!manager.is_connected("SN_UNKNOWN"));
    }

    #[tokio::test]
    async fn malformed_topic_is_dropped() {
        let (adapter, _manager) = adapter_fixture().await;
        adapter
            .handle_publish("EVC01/SN100/user", r#"{"action":"Heartbeat"}"#)
            .await;
        assert!(adapter.peers.is_empty());
    }

    #[test]
    fn up_filters_always_include_broad_wildcard() {
        assert_eq!(up_channel_filters(&[]), vec!["+/+/user/up"]);
        assert_eq!(
            up_channel_filters(&["EVC01".to_string(), "EVC02".to_string()]),
            vec!["+/+/user/up", "EVC01/+/user/up", "EVC02/+/user/up"]
        );
    }

    #[tokio::test]
    async fn standard_response_uses_echoed_id() {
        let (adapter, _manager) = adapter_fixture().await;
        assert_eq!(
            adapter.resolve_correlation(SERIAL, "id-42", None),
            Some("id-42".to_string())
        );
        // Simplified with no alias registered
        assert_eq!(
            adapter.resolve_correlation(SERIAL, "", Some("Reset".to_string())),
            None
        );
    }
}
