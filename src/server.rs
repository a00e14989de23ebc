//! Reusable gateway runtime.
//!
//! [`GatewayHandle`] encapsulates the full lifecycle: store and credential
//! setup, device provisioning, liveness monitor, all enabled transports,
//! and graceful shutdown. Binaries and tests use it instead of duplicating
//! bootstrap code.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::auth::{CredentialStore, SecretCipher};
use crate::config::AppConfig;
use crate::dispatcher::ProtocolDispatcher;
use crate::domain::{ChargePoint, Device};
use crate::liveness::{self, LivenessConfig, LivenessHandle};
use crate::shutdown::{listen_for_shutdown_signals, ShutdownSignal};
use crate::storage::{GatewayStore, InMemoryGatewayStore};
use crate::transport::http_poll::HttpPollAdapter;
use crate::transport::mqtt::{MqttAdapter, MqttSettings};
use crate::transport::ws::WsAdapter;
use crate::transport::TransportManager;

// ── Options ────────────────────────────────────────────────────────

/// Options for starting the gateway.
#[derive(Default)]
pub struct GatewayOptions {
    pub config: AppConfig,
}

// ── GatewayHandle ──────────────────────────────────────────────────

/// Handle to a running gateway.
pub struct GatewayHandle {
    /// Transport hub, for issuing commands to connected charge points.
    pub manager: Arc<TransportManager>,
    /// The state store backing the protocol layer.
    pub store: Arc<dyn GatewayStore>,
    /// Device credential checks, usable from an external broker auth hook.
    pub credentials: Arc<CredentialStore>,
    /// Liveness refresh handle.
    pub liveness: LivenessHandle,
    /// The configuration the gateway was started with.
    pub config: AppConfig,

    shutdown: ShutdownSignal,
    ws_task: tokio::task::JoinHandle<()>,
    poll_task: Option<tokio::task::JoinHandle<()>>,
}

impl GatewayHandle {
    /// Start the gateway with the given options.
    ///
    /// Brings up, in order: state store, device provisioning, liveness
    /// monitor, transport manager and dispatcher, then every enabled
    /// transport (WebSocket, MQTT, HTTP poll).
    pub async fn start(opts: GatewayOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let config = opts.config;

        info!("Starting OCPP gateway...");

        let store: Arc<dyn GatewayStore> = Arc::new(InMemoryGatewayStore::new());
        let cipher = SecretCipher::new(config.security.master_key.as_bytes());

        seed_devices(&store, &cipher, &config).await;

        let credentials = Arc::new(CredentialStore::new(store.clone(), cipher));

        let shutdown = ShutdownSignal::new();
        let liveness = liveness::spawn(
            store.clone(),
            LivenessConfig {
                ttl: config.liveness.ttl(),
            },
            shutdown.clone(),
        );

        let manager = Arc::new(TransportManager::new(
            liveness.clone(),
            config.calls.timeout(),
        ));

        let dispatcher = Arc::new(ProtocolDispatcher::new(
            store.clone(),
            config.heartbeat.interval_secs,
        ));
        manager.register_handler(dispatcher);

        // ── WebSocket transport ────────────────────────────────
        let ws_adapter = Arc::new(WsAdapter::new(
            config.server.ws_address(),
            manager.clone(),
            shutdown.clone(),
        ));
        manager.register_adapter(ws_adapter.clone());
        let ws_task = tokio::spawn(async move {
            if let Err(e) = ws_adapter.run().await {
                error!("WebSocket transport error: {}", e);
            }
        });

        // ── MQTT transport ─────────────────────────────────────
        if config.mqtt.enabled {
            let mqtt_adapter = MqttAdapter::start(
                MqttSettings {
                    host: config.mqtt.host.clone(),
                    port: config.mqtt.port,
                    client_id: config.mqtt.client_id.clone(),
                    username: config.mqtt.username.clone(),
                    password: config.mqtt.password.clone(),
                    keep_alive: std::time::Duration::from_secs(config.mqtt.keep_alive_secs),
                    liveness_window: std::time::Duration::from_secs(
                        config.mqtt.liveness_window_secs,
                    ),
                },
                manager.clone(),
                credentials.clone(),
                store.clone(),
                shutdown.clone(),
            );
            manager.register_adapter(mqtt_adapter);
        } else {
            info!("MQTT transport disabled by configuration");
        }

        // ── HTTP poll transport ────────────────────────────────
        let poll_task = if config.poll.enabled {
            let poll_adapter = HttpPollAdapter::new(
                config.poll.address(),
                manager.clone(),
                credentials.clone(),
                std::time::Duration::from_secs(config.poll.window_secs),
                shutdown.clone(),
            );
            manager.register_adapter(poll_adapter.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = poll_adapter.run().await {
                    error!("HTTP poll transport error: {}", e);
                }
            }))
        } else {
            info!("HTTP poll transport disabled by configuration");
            None
        };

        info!("Gateway started");

        Ok(Self {
            manager,
            store,
            credentials,
            liveness,
            config,
            shutdown,
            ws_task,
            poll_task,
        })
    }

    /// Get a cloneable shutdown signal.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Install OS signal listeners (SIGTERM, SIGINT) that trigger shutdown.
    pub fn install_signal_handler(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(listen_for_shutdown_signals(shutdown));
    }

    /// Trigger graceful shutdown (non-blocking).
    pub fn trigger_shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for the transports to stop after shutdown has been triggered.
    pub async fn wait(self) {
        if let Err(e) = self.ws_task.await {
            error!("WebSocket transport task panicked: {}", e);
        }
        if let Some(poll_task) = self.poll_task {
            if let Err(e) = poll_task.await {
                error!("HTTP poll transport task panicked: {}", e);
            }
        }
        info!("Gateway shutdown complete");
    }

    /// Trigger shutdown and wait for completion.
    pub async fn shutdown(self) {
        info!("Shutting down gateway...");
        self.trigger_shutdown();
        self.wait().await;
    }

    pub fn is_running(&self) -> bool {
        !self.ws_task.is_finished()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Provision `[[devices]]` entries: encrypt each shared secret under the
/// master key and register the charge point mapping when one is declared.
async fn seed_devices(store: &Arc<dyn GatewayStore>, cipher: &SecretCipher, config: &AppConfig) {
    for seed in &config.devices {
        let encrypted = match cipher.encrypt(seed.shared_secret.as_bytes()) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                error!(
                    serial_number = seed.serial_number.as_str(),
                    error = %e,
                    "Failed to encrypt seed secret; skipping device"
                );
                continue;
            }
        };

        let device = Device::new(&seed.serial_number, &seed.type_code, encrypted);
        if let Err(e) = store.upsert_device(device).await {
            warn!(
                serial_number = seed.serial_number.as_str(),
                error = %e,
                "Failed to provision device"
            );
            continue;
        }

        // An explicit mapping pre-creates the charge point so messages from
        // this device land on the right identity before its first boot.
        if let Some(charge_point_id) = &seed.charge_point_id {
            let exists = matches!(store.get_charge_point(charge_point_id).await, Ok(Some(_)));
            if !exists {
                let mut charge_point = ChargePoint::new(charge_point_id, "", "");
                charge_point.serial_number = Some(seed.serial_number.clone());
                if let Err(e) = store.upsert_charge_point(charge_point).await {
                    warn!(
                        charge_point_id = charge_point_id.as_str(),
                        error = %e,
                        "Failed to pre-create charge point"
                    );
                }
            }
        }

        info!(
            serial_number = seed.serial_number.as_str(),
            type_code = seed.type_code.as_str(),
            "Provisioned device"
        );
    }
}

/// Initialize tracing (logging) from the application config.
///
/// Call this once at process startup (before [`GatewayHandle::start`]).
pub fn init_tracing(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
