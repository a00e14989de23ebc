//! Liveness monitor
//!
//! Keeps one short-TTL marker per charge point, refreshed on every inbound
//! message on any transport. Expiry is event-driven via a `DelayQueue`
//! owned by a single task; there is no polling scan. An expired marker
//! marks the charge point's EVSEs `Unavailable` — except those with a
//! charge in progress — and flips connectivity to `Offline`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

use crate::domain::Connectivity;
use crate::shutdown::ShutdownSignal;
use crate::storage::GatewayStore;

/// Liveness marker configuration.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Marker time-to-live; the charge point goes offline this long after
    /// its last message.
    pub ttl: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(180),
        }
    }
}

/// Cheap, cloneable handle for refreshing markers.
#[derive(Clone)]
pub struct LivenessHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl LivenessHandle {
    /// Refresh the marker for a charge point. First ping doubles as the
    /// "new connection" announcement.
    pub fn ping(&self, charge_point_id: &str) {
        // Send only fails once the monitor task is gone (shutdown).
        let _ = self.tx.send(charge_point_id.to_string());
    }

    /// A handle wired to nothing, for tests that don't care about liveness.
    #[cfg(test)]
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Spawn the monitor task and return its handle.
pub fn spawn(
    store: Arc<dyn GatewayStore>,
    config: LivenessConfig,
    shutdown: ShutdownSignal,
) -> LivenessHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(store, config, rx, shutdown));
    LivenessHandle { tx }
}

async fn run(
    store: Arc<dyn GatewayStore>,
    config: LivenessConfig,
    mut rx: mpsc::UnboundedReceiver<String>,
    shutdown: ShutdownSignal,
) {
    let mut queue: DelayQueue<String> = DelayQueue::new();
    let mut keys: HashMap<String, delay_queue::Key> = HashMap::new();

    info!(ttl_secs = config.ttl.as_secs(), "Liveness monitor started");

    loop {
        tokio::select! {
            ping = rx.recv() => {
                match ping {
                    Some(charge_point_id) => {
                        match keys.get(&charge_point_id) {
                            Some(key) => queue.reset(key, config.ttl),
                            None => {
                                let key = queue.insert(charge_point_id.clone(), config.ttl);
                                keys.insert(charge_point_id.clone(), key);
                                announce_online(&store, &charge_point_id).await;
                            }
                        }
                    }
                    None => break,
                }
            }
            Some(expired) = queue.next() => {
                let charge_point_id = expired.into_inner();
                keys.remove(&charge_point_id);
                handle_expiry(&store, &charge_point_id).await;
            }
            _ = shutdown.notified().wait() => {
                info!("Liveness monitor shutting down");
                break;
            }
        }
    }
}

async fn announce_online(store: &Arc<dyn GatewayStore>, charge_point_id: &str) {
    info!(charge_point_id, "Charge point online");
    if let Err(e) = store
        .set_connectivity(charge_point_id, Connectivity::Online)
        .await
    {
        warn!(charge_point_id, error = %e, "Failed to record online state");
    }
}

async fn handle_expiry(store: &Arc<dyn GatewayStore>, charge_point_id: &str) {
    debug!(charge_point_id, "Liveness marker expired");

    match store.sweep_offline(charge_point_id).await {
        Ok(sweep) => {
            if !sweep.left_active.is_empty() {
                // An active charge keeps the charge point nominally alive;
                // never terminate a session over a missed heartbeat.
                info!(
                    charge_point_id,
                    active_evses = sweep.left_active.len(),
                    "Marker expired but charging in progress; staying online"
                );
                return;
            }
            info!(
                charge_point_id,
                marked_unavailable = sweep.marked.len(),
                "Charge point offline"
            );
            if let Err(e) = store
                .set_connectivity(charge_point_id, Connectivity::Offline)
                .await
            {
                warn!(charge_point_id, error = %e, "Failed to record offline state");
            }
        }
        Err(e) => {
            // Offline transitions are best-effort, never hard failures.
            warn!(charge_point_id, error = %e, "Offline sweep failed");
        }
    }
}
