//! Active WebSocket connection registry

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// An active WebSocket link to a charge point.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection instance
    pub connection_id: u64,
    pub charge_point_id: String,
    /// Channel to the writer task owning the socket sink
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Connection {
    pub fn new(charge_point_id: impl Into<String>, sender: mpsc::UnboundedSender<String>) -> Self {
        let now = Utc::now();
        Self {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            charge_point_id: charge_point_id.into(),
            sender,
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn send(&self, message: String) -> Result<(), String> {
        self.sender
            .send(message)
            .map_err(|e| format!("Failed to send message: {}", e))
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Thread-safe registry of live charge point sockets.
pub struct ConnectionRegistry {
    connections: DashMap<String, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection, evicting any previous socket for the same
    /// charge point (a reconnect supersedes the stale link). Returns the
    /// new connection's id.
    pub fn register(&self, charge_point_id: &str, sender: mpsc::UnboundedSender<String>) -> u64 {
        let connection = Connection::new(charge_point_id, sender);
        let connection_id = connection.connection_id;
        if let Some(previous) = self
            .connections
            .insert(charge_point_id.to_string(), connection)
        {
            warn!(
                charge_point_id,
                evicted_connection_id = previous.connection_id,
                "Evicting previous connection on reconnect"
            );
        }
        info!(charge_point_id, connection_id, "Registered charge point socket");
        connection_id
    }

    /// Unregister only if the stored connection still carries
    /// `connection_id`; a reconnect that already replaced the entry is
    /// left alone.
    pub fn unregister(&self, charge_point_id: &str, connection_id: u64) {
        let removed = self
            .connections
            .remove_if(charge_point_id, |_, conn| {
                conn.connection_id == connection_id
            })
            .is_some();
        if removed {
            info!(charge_point_id, connection_id, "Unregistered charge point socket");
        }
    }

    pub fn send_to(&self, charge_point_id: &str, message: String) -> Result<(), String> {
        match self.connections.get(charge_point_id) {
            Some(conn) => conn.send(message),
            None => Err(format!("Charge point {} not connected", charge_point_id)),
        }
    }

    pub fn touch(&self, charge_point_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(charge_point_id) {
            conn.touch();
        }
    }

    pub fn is_connected(&self, charge_point_id: &str) -> bool {
        self.connections.contains_key(charge_point_id)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.connections.iter().map(|r| r.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
