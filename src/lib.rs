//! # VoltGrid OCPP Gateway
//!
//! Device transport and protocol gateway for OCPP 1.6 charge points.
//!
//! A charge point may be reachable over MQTT (per-device topic pairs on a
//! broker), a direct WebSocket, or HTTP long-polling; the gateway presents
//! all of them to the protocol layer as a single connection surface.
//!
//! ## Architecture
//!
//! - **protocol**: OCPP-J framing (standard arrays and a simplified object
//!   grammar) and typed action payloads
//! - **transport**: the adapters plus the [`transport::TransportManager`]
//!   hub that routes calls and correlates responses across them
//! - **dispatcher**: transport-independent handlers for device-initiated
//!   calls
//! - **domain** / **storage**: charge point, EVSE and session state behind
//!   the [`storage::GatewayStore`] trait
//! - **auth**: broker-style credential derivation and topic ACLs
//! - **liveness**: marker-based online/offline tracking
//! - **commands**: typed gateway-initiated OCPP commands

pub mod auth;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod liveness;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod transport;

pub use config::{default_config_path, AppConfig};
pub use server::{GatewayHandle, GatewayOptions};
