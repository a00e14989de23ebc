//! Credential store and broker authentication hook
//!
//! Validates device CONNECT attempts and topic access before any message
//! is accepted, whether the check runs inside a broker plugin or inline in
//! an adapter. Failures carry a specific reason for the log; the device
//! only ever learns "denied".

mod secret;

pub use secret::{SecretCipher, SecretError};

use std::sync::Arc;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::domain::Device;
use crate::storage::GatewayStore;

type HmacSha256 = Hmac<Sha256>;

/// Derived passwords are truncated to this many base64 characters.
const PASSWORD_LEN: usize = 12;

/// Message direction on a device channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    /// Device → server
    Up,
    /// Server → device
    Down,
}

/// What the device is asking to do with a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicAccess {
    Publish,
    Subscribe,
}

/// Authentication failures. Logged server-side, never sent to the device.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Malformed client id: {0}")]
    MalformedClientId(String),
    #[error("Client id does not match device identity: {0}")]
    ClientIdMismatch(String),
    #[error("Username does not match serial number")]
    UsernameMismatch,
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Device is deactivated: {0}")]
    InactiveDevice(String),
    #[error("Password mismatch for {0}")]
    BadPassword(String),
    #[error("Topic access denied for {serial_number}: {detail}")]
    TopicDenied {
        serial_number: String,
        detail: &'static str,
    },
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error("Credential lookup failed: {0}")]
    Storage(String),
}

/// Per-device identity checks backed by the gateway store.
pub struct CredentialStore {
    store: Arc<dyn GatewayStore>,
    cipher: SecretCipher,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn GatewayStore>, cipher: SecretCipher) -> Self {
        Self { store, cipher }
    }

    pub fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    /// Derive the broker password for a device: HMAC-SHA256 of the serial
    /// number under the shared secret, base64, first 12 characters.
    ///
    /// Stateless and deterministic: recomputing always yields the same
    /// value, so the password is never stored.
    pub fn derive_password(shared_secret: &[u8], serial_number: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(shared_secret).expect("HMAC accepts any key length");
        mac.update(serial_number.as_bytes());
        let digest = mac.finalize().into_bytes();
        let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
        encoded.chars().take(PASSWORD_LEN).collect()
    }

    /// Recompute the expected password for a provisioned device.
    pub async fn device_password(&self, serial_number: &str) -> Result<String, AuthError> {
        let device = self.active_device(serial_number).await?;
        let secret = self.cipher.decrypt(&device.encrypted_shared_secret)?;
        Ok(Self::derive_password(&secret, serial_number))
    }

    /// Validate an MQTT CONNECT: client id `{type_code}&{serial}`, username
    /// equal to the serial, active device record, derived password match.
    pub async fn validate_connect(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        let (type_code, serial_number) = client_id
            .split_once('&')
            .ok_or_else(|| AuthError::MalformedClientId(client_id.to_string()))?;

        if username != serial_number {
            return Err(AuthError::UsernameMismatch);
        }

        let device = self.active_device(serial_number).await?;
        if device.type_code != type_code {
            return Err(AuthError::ClientIdMismatch(client_id.to_string()));
        }

        let secret = self.cipher.decrypt(&device.encrypted_shared_secret)?;
        let expected = Self::derive_password(&secret, serial_number);
        if password != expected {
            return Err(AuthError::BadPassword(serial_number.to_string()));
        }

        let _ = self.store.touch_device(serial_number).await;
        debug!(serial_number, "Device connect validated");
        Ok(())
    }

    /// Validate HTTP Basic credentials on the poll transport, where no
    /// broker exists and the hook runs inside the adapter.
    pub async fn validate_basic(
        &self,
        serial_number: &str,
        username: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        if username != serial_number {
            return Err(AuthError::UsernameMismatch);
        }
        let expected = self.device_password(serial_number).await?;
        if password != expected {
            return Err(AuthError::BadPassword(serial_number.to_string()));
        }
        let _ = self.store.touch_device(serial_number).await;
        Ok(())
    }

    /// Topic ACL: a device may only publish on its own `up` channel and
    /// subscribe to its own `down` channel.
    pub async fn validate_topic(
        &self,
        serial_number: &str,
        type_code: &str,
        direction: ChannelDirection,
        access: TopicAccess,
    ) -> Result<(), AuthError> {
        let device = self.active_device(serial_number).await?;
        if device.type_code != type_code {
            return Err(AuthError::TopicDenied {
                serial_number: serial_number.to_string(),
                detail: "type code does not match device record",
            });
        }
        match (access, direction) {
            (TopicAccess::Publish, ChannelDirection::Up) => Ok(()),
            (TopicAccess::Subscribe, ChannelDirection::Down) => Ok(()),
            (TopicAccess::Publish, ChannelDirection::Down) => Err(AuthError::TopicDenied {
                serial_number: serial_number.to_string(),
                detail: "devices may not publish on the down channel",
            }),
            (TopicAccess::Subscribe, ChannelDirection::Up) => Err(AuthError::TopicDenied {
                serial_number: serial_number.to_string(),
                detail: "devices may not subscribe to the up channel",
            }),
        }
    }

    /// Resolve the charge point behind a device serial, falling back to
    /// the serial itself for chargers that booted before provisioning.
    pub async fn charge_point_id_for(&self, serial_number: &str) -> String {
        match self.store.find_charge_point_by_serial(serial_number).await {
            Ok(Some(cp)) => cp.id,
            _ => serial_number.to_string(),
        }
    }

    async fn active_device(&self, serial_number: &str) -> Result<Device, AuthError> {
        let device = self
            .store
            .get_device(serial_number)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?
            .ok_or_else(|| AuthError::UnknownDevice(serial_number.to_string()))?;
        if !device.is_active {
            return Err(AuthError::InactiveDevice(serial_number.to_string()));
        }
        Ok(device)
    }
}
