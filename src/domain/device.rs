//! Device identity entity

use chrono::{DateTime, Utc};

/// A provisioned device identity, read by the credential store on every
/// connection and topic check.
///
/// The shared secret is stored encrypted (AES-256-GCM, base64) and only
/// decrypted transiently while deriving the broker password.
#[derive(Debug, Clone)]
pub struct Device {
    /// 15-character device identity, also the MQTT username.
    pub serial_number: String,
    /// Device-type code, the first topic segment.
    pub type_code: String,
    pub mqtt_client_id: String,
    pub mqtt_username: String,
    pub encrypted_shared_secret: String,
    pub is_active: bool,
    pub last_connected: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(
        serial_number: impl Into<String>,
        type_code: impl Into<String>,
        encrypted_shared_secret: impl Into<String>,
    ) -> Self {
        let serial_number = serial_number.into();
        let type_code = type_code.into();
        Self {
            mqtt_client_id: format!("{}&{}", type_code, serial_number),
            mqtt_username: serial_number.clone(),
            serial_number,
            type_code,
            encrypted_shared_secret: encrypted_shared_secret.into(),
            is_active: true,
            last_connected: None,
        }
    }

    /// The client id this device must present on CONNECT.
    pub fn expected_client_id(&self) -> String {
        format!("{}&{}", self.type_code, self.serial_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_combines_type_and_serial() {
        let device = Device::new("SN1234567890123", "EVC01", "ct");
        assert_eq!(device.expected_client_id(), "EVC01&SN1234567890123");
        assert_eq!(device.mqtt_username, "SN1234567890123");
        assert!(device.is_active);
    }
}
