//! ChangeConfiguration command

use serde_json::json;
use tracing::info;

use crate::transport::{CommandError, TransportManager};

use super::status_field;

/// ChangeConfiguration outcome per OCPP 1.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationStatus {
    Accepted,
    Rejected,
    RebootRequired,
    NotSupported,
}

impl ConfigurationStatus {
    fn parse(status: &str) -> Result<Self, CommandError> {
        match status {
            "Accepted" => Ok(Self::Accepted),
            "Rejected" => Ok(Self::Rejected),
            "RebootRequired" => Ok(Self::RebootRequired),
            "NotSupported" => Ok(Self::NotSupported),
            other => Err(CommandError::InvalidResponse(format!(
                "Unexpected status: {}",
                other
            ))),
        }
    }
}

pub async fn change_configuration(
    manager: &TransportManager,
    charge_point_id: &str,
    key: &str,
    value: &str,
) -> Result<ConfigurationStatus, CommandError> {
    info!(charge_point_id, key, value, "ChangeConfiguration");

    let payload = json!({ "key": key, "value": value });
    let response = manager
        .send_message(charge_point_id, "ChangeConfiguration", payload, None, None)
        .await?;
    ConfigurationStatus::parse(status_field(&response)?)
}
