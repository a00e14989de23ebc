//! UnlockConnector command

use serde_json::json;
use tracing::info;

use crate::transport::{CommandError, TransportManager};

use super::status_field;

/// UnlockConnector outcome per OCPP 1.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    Unlocked,
    UnlockFailed,
    NotSupported,
}

impl UnlockStatus {
    fn parse(status: &str) -> Result<Self, CommandError> {
        match status {
            "Unlocked" => Ok(Self::Unlocked),
            "UnlockFailed" => Ok(Self::UnlockFailed),
            "NotSupported" => Ok(Self::NotSupported),
            other => Err(CommandError::InvalidResponse(format!(
                "Unexpected status: {}",
                other
            ))),
        }
    }
}

pub async fn unlock_connector(
    manager: &TransportManager,
    charge_point_id: &str,
    connector_id: u32,
) -> Result<UnlockStatus, CommandError> {
    info!(charge_point_id, connector_id, "UnlockConnector");

    let payload = json!({ "connectorId": connector_id });
    let response = manager
        .send_message(charge_point_id, "UnlockConnector", payload, None, None)
        .await?;
    UnlockStatus::parse(status_field(&response)?)
}
