//! Reset command

use serde_json::json;
use tracing::info;

use crate::transport::{CommandError, TransportManager};

use super::{status_field, CommandStatus};

/// Reset kind: `Soft` restarts the application, `Hard` reboots the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Soft,
    Hard,
}

impl ResetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "Soft",
            Self::Hard => "Hard",
        }
    }
}

pub async fn reset(
    manager: &TransportManager,
    charge_point_id: &str,
    kind: ResetKind,
) -> Result<CommandStatus, CommandError> {
    info!(charge_point_id, kind = kind.as_str(), "Reset");

    let payload = json!({ "type": kind.as_str() });
    let response = manager
        .send_message(charge_point_id, "Reset", payload, None, None)
        .await?;
    CommandStatus::parse(status_field(&response)?)
}
