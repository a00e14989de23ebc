//! Gateway-initiated commands
//!
//! Typed wrappers over [`TransportManager::send_message`]: each command
//! builds its OCPP 1.6 payload, waits for the device's response on
//! whichever transport the charge point is reachable over, and parses the
//! status field out of it.

mod change_configuration;
mod remote_start;
mod remote_stop;
mod reset;
mod unlock_connector;

pub use change_configuration::{change_configuration, ConfigurationStatus};
pub use remote_start::remote_start_transaction;
pub use remote_stop::remote_stop_transaction;
pub use reset::{reset, ResetKind};
pub use unlock_connector::{unlock_connector, UnlockStatus};

use serde_json::Value;

pub use crate::transport::CommandError;

/// Accepted/Rejected answer common to several commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Accepted,
    Rejected,
}

impl CommandStatus {
    fn parse(status: &str) -> Result<Self, CommandError> {
        match status {
            "Accepted" => Ok(Self::Accepted),
            "Rejected" => Ok(Self::Rejected),
            other => Err(CommandError::InvalidResponse(format!(
                "Unexpected status: {}",
                other
            ))),
        }
    }
}

/// Pull the `status` string out of a device response payload.
fn status_field(response: &Value) -> Result<&str, CommandError> {
    response
        .get("status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CommandError::InvalidResponse("Response has no status field".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_field_extraction() {
        assert_eq!(status_field(&json!({"status": "Accepted"})).unwrap(), "Accepted");
        assert!(status_field(&json!({})).is_err());
        assert!(status_field(&json!({"status": 1})).is_err());
    }

    #[test]
    fn command_status_parsing() {
        assert_eq!(CommandStatus::parse("Accepted").unwrap(), CommandStatus::Accepted);
        assert_eq!(CommandStatus::parse("Rejected").unwrap(), CommandStatus::Rejected);
        assert!(CommandStatus::parse("Maybe").is_err());
    }
}
