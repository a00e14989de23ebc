//! RemoteStartTransaction command

use serde_json::json;
use tracing::info;

use crate::transport::{CommandError, TransportManager};

use super::{status_field, CommandStatus};

pub async fn remote_start_transaction(
    manager: &TransportManager,
    charge_point_id: &str,
    id_tag: &str,
    connector_id: Option<u32>,
) -> Result<CommandStatus, CommandError> {
    info!(charge_point_id, id_tag, ?connector_id, "RemoteStartTransaction");

    let mut payload = json!({ "idTag": id_tag });
    if let Some(connector_id) = connector_id {
        payload["connectorId"] = json!(connector_id);
    }

    let response = manager
        .send_message(charge_point_id, "RemoteStartTransaction", payload, None, None)
        .await?;
    CommandStatus::parse(status_field(&response)?)
}
