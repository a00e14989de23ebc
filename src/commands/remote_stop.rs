//! RemoteStopTransaction command

use serde_json::json;
use tracing::info;

use crate::transport::{CommandError, TransportManager};

use super::{status_field, CommandStatus};

pub async fn remote_stop_transaction(
    manager: &TransportManager,
    charge_point_id: &str,
    transaction_id: i64,
) -> Result<CommandStatus, CommandError> {
    info!(charge_point_id, transaction_id, "RemoteStopTransaction");

    let payload = json!({ "transactionId": transaction_id });
    let response = manager
        .send_message(charge_point_id, "RemoteStopTransaction", payload, None, None)
        .await?;
    CommandStatus::parse(status_field(&response)?)
}
