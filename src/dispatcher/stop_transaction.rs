//! StopTransaction handler
//!
//! Stopping is idempotent from the device's point of view: a stop for an
//! unknown or already-closed transaction is logged and still acknowledged,
//! because refusing it would only make the device retry a lost cause.

use tracing::{info, warn};

use crate::protocol::{
    AuthorizationStatus, IdTagInfo, StopTransactionRequest, StopTransactionResponse,
};

use super::ProtocolDispatcher;

pub async fn handle_stop_transaction(
    dispatcher: &ProtocolDispatcher,
    charge_point_id: &str,
    request: StopTransactionRequest,
) -> StopTransactionResponse {
    info!(
        charge_point_id,
        transaction_id = request.transaction_id,
        meter_stop = request.meter_stop,
        reason = request.reason.as_deref(),
        "StopTransaction"
    );

    match dispatcher
        .store
        .stop_session(
            charge_point_id,
            request.transaction_id,
            request.meter_stop,
            request.reason.clone(),
        )
        .await
    {
        Ok(Some(session)) => {
            let energy = session
                .meter_stop
                .map(|stop| stop.saturating_sub(session.meter_start));
            info!(
                charge_point_id,
                transaction_id = session.transaction_id,
                energy_wh = energy,
                "Transaction completed"
            );
        }
        Ok(None) => {
            warn!(
                charge_point_id,
                transaction_id = request.transaction_id,
                "Stop for unknown transaction; acknowledging anyway"
            );
        }
        Err(e) => {
            warn!(charge_point_id, error = %e, "Failed to stop transaction");
        }
    }

    StopTransactionResponse {
        id_tag_info: Some(IdTagInfo {
            status: AuthorizationStatus::Accepted,
        }),
    }
}
