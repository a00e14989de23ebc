//! StartTransaction handler
//!
//! The store serializes session creation per EVSE, so two simultaneous
//! starts on one connector resolve deterministically: one transaction is
//! created, the other caller gets `ConcurrentTx` with transactionId 0.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::domain::{DomainError, NewSession};
use crate::protocol::{
    AuthorizationStatus, IdTagInfo, StartTransactionRequest, StartTransactionResponse,
};

use super::ProtocolDispatcher;

pub async fn handle_start_transaction(
    dispatcher: &ProtocolDispatcher,
    charge_point_id: &str,
    request: StartTransactionRequest,
) -> StartTransactionResponse {
    info!(
        charge_point_id,
        connector_id = request.connector_id,
        id_tag = request.id_tag.as_str(),
        meter_start = request.meter_start,
        "StartTransaction"
    );

    if request.id_tag.trim().is_empty() {
        return refused(AuthorizationStatus::Invalid);
    }

    let new_session = NewSession {
        charge_point_id: charge_point_id.to_string(),
        evse_id: request.connector_id,
        transaction_id: request.transaction_id,
        id_tag: request.id_tag.clone(),
        meter_start: request.meter_start,
        start_time: request.timestamp.unwrap_or_else(Utc::now),
    };

    match dispatcher.store.start_session(new_session).await {
        Ok(session) => StartTransactionResponse {
            transaction_id: session.transaction_id,
            id_tag_info: IdTagInfo {
                status: AuthorizationStatus::Accepted,
            },
        },
        Err(DomainError::ConnectorBusy { evse_id, .. }) => {
            warn!(
                charge_point_id,
                connector_id = evse_id,
                "Connector already has an ongoing transaction"
            );
            refused(AuthorizationStatus::ConcurrentTx)
        }
        Err(DomainError::DuplicateSession { transaction_id, .. }) => {
            warn!(
                charge_point_id,
                transaction_id, "Duplicate transaction id on this connector"
            );
            refused(AuthorizationStatus::Invalid)
        }
        Err(DomainError::EvseNotFound { evse_id, .. }) => {
            warn!(charge_point_id, connector_id = evse_id, "Start on unknown connector");
            refused(AuthorizationStatus::Invalid)
        }
        Err(e) => {
            error!(charge_point_id, error = %e, "Failed to start transaction");
            refused(AuthorizationStatus::Invalid)
        }
    }
}

fn refused(status: AuthorizationStatus) -> StartTransactionResponse {
    StartTransactionResponse {
        transaction_id: 0,
        id_tag_info: IdTagInfo { status },
    }
}
