//! Domain errors

use thiserror::Error;

/// Domain-level error types
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Charge point not found: {0}")]
    ChargePointNotFound(String),

    #[error("EVSE not found: {charge_point_id}#{evse_id}")]
    EvseNotFound {
        charge_point_id: String,
        evse_id: u32,
    },

    #[error("Session not found for transaction {0}")]
    SessionNotFound(i64),

    #[error("Session already exists for ({charge_point_id}, {evse_id}, {transaction_id})")]
    DuplicateSession {
        charge_point_id: String,
        evse_id: u32,
        transaction_id: i64,
    },

    #[error("EVSE {charge_point_id}#{evse_id} already has an ongoing session")]
    ConnectorBusy {
        charge_point_id: String,
        evse_id: u32,
    },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for domain operations
pub type DomainResult<T> = Result<T, DomainError>;
