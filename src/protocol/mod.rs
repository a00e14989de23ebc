//! OCPP wire protocol: envelope framing and typed message payloads.

mod envelope;
mod messages;

pub use envelope::{Envelope, ProtocolError, WireFormat};
pub use messages::{
    error_code, AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, BootNotificationRequest,
    BootNotificationResponse, CallAction, CallRejection, EmptyResponse, HeartbeatResponse,
    IdTagInfo, MeterValuesRequest, RegistrationStatus, StartTransactionRequest,
    StartTransactionResponse, StatusNotificationRequest, StopTransactionRequest,
    StopTransactionResponse,
};
