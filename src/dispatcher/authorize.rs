//! Authorize handler
//!
//! This gateway runs no tag whitelist; any non-empty idTag is accepted.
//! Billing-grade authorization lives upstream of the gateway.

use tracing::info;

use crate::protocol::{AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, IdTagInfo};

use super::ProtocolDispatcher;

pub async fn handle_authorize(
    _dispatcher: &ProtocolDispatcher,
    charge_point_id: &str,
    request: AuthorizeRequest,
) -> AuthorizeResponse {
    let status = if request.id_tag.trim().is_empty() {
        AuthorizationStatus::Invalid
    } else {
        AuthorizationStatus::Accepted
    };
    info!(charge_point_id, id_tag = request.id_tag.as_str(), ?status, "Authorize");

    AuthorizeResponse {
        id_tag_info: IdTagInfo { status },
    }
}
