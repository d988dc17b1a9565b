//! Contact directory endpoint

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use std::sync::Arc;

use crate::server::http::json_response;
use crate::server::AppState;

/// GET /contacts
///
/// Always returns at least one entry; when resolution fails entirely the
/// list holds the manual-entry placeholder and the UI prompts for a number.
pub async fn handle_list(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    let contacts = state.resolver.resolve().await;
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "contacts": contacts,
            "stats": state.resolver.stats(),
        }),
    )
}
