//! Session lifecycle endpoints
//!
//! The UI drives the session through these: an explicit start at setup
//! time, reconnects when the health card shows DEGRADED, and a status poll
//! that carries the pairing token while the channel waits for a scan.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use crate::server::http::{error_status, json_response, read_json_body};
use crate::server::AppState;
use crate::session::StartOutcome;
use crate::types::Result;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default)]
    force_new: bool,
}

fn start_response(result: Result<StartOutcome>) -> Response<Full<Bytes>> {
    match result {
        Ok(outcome) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "success": outcome.success(),
                "outcome": outcome.as_str(),
                "reason": outcome.reason(),
            }),
        ),
        Err(e) => json_response(
            error_status(&e),
            &serde_json::json!({ "success": false, "error": e.to_string() }),
        ),
    }
}

/// GET /session
pub async fn handle_status(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &state.session.status().await)
}

/// POST /session/start
pub async fn handle_start(state: &Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: StartRequest = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    start_response(state.session.start(body.force_new).await)
}

/// POST /session/reconnect
pub async fn handle_reconnect(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    start_response(state.session.reconnect().await)
}

/// POST /session/disconnect
pub async fn handle_disconnect(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    match state.session.disconnect().await {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "success": true })),
        Err(e) => json_response(
            error_status(&e),
            &serde_json::json!({ "success": false, "error": e.to_string() }),
        ),
    }
}
