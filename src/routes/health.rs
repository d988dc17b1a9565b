//! Health check endpoints
//!
//! - /health, /healthz - liveness: 200 whenever the process is up
//! - /ready, /readyz - readiness: 200 only while the channel session is
//!   READY, so a front proxy can hold quote traffic during pairing or
//!   reconnects

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use crate::server::http::json_response;
use crate::server::AppState;
use crate::session::SessionPhase;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Health response for the dashboard and deploy tooling
#[derive(Serialize)]
pub struct HealthResponse {
    /// True whenever the service is running
    pub healthy: bool,
    /// Display status: 'online', 'degraded', 'pairing', 'offline'
    pub status: &'static str,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub timestamp: String,
    pub node_id: String,
    pub session: SessionHealth,
}

/// Channel session health details
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    pub phase: SessionPhase,
    pub ready: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
}

async fn build_health_response(state: &AppState) -> HealthResponse {
    let status = state.session.status().await;
    HealthResponse {
        healthy: true,
        status: match status.phase {
            SessionPhase::Ready => "online",
            SessionPhase::Degraded => "degraded",
            SessionPhase::AwaitingPairing => "pairing",
            _ => "offline",
        },
        version: VERSION,
        uptime: state.uptime_secs(),
        timestamp: Utc::now().to_rfc3339(),
        node_id: state.args.node_id.to_string(),
        session: SessionHealth {
            phase: status.phase,
            ready: status.phase == SessionPhase::Ready,
            last_verified_at: status.last_verified_at,
        },
    }
}

/// Liveness probe
pub async fn health_check(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &build_health_response(state).await)
}

/// Readiness probe
pub async fn readiness_check(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    let body = build_health_response(state).await;
    let status = if body.session.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &body)
}
