//! HTTP server implementation
//!
//! hyper http1 with TokioIo for async handling. One accept loop, one task
//! per connection, a flat method/path dispatcher over the route handlers.
//! `/events` upgrades to a WebSocket, so connections are served with
//! upgrade support.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::bus::NotificationBus;
use crate::config::Args;
use crate::contacts::ContactResolver;
use crate::ledger::{DispatchLedger, QuoteStore};
use crate::routes;
use crate::session::SessionManager;
use crate::types::{CourierError, Result};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub session: Arc<SessionManager>,
    pub resolver: Arc<ContactResolver>,
    pub ledger: Arc<DispatchLedger>,
    pub store: QuoteStore,
    pub bus: NotificationBus,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        args: Args,
        session: Arc<SessionManager>,
        resolver: Arc<ContactResolver>,
        ledger: Arc<DispatchLedger>,
        store: QuoteStore,
        bus: NotificationBus,
    ) -> Self {
        Self {
            args,
            session,
            resolver,
            ledger,
            store,
            bus,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Run the HTTP server until the process exits
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await.map_err(|e| {
        CourierError::Config(format!("Failed to bind {}: {e}", state.args.listen))
    })?;
    info!("API listening on {}", state.args.listen);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        debug!(%peer, "Connection accepted");

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, hyper::Error>(handle_request(state, req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!(error = %e, "Connection error");
            }
        });
    }
}

async fn handle_request(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Request");

    match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            routes::health::health_check(&state).await
        }
        (Method::GET, "/ready") | (Method::GET, "/readyz") => {
            routes::health::readiness_check(&state).await
        }

        (Method::GET, "/session") => routes::session::handle_status(&state).await,
        (Method::POST, "/session/start") => routes::session::handle_start(&state, req).await,
        (Method::POST, "/session/reconnect") => routes::session::handle_reconnect(&state).await,
        (Method::POST, "/session/disconnect") => routes::session::handle_disconnect(&state).await,

        (Method::GET, "/contacts") => routes::contacts::handle_list(&state).await,

        (Method::GET, "/events") => routes::events_ws::handle_events_upgrade(state, req).await,

        (Method::POST, "/quotes") => routes::quotes::handle_save(&state, req).await,
        (Method::POST, "/quotes/send") => routes::quotes::handle_send(&state, req).await,
        (Method::GET, "/quotes") => routes::quotes::handle_list(&state).await,
        (Method::POST, p) if p.starts_with("/quotes/") && p.ends_with("/resend") => {
            routes::quotes::handle_resend(&state, &path, req).await
        }
        (Method::GET, p) if p.starts_with("/quotes/") => {
            routes::quotes::handle_get(&state, &path).await
        }

        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Serialize a body into a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap(),
        Err(e) => {
            error!(error = %e, "Response serialization failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}

/// JSON error body
pub fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message });
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Status code for a core error surfacing through the API
pub fn error_status(error: &CourierError) -> StatusCode {
    match error {
        CourierError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CourierError::Session(_) => StatusCode::SERVICE_UNAVAILABLE,
        CourierError::Transport(_) | CourierError::ProbeTimeout(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Read and deserialize a JSON request body. An empty body deserializes
/// from `{}` so bodyless POSTs can use `#[serde(default)]` structs.
pub async fn read_json_body<T: DeserializeOwned>(
    req: Request<Incoming>,
) -> std::result::Result<T, Response<Full<Bytes>>> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read body: {e}"),
            ))
        }
    };
    let bytes = if bytes.is_empty() {
        Bytes::from_static(b"{}")
    } else {
        bytes
    };
    serde_json::from_slice(&bytes).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {e}"))
    })
}
