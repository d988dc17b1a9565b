//! Real-time WebSocket feed of bus events
//!
//! ## Protocol
//!
//! Connect: `ws://localhost:8090/events`
//!
//! Messages (server → client), one JSON frame per bus event:
//!
//! ```json
//! {"event": "session.phaseChanged",
//!  "payload": {"phase": "AWAITING_PAIRING", "message": "...", "pairingToken": "..."}}
//!
//! {"event": "quote.dispatchResult",
//!  "payload": {"quoteId": 12, "status": "sent",
//!              "perRecipientResults": [{"recipient": "555@dm", "outcome": "OK"}]}}
//! ```
//!
//! A `session.snapshot` frame with the current phase is sent first so a
//! freshly attached UI does not have to wait for the next transition.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_tungstenite::tungstenite::Message as WsMessage;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::bus::NotificationBus;
use crate::server::http::error_response;
use crate::server::AppState;
use crate::session::SessionManager;

/// WebSocket type after upgrade
type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// GET /events - upgrade and stream bus events
pub async fn handle_events_upgrade(
    state: Arc<AppState>,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return error_response(StatusCode::BAD_REQUEST, "expected a WebSocket upgrade");
    }

    match hyper_tungstenite::upgrade(&mut req, None) {
        Ok((response, websocket)) => {
            let bus = state.bus.clone();
            let session = Arc::clone(&state.session);

            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => {
                        if let Err(e) = run_event_feed(ws, bus, session).await {
                            debug!(error = %e, "Event feed ended");
                        }
                    }
                    Err(e) => error!(error = %e, "WebSocket upgrade failed"),
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => {
            error!(error = %e, "WebSocket upgrade error");
            error_response(StatusCode::BAD_REQUEST, "WebSocket upgrade failed")
        }
    }
}

async fn run_event_feed(
    ws: HyperWebSocket,
    bus: NotificationBus,
    session: Arc<SessionManager>,
) -> anyhow::Result<()> {
    let (mut sink, mut stream) = ws.split();
    let mut events = bus.subscribe();

    // Initial snapshot of the current session state
    let snapshot = serde_json::json!({
        "event": "session.snapshot",
        "payload": session.status().await,
    });
    sink.send(WsMessage::Text(snapshot.to_string())).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = serde_json::to_string(&event)?;
                    sink.send(WsMessage::Text(frame)).await?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Slow consumer: drop the backlog, keep the feed alive
                    warn!(skipped, "Event feed subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Ping(data))) => {
                    sink.send(WsMessage::Pong(data)).await?;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Event feed client error");
                    break;
                }
            }
        }
    }

    Ok(())
}
