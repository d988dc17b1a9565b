//! Channel bridge transport
//!
//! Concrete [`ChannelTransport`] that talks JSON over one persistent
//! WebSocket to the channel-bridge sidecar (the process that owns the real
//! chat-channel credentials and wire protocol).
//!
//! One io task per session multiplexes the socket: requests carry an `id`
//! and are correlated with `{id, ok, data|error}` responses; unsolicited
//! `{event: ...}` frames are forwarded to the session event stream. The
//! bridge connection does NOT reconnect itself; when the socket drops the
//! session is dead and the session manager decides whether and when to
//! rebuild.
//!
//! Wire frames:
//!
//! ```json
//! {"id": 7, "op": "send_text", "to": "555@dm", "text": "..."}
//! {"id": 7, "ok": true, "data": {"messageId": "ABC"}}
//! {"event": "pairing_code", "code": "2@abcdef..."}
//! ```

use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{
    ChannelAddress, ChannelHandle, ChannelSession, ChannelTransport, ConnectOptions, Conversation,
    ConversationKind, DirectoryEntry, OutboundDocument, SendReceipt, TransportEvent,
};
use crate::types::{CourierError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Default timeout for the bridge WebSocket handshake
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Default per-request timeout
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bridge connection settings
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// WebSocket URL of the channel bridge
    pub url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// WebSocket transport to the channel bridge
pub struct BridgeTransport {
    config: BridgeConfig,
}

impl BridgeTransport {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChannelTransport for BridgeTransport {
    async fn connect(&self, options: ConnectOptions) -> Result<ChannelHandle> {
        info!(url = %self.config.url, "Connecting to channel bridge");

        let request = Request::builder()
            .uri(&self.config.url)
            .header(
                "Host",
                self.config.url.split("//").last().unwrap_or("localhost"),
            )
            .header("Origin", "http://localhost")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| CourierError::Transport(format!("Failed to build request: {e}")))?;

        let (ws, _) = timeout(
            self.config.connect_timeout,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| CourierError::Transport("Timeout connecting to channel bridge".to_string()))?
        .map_err(|e| CourierError::Transport(format!("Bridge WebSocket connect failed: {e}")))?;

        let (mut sink, stream) = ws.split();

        // Tell the bridge which device identity to open and whether to
        // restore stored credentials
        let open = json!({
            "op": "open",
            "deviceLabel": options.device_label,
            "restoreState": options.restore_state,
        });
        sink.send(Message::Text(open.to_string()))
            .await
            .map_err(|e| CourierError::Transport(format!("Failed to open bridge session: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<BridgeCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(32);
        let ready = Arc::new(AtomicBool::new(false));

        tokio::spawn(bridge_io_loop(
            sink,
            stream,
            cmd_rx,
            event_tx,
            Arc::clone(&ready),
        ));

        let session = Arc::new(BridgeSession {
            cmd_tx,
            ready,
            request_timeout: self.config.request_timeout,
        });
        Ok(ChannelHandle {
            session,
            events: event_rx,
        })
    }
}

enum BridgeCommand {
    Request {
        op: String,
        params: serde_json::Map<String, Value>,
        response_tx: oneshot::Sender<Result<Value>>,
    },
    Shutdown,
}

/// Session over an established bridge connection
struct BridgeSession {
    cmd_tx: mpsc::Sender<BridgeCommand>,
    /// Bridge's last reported login state; false once the socket drops
    ready: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl BridgeSession {
    async fn request(&self, op: &str, params: serde_json::Map<String, Value>) -> Result<Value> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(BridgeCommand::Request {
                op: op.to_string(),
                params,
                response_tx,
            })
            .await
            .map_err(|_| CourierError::Transport("bridge connection closed".to_string()))?;

        match timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CourierError::Transport(
                "bridge response channel closed".to_string(),
            )),
            Err(_) => Err(CourierError::Transport(format!(
                "bridge request timeout ({op})"
            ))),
        }
    }
}

#[async_trait]
impl ChannelSession for BridgeSession {
    async fn send_text(&self, to: &ChannelAddress, text: &str) -> Result<SendReceipt> {
        let mut params = serde_json::Map::new();
        params.insert("to".to_string(), json!(to.as_str()));
        params.insert("text".to_string(), json!(text));
        let data = self.request("send_text", params).await?;
        Ok(receipt_from_value(&data))
    }

    async fn send_document(
        &self,
        to: &ChannelAddress,
        document: &OutboundDocument,
    ) -> Result<SendReceipt> {
        let mut params = serde_json::Map::new();
        params.insert("to".to_string(), json!(to.as_str()));
        params.insert("filename".to_string(), json!(document.filename));
        params.insert(
            "bytes".to_string(),
            json!(base64::engine::general_purpose::STANDARD.encode(&document.bytes)),
        );
        if let Some(ref caption) = document.caption {
            params.insert("caption".to_string(), json!(caption));
        }
        let data = self.request("send_document", params).await?;
        Ok(receipt_from_value(&data))
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let data = self.request("list_conversations", serde_json::Map::new()).await?;
        let items = data
            .as_array()
            .ok_or_else(|| CourierError::Transport("malformed conversation list".to_string()))?;
        Ok(items.iter().filter_map(conversation_from_value).collect())
    }

    async fn conversation_name(&self, address: &ChannelAddress) -> Result<Option<String>> {
        let mut params = serde_json::Map::new();
        params.insert("address".to_string(), json!(address.as_str()));
        let data = self.request("conversation_name", params).await?;
        Ok(data
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn list_directory(&self) -> Result<Vec<DirectoryEntry>> {
        let data = self.request("list_directory", serde_json::Map::new()).await?;
        let items = data
            .as_array()
            .ok_or_else(|| CourierError::Transport("malformed directory list".to_string()))?;
        Ok(items.iter().filter_map(directory_entry_from_value).collect())
    }

    fn reports_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn whoami(&self) -> Result<String> {
        let data = self.request("whoami", serde_json::Map::new()).await?;
        data.get("identity")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| data.as_str().map(str::to_string))
            .ok_or_else(|| CourierError::Transport("malformed whoami response".to_string()))
    }

    async fn close(&self) -> Result<()> {
        // Best effort: tell the bridge, then stop the io loop either way
        let _ = self.request("close", serde_json::Map::new()).await;
        let _ = self.cmd_tx.send(BridgeCommand::Shutdown).await;
        Ok(())
    }
}

/// Multiplex one bridge socket: correlate request/response frames by id,
/// forward event frames, answer pings
async fn bridge_io_loop(
    mut sink: WsSink,
    mut stream: WsStream,
    mut cmd_rx: mpsc::Receiver<BridgeCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
    ready: Arc<AtomicBool>,
) {
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(BridgeCommand::Request { op, params, response_tx }) => {
                        let id = next_id;
                        next_id += 1;
                        let mut frame = serde_json::Map::new();
                        frame.insert("id".to_string(), json!(id));
                        frame.insert("op".to_string(), json!(op));
                        frame.extend(params);

                        pending.insert(id, response_tx);
                        if let Err(e) = sink.send(Message::Text(Value::Object(frame).to_string())).await {
                            error!(error = %e, "Failed to send bridge request");
                            if let Some(tx) = pending.remove(&id) {
                                let _ = tx.send(Err(CourierError::Transport(
                                    "bridge connection closed".to_string(),
                                )));
                            }
                            break;
                        }
                    }
                    Some(BridgeCommand::Shutdown) | None => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, &mut pending, &event_tx, &ready).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "Bridge closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Bridge WebSocket error");
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
        }
    }

    ready.store(false, Ordering::SeqCst);
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CourierError::Transport(
            "bridge connection closed".to_string(),
        )));
    }
    let _ = event_tx
        .send(TransportEvent::Disconnected {
            reason: "bridge connection closed".to_string(),
        })
        .await;
    debug!("Bridge io loop ended");
}

async fn handle_frame(
    text: &str,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value>>>,
    event_tx: &mpsc::Sender<TransportEvent>,
    ready: &Arc<AtomicBool>,
) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Dropping malformed bridge frame");
            return;
        }
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let Some(response_tx) = pending.remove(&id) else {
            warn!(id, "Bridge response with no pending request");
            return;
        };
        let result = if frame.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(frame.get("data").cloned().unwrap_or(Value::Null))
        } else {
            let message = frame
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown bridge error");
            Err(CourierError::Transport(message.to_string()))
        };
        let _ = response_tx.send(result);
        return;
    }

    if let Some(event) = event_from_frame(&frame) {
        match &event {
            TransportEvent::Connected => ready.store(true, Ordering::SeqCst),
            TransportEvent::Disconnected { .. } => ready.store(false, Ordering::SeqCst),
            TransportEvent::PairingCode(_) => {}
        }
        let _ = event_tx.send(event).await;
    } else {
        debug!("Ignoring unrecognized bridge frame");
    }
}

fn event_from_frame(frame: &Value) -> Option<TransportEvent> {
    match frame.get("event")?.as_str()? {
        "pairing_code" => frame
            .get("code")
            .and_then(Value::as_str)
            .map(|code| TransportEvent::PairingCode(code.to_string())),
        "connected" => Some(TransportEvent::Connected),
        "disconnected" => Some(TransportEvent::Disconnected {
            reason: frame
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        }),
        _ => None,
    }
}

fn receipt_from_value(data: &Value) -> SendReceipt {
    SendReceipt {
        message_id: data
            .get("messageId")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn conversation_from_value(value: &Value) -> Option<Conversation> {
    let address = value.get("address")?.as_str()?;
    let kind = match value.get("kind").and_then(Value::as_str) {
        Some("direct") => ConversationKind::Direct,
        _ => ConversationKind::Group,
    };
    Some(Conversation {
        address: ChannelAddress::new(address),
        kind,
        name: value.get("name").and_then(Value::as_str).map(str::to_string),
        has_history: value
            .get("hasHistory")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn directory_entry_from_value(value: &Value) -> Option<DirectoryEntry> {
    let address = value.get("address")?.as_str()?;
    Some(DirectoryEntry {
        address: ChannelAddress::new(address),
        display_name: value
            .get("displayName")
            .and_then(Value::as_str)
            .map(str::to_string),
        is_group: value.get("isGroup").and_then(Value::as_bool).unwrap_or(false),
    })
}
