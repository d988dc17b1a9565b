//! Channel transport contract
//!
//! The chat channel itself (pairing, encryption, wire protocol) is an
//! external collaborator. Courier only depends on the capability surface
//! defined here: open a session, send text or documents, list conversations,
//! and receive asynchronous state-change events.
//!
//! Transport events arrive on a plain mpsc channel rather than through
//! registered callbacks, so a single coordination loop in the session
//! manager consumes them in order and no handler ever re-enters manager
//! state mid-dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::types::Result;

pub mod bridge;
#[cfg(test)]
pub mod mock;

pub use bridge::{BridgeConfig, BridgeTransport};

/// Address of a peer on the chat channel.
///
/// Opaque to Courier; the transport defines the format. Unique per contact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelAddress(String);

impl ChannelAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Options for opening a channel session
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Device label shown on the paired phone / channel account
    pub device_label: String,
    /// Reuse stored credentials when the channel supports it; a fresh
    /// pairing round-trip is forced when false.
    pub restore_state: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            device_label: "courier".to_string(),
            restore_state: true,
        }
    }
}

/// Events pushed by the transport while a session is open
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The channel wants the operator to pair: carries the opaque pairing
    /// payload (QR contents or numeric code).
    PairingCode(String),
    /// The channel reports a completed login
    Connected,
    /// The underlying connection dropped
    Disconnected { reason: String },
}

/// Whether a conversation is one-to-one or a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Direct,
    Group,
}

/// A conversation as listed by the transport
#[derive(Debug, Clone)]
pub struct Conversation {
    pub address: ChannelAddress,
    pub kind: ConversationKind,
    /// Name from conversation metadata; cheaper but less precise than a
    /// per-conversation name lookup.
    pub name: Option<String>,
    /// Whether any message has been exchanged in this conversation
    pub has_history: bool,
}

impl Conversation {
    /// One-to-one conversation whose address matches the channel's
    /// direct-message form (the transport performs the classification).
    pub fn is_direct(&self) -> bool {
        self.kind == ConversationKind::Direct
    }
}

/// Entry in the channel's bulk contact directory
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub address: ChannelAddress,
    pub display_name: Option<String>,
    pub is_group: bool,
}

/// Document payload for `send_document`
#[derive(Debug, Clone)]
pub struct OutboundDocument {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub caption: Option<String>,
}

/// Receipt returned by a successful send
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Channel-assigned message id, when the transport reports one
    pub message_id: Option<String>,
}

/// A live session plus its event stream
pub struct ChannelHandle {
    pub session: Arc<dyn ChannelSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Factory for channel sessions
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open a session. Pairing and login progress arrive afterwards on the
    /// handle's event stream; a returned handle does not imply the channel
    /// is logged in yet.
    async fn connect(&self, options: ConnectOptions) -> Result<ChannelHandle>;
}

/// An open session on the chat channel
#[async_trait]
pub trait ChannelSession: Send + Sync {
    async fn send_text(&self, to: &ChannelAddress, text: &str) -> Result<SendReceipt>;

    async fn send_document(
        &self,
        to: &ChannelAddress,
        document: &OutboundDocument,
    ) -> Result<SendReceipt>;

    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    /// Resolved display name for one conversation. `Ok(None)` when the
    /// channel has no name on record for the address.
    async fn conversation_name(&self, address: &ChannelAddress) -> Result<Option<String>>;

    /// Bulk contact directory. Transports without one return an error and
    /// the caller falls through to its next strategy.
    async fn list_directory(&self) -> Result<Vec<DirectoryEntry>>;

    /// The transport's own cached connection flag. Never trusted alone:
    /// readiness additionally requires a successful `whoami` probe.
    fn reports_ready(&self) -> bool;

    /// Capability probe: ask the channel which account this session is
    /// logged in as. Succeeding proves the session is actually usable.
    async fn whoami(&self) -> Result<String>;

    async fn close(&self) -> Result<()>;
}
