//! Scripted in-memory transport for tests
//!
//! Stands in for the channel bridge so session, contact and dispatch tests
//! can drive every edge of the contract: gated connects, scripted
//! failures, conversation fixtures and recorded sends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

use super::{
    ChannelAddress, ChannelHandle, ChannelSession, ChannelTransport, ConnectOptions, Conversation,
    DirectoryEntry, OutboundDocument, SendReceipt, TransportEvent,
};
use crate::types::{CourierError, Result};
use async_trait::async_trait;

/// Scripted transport. Each successful connect hands out a fresh
/// [`MockSession`] seeded from the transport-level fixtures.
pub struct MockTransport {
    connect_calls: AtomicUsize,
    /// How many connects fail before one succeeds
    connect_failures: AtomicUsize,
    /// Gate each connect waits on before returning, when set
    connect_gate: Mutex<Option<Arc<Notify>>>,
    /// Events pushed on the handle right after connect
    initial_events: Mutex<Vec<TransportEvent>>,
    /// Conversation fixture copied into every new session
    conversations: Mutex<Vec<Conversation>>,
    /// Directory fixture; None means the channel has no bulk directory
    directory: Mutex<Option<Vec<DirectoryEntry>>>,
    /// Every session handed out, oldest first
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            connect_calls: AtomicUsize::new(0),
            connect_failures: AtomicUsize::new(0),
            connect_gate: Mutex::new(None),
            initial_events: Mutex::new(Vec::new()),
            conversations: Mutex::new(Vec::new()),
            directory: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Make every connect block until the returned notify fires
    pub fn gate_connects(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.connect_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn emit_on_connect(&self, events: Vec<TransportEvent>) {
        *self.initial_events.lock().unwrap() = events;
    }

    pub fn seed_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub fn seed_directory(&self, directory: Vec<DirectoryEntry>) {
        *self.directory.lock().unwrap() = Some(directory);
    }

    /// Most recently handed out session
    pub fn last_session(&self) -> Arc<MockSession> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session handed out yet")
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelTransport for MockTransport {
    async fn connect(&self, _options: ConnectOptions) -> Result<ChannelHandle> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.connect_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.connect_failures.load(Ordering::SeqCst) > 0 {
            self.connect_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(CourierError::Transport(
                "scripted connect failure".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::channel(16);
        let session = Arc::new(MockSession::new(events_tx));
        session.set_conversations(self.conversations.lock().unwrap().clone());
        if let Some(directory) = self.directory.lock().unwrap().clone() {
            session.set_directory(directory);
        }

        let initial_events = self.initial_events.lock().unwrap().clone();
        for event in initial_events {
            session.push_event(event).await;
        }

        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(ChannelHandle {
            session,
            events: events_rx,
        })
    }
}

/// Scripted channel session
pub struct MockSession {
    events_tx: mpsc::Sender<TransportEvent>,
    ready: AtomicBool,
    whoami_fails: AtomicBool,
    identity: Mutex<String>,
    conversations: Mutex<Vec<Conversation>>,
    list_conversations_fails: AtomicBool,
    list_conversations_calls: AtomicUsize,
    directory_calls: AtomicUsize,
    /// Per-address resolved names
    names: Mutex<HashMap<String, String>>,
    /// Addresses whose name lookup errors
    name_failures: Mutex<HashSet<String>>,
    directory: Mutex<Option<Vec<DirectoryEntry>>>,
    /// Addresses whose sends fail
    send_failures: Mutex<HashSet<String>>,
    /// Gate awaited before every send, when set
    send_gate: Mutex<Option<Arc<Notify>>>,
    /// Recorded sends: (address, payload summary)
    sent: Mutex<Vec<(String, String)>>,
    closed: AtomicBool,
}

impl MockSession {
    fn new(events_tx: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events_tx,
            ready: AtomicBool::new(true),
            whoami_fails: AtomicBool::new(false),
            identity: Mutex::new("quotes@channel".to_string()),
            conversations: Mutex::new(Vec::new()),
            list_conversations_fails: AtomicBool::new(false),
            list_conversations_calls: AtomicUsize::new(0),
            directory_calls: AtomicUsize::new(0),
            names: Mutex::new(HashMap::new()),
            name_failures: Mutex::new(HashSet::new()),
            directory: Mutex::new(None),
            send_failures: Mutex::new(HashSet::new()),
            send_gate: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Session not tied to a transport, for resolver/ledger tests
    pub fn standalone() -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(Self::new(tx)), rx)
    }

    pub async fn push_event(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event).await;
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn fail_whoami(&self, fail: bool) {
        self.whoami_fails.store(fail, Ordering::SeqCst);
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub fn fail_list_conversations(&self, fail: bool) {
        self.list_conversations_fails.store(fail, Ordering::SeqCst);
    }

    pub fn set_name(&self, address: &str, name: &str) {
        self.names
            .lock()
            .unwrap()
            .insert(address.to_string(), name.to_string());
    }

    pub fn fail_name_lookup(&self, address: &str) {
        self.name_failures.lock().unwrap().insert(address.to_string());
    }

    pub fn set_directory(&self, directory: Vec<DirectoryEntry>) {
        *self.directory.lock().unwrap() = Some(directory);
    }

    pub fn fail_send_to(&self, address: &str) {
        self.send_failures.lock().unwrap().insert(address.to_string());
    }

    /// Make every send block until the returned notify fires (one
    /// notification per send)
    pub fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn list_conversations_count(&self) -> usize {
        self.list_conversations_calls.load(Ordering::SeqCst)
    }

    pub fn directory_count(&self) -> usize {
        self.directory_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn record_send(&self, to: &ChannelAddress, summary: String) -> Result<SendReceipt> {
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.send_failures.lock().unwrap().contains(to.as_str()) {
            return Err(CourierError::Send(format!("scripted send failure to {to}")));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.as_str().to_string(), summary));
        Ok(SendReceipt {
            message_id: Some(format!("msg-{}", sent.len())),
        })
    }
}

#[async_trait]
impl ChannelSession for MockSession {
    async fn send_text(&self, to: &ChannelAddress, text: &str) -> Result<SendReceipt> {
        self.record_send(to, format!("text:{text}")).await
    }

    async fn send_document(
        &self,
        to: &ChannelAddress,
        document: &OutboundDocument,
    ) -> Result<SendReceipt> {
        self.record_send(to, format!("document:{}", document.filename))
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.list_conversations_calls.fetch_add(1, Ordering::SeqCst);
        if self.list_conversations_fails.load(Ordering::SeqCst) {
            return Err(CourierError::Transport(
                "scripted conversation listing failure".to_string(),
            ));
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn conversation_name(&self, address: &ChannelAddress) -> Result<Option<String>> {
        if self.name_failures.lock().unwrap().contains(address.as_str()) {
            return Err(CourierError::Transport(format!(
                "scripted name lookup failure for {address}"
            )));
        }
        Ok(self.names.lock().unwrap().get(address.as_str()).cloned())
    }

    async fn list_directory(&self) -> Result<Vec<DirectoryEntry>> {
        self.directory_calls.fetch_add(1, Ordering::SeqCst);
        match self.directory.lock().unwrap().clone() {
            Some(directory) => Ok(directory),
            None => Err(CourierError::Transport(
                "channel has no contact directory".to_string(),
            )),
        }
    }

    fn reports_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn whoami(&self) -> Result<String> {
        if self.whoami_fails.load(Ordering::SeqCst) {
            return Err(CourierError::Transport(
                "scripted whoami failure".to_string(),
            ));
        }
        Ok(self.identity.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
