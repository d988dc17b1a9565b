//! Notification bus
//!
//! Fan-out of session and delivery events to any number of subscribers:
//! the UI event feed, log sinks, test harnesses. Publishing is
//! fire-and-forget over a tokio broadcast channel; a slow or dropped
//! subscriber never blocks the publisher or the other subscribers, and
//! subscriptions can be opened or dropped at any time.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::ledger::{DispatchAttempt, QuoteStatus};
use crate::session::SessionPhase;

/// Buffered events per subscriber before the slowest one starts lagging
const BUS_CAPACITY: usize = 256;

/// Events published on the bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum BusEvent {
    /// The session phase changed. `pairing_token` is present only while the
    /// channel is awaiting pairing.
    #[serde(rename = "session.phaseChanged", rename_all = "camelCase")]
    SessionPhaseChanged {
        phase: SessionPhase,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pairing_token: Option<String>,
    },

    /// A dispatch finished, with one result per recipient
    #[serde(rename = "quote.dispatchResult", rename_all = "camelCase")]
    QuoteDispatchResult {
        quote_id: i64,
        status: QuoteStatus,
        per_recipient_results: Vec<DispatchAttempt>,
    },
}

impl BusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::SessionPhaseChanged { .. } => "session.phaseChanged",
            BusEvent::QuoteDispatchResult { .. } => "quote.dispatchResult",
        }
    }
}

/// Cloneable handle to the bus
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<BusEvent>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Never blocks and never fails: a bus with no subscribers simply drops
    /// the event.
    pub fn publish(&self, event: BusEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(delivered) => debug!(event = name, subscribers = delivered, "Published bus event"),
            Err(_) => debug!(event = name, "No subscribers for bus event"),
        }
    }

    /// Open a subscription. Events published before this call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
