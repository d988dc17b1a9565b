//! Quote dispatch
//!
//! `create_and_send` persists a quote and pushes it to one or more
//! recipients through the current session; `resend` re-runs delivery for an
//! existing row. Sends within one dispatch are strictly sequential: the
//! channel serializes messages anyway and parallel sends invite
//! transport-side rate limiting. A failed recipient never aborts the rest
//! of the batch.
//!
//! The post-send status update is deliberately best-effort: by the time it
//! runs, the sends already happened, so a storage error there is logged and
//! the computed outcome is still returned to the caller. Only a failure of
//! the initial insert aborts a dispatch.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::render;
use super::store::{DeliveryKind, NewQuote, QuoteStatus, QuoteStore};
use crate::bus::{BusEvent, NotificationBus};
use crate::session::SessionManager;
use crate::transport::{ChannelAddress, ChannelSession, OutboundDocument};
use crate::types::{CourierError, Result};

/// Outcome of one send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttemptOutcome {
    Ok,
    Error,
}

/// One recipient's delivery result. Ephemeral: aggregated into the quote
/// status and returned to the caller, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchAttempt {
    pub recipient: ChannelAddress,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DispatchAttempt {
    fn ok(recipient: ChannelAddress) -> Self {
        Self {
            recipient,
            outcome: AttemptOutcome::Ok,
            detail: None,
        }
    }

    fn failed(recipient: ChannelAddress, detail: String) -> Self {
        Self {
            recipient,
            outcome: AttemptOutcome::Error,
            detail: Some(detail),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome == AttemptOutcome::Ok
    }
}

/// What actually goes over the wire for a dispatch
#[derive(Debug, Clone)]
pub enum DispatchPayload {
    Text(String),
    Document(OutboundDocument),
}

/// Result returned to the caller of a dispatch, regardless of partial
/// failure, so the UI can show which recipients succeeded
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub quote_id: i64,
    pub status: QuoteStatus,
    #[serde(rename = "perRecipientResults")]
    pub attempts: Vec<DispatchAttempt>,
}

/// Persists quotes and reconciles their status with delivery results
pub struct DispatchLedger {
    store: QuoteStore,
    manager: Arc<SessionManager>,
    bus: NotificationBus,
}

impl DispatchLedger {
    pub fn new(store: QuoteStore, manager: Arc<SessionManager>, bus: NotificationBus) -> Self {
        Self {
            store,
            manager,
            bus,
        }
    }

    /// Persist a quote row and save it without dispatching
    pub async fn save(&self, quote: NewQuote) -> Result<i64> {
        self.store.insert_quote(&quote, QuoteStatus::Created).await
    }

    /// Persist a new quote and dispatch it to every recipient.
    ///
    /// For text quotes the payload may be omitted; the message is then
    /// rendered from the quote's own line items. Two calls with the same
    /// content create two independent rows: deduplication is the caller's
    /// responsibility.
    pub async fn create_and_send(
        &self,
        quote: NewQuote,
        recipients: &[ChannelAddress],
        payload: Option<DispatchPayload>,
    ) -> Result<DispatchOutcome> {
        if recipients.is_empty() {
            return Err(CourierError::InvalidRequest(
                "at least one recipient is required".to_string(),
            ));
        }
        let payload = resolve_payload(&quote, payload)?;

        // A failed insert aborts the dispatch: no record, nothing sent.
        // This surfaces as a ledger error, distinct from send errors.
        let quote_id = self.store.insert_quote(&quote, QuoteStatus::Sending).await?;

        let attempts = self.send_to_all(recipients, &payload).await;
        let status = self.finalize(quote_id, &attempts, false).await;

        info!(
            quote_id,
            status = status.as_str(),
            recipients = attempts.len(),
            delivered = attempts.iter().filter(|a| a.is_ok()).count(),
            "Quote dispatched"
        );
        Ok(DispatchOutcome {
            quote_id,
            status,
            attempts,
        })
    }

    /// Re-dispatch an existing quote to a new recipient list.
    ///
    /// Nothing is re-rendered for text quotes: the message is rebuilt from
    /// the stored line items and customer. Document quotes need the
    /// regenerated document from the caller, since rasterization lives
    /// outside this core. Only delivered quotes (and saved, not-yet-sent
    /// ones) can re-enter `sending`; anything else is rejected by the
    /// transition table before a single send happens.
    pub async fn resend(
        &self,
        quote_id: i64,
        recipients: &[ChannelAddress],
        document: Option<OutboundDocument>,
    ) -> Result<DispatchOutcome> {
        if recipients.is_empty() {
            return Err(CourierError::InvalidRequest(
                "at least one recipient is required".to_string(),
            ));
        }
        let quote = self
            .store
            .get_quote(quote_id)
            .await?
            .ok_or_else(|| CourierError::Ledger(format!("quote {quote_id} not found")))?;

        let payload = match quote.delivery_kind {
            DeliveryKind::Text => DispatchPayload::Text(render::quote_message(
                &quote.customer_name,
                &quote.line_items,
                quote.total_amount,
            )),
            DeliveryKind::Document => DispatchPayload::Document(document.ok_or_else(|| {
                CourierError::InvalidRequest(
                    "document quotes need a regenerated document to resend".to_string(),
                )
            })?),
        };

        // First dispatch of a saved quote counts as a plain send
        let is_resend = quote.status != QuoteStatus::Created;
        self.store.update_status(quote_id, QuoteStatus::Sending).await?;

        let attempts = self.send_to_all(recipients, &payload).await;
        let status = self.finalize(quote_id, &attempts, is_resend).await;

        info!(
            quote_id,
            status = status.as_str(),
            recipients = attempts.len(),
            "Quote re-dispatched"
        );
        Ok(DispatchOutcome {
            quote_id,
            status,
            attempts,
        })
    }

    pub fn store(&self) -> &QuoteStore {
        &self.store
    }

    /// Sequential sends, one attempt per recipient. The session handle is
    /// read once; a missing or unready session fails every attempt instead
    /// of raising.
    async fn send_to_all(
        &self,
        recipients: &[ChannelAddress],
        payload: &DispatchPayload,
    ) -> Vec<DispatchAttempt> {
        let session = self.manager.current_session().await;
        let mut attempts = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            let result = match &session {
                None => Err(CourierError::Session(
                    "channel session not ready".to_string(),
                )),
                Some(session) => send_one(session, recipient, payload).await,
            };
            match result {
                Ok(()) => attempts.push(DispatchAttempt::ok(recipient.clone())),
                Err(e) => {
                    warn!(recipient = %recipient, error = %e, "Send attempt failed");
                    attempts.push(DispatchAttempt::failed(recipient.clone(), e.to_string()));
                }
            }
        }
        attempts
    }

    /// Aggregate attempts into the final status and persist it.
    ///
    /// At-least-one-success semantics: any OK attempt marks the quote
    /// delivered. The update runs in its own transaction; if it fails the
    /// error is logged and the computed status is still returned, because
    /// the sends already happened.
    async fn finalize(&self, quote_id: i64, attempts: &[DispatchAttempt], is_resend: bool) -> QuoteStatus {
        let any_ok = attempts.iter().any(|a| a.is_ok());
        let status = if any_ok {
            if is_resend {
                QuoteStatus::ResendSent
            } else {
                QuoteStatus::Sent
            }
        } else {
            QuoteStatus::SendFailed
        };

        if let Err(e) = self.store.update_status(quote_id, status).await {
            error!(quote_id, error = %e, "Failed to persist dispatch status (send outcome unaffected)");
        }

        self.bus.publish(BusEvent::QuoteDispatchResult {
            quote_id,
            status,
            per_recipient_results: attempts.to_vec(),
        });
        status
    }
}

fn resolve_payload(quote: &NewQuote, payload: Option<DispatchPayload>) -> Result<DispatchPayload> {
    match (quote.delivery_kind, payload) {
        (DeliveryKind::Text, Some(DispatchPayload::Text(text))) => Ok(DispatchPayload::Text(text)),
        (DeliveryKind::Text, None) => Ok(DispatchPayload::Text(render::quote_message(
            &quote.customer_name,
            &quote.line_items,
            quote.total_amount,
        ))),
        (DeliveryKind::Document, Some(DispatchPayload::Document(document))) => {
            Ok(DispatchPayload::Document(document))
        }
        (kind, _) => Err(CourierError::InvalidRequest(format!(
            "payload does not match delivery kind {}",
            kind.as_str()
        ))),
    }
}

async fn send_one(
    session: &Arc<dyn ChannelSession>,
    recipient: &ChannelAddress,
    payload: &DispatchPayload,
) -> Result<()> {
    match payload {
        DispatchPayload::Text(text) => session.send_text(recipient, text).await.map(|_| ()),
        DispatchPayload::Document(document) => {
            session.send_document(recipient, document).await.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::store::LineItem;
    use crate::session::SessionConfig;
    use crate::transport::mock::MockTransport;
    use crate::transport::{ConnectOptions, TransportEvent};
    use std::time::Duration;

    fn sample_quote(kind: DeliveryKind) -> NewQuote {
        NewQuote {
            customer_name: "Acme Hardware".to_string(),
            customer_address: None,
            line_items: vec![LineItem {
                description: "Cement bag 50kg".to_string(),
                quantity: 10.0,
                unit_price: 8.5,
                total: 85.0,
            }],
            total_amount: 85.0,
            delivery_kind: kind,
        }
    }

    fn addresses(list: &[&str]) -> Vec<ChannelAddress> {
        list.iter().map(|a| ChannelAddress::new(*a)).collect()
    }

    /// Manager with a mock session already promoted to READY
    async fn ready_manager() -> (Arc<SessionManager>, Arc<MockTransport>, NotificationBus) {
        let transport = Arc::new(MockTransport::new());
        transport.emit_on_connect(vec![TransportEvent::Connected]);
        let bus = NotificationBus::new();
        let transport_obj: Arc<dyn crate::transport::ChannelTransport> = transport.clone();
        let manager = Arc::new(SessionManager::new(
            transport_obj,
            bus.clone(),
            SessionConfig {
                connect_options: ConnectOptions::default(),
                teardown_grace: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(200),
            },
        ));
        manager.start(false).await.unwrap();
        for _ in 0..100 {
            if manager.is_ready().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(manager.is_ready().await);
        (manager, transport, bus)
    }

    async fn ledger() -> (DispatchLedger, Arc<MockTransport>, NotificationBus) {
        let (manager, transport, bus) = ready_manager().await;
        let store = QuoteStore::open_in_memory().await.unwrap();
        (
            DispatchLedger::new(store, manager, bus.clone()),
            transport,
            bus,
        )
    }

    #[tokio::test]
    async fn test_at_least_one_success_marks_sent() {
        let (ledger, transport, _bus) = ledger().await;
        let session = transport.last_session();
        session.fail_send_to("222@dm");
        session.fail_send_to("333@dm");

        let outcome = ledger
            .create_and_send(
                sample_quote(DeliveryKind::Text),
                &addresses(&["111@dm", "222@dm", "333@dm"]),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, QuoteStatus::Sent);
        assert_eq!(outcome.attempts.len(), 3);
        assert!(outcome.attempts[0].is_ok());
        assert!(!outcome.attempts[1].is_ok());
        assert!(!outcome.attempts[2].is_ok());

        let quote = ledger.store().get_quote(outcome.quote_id).await.unwrap().unwrap();
        assert_eq!(quote.status, QuoteStatus::Sent);
        assert!(quote.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_all_failures_mark_send_failed() {
        let (ledger, transport, _bus) = ledger().await;
        let session = transport.last_session();
        session.fail_send_to("222@dm");
        session.fail_send_to("333@dm");

        let outcome = ledger
            .create_and_send(
                sample_quote(DeliveryKind::Text),
                &addresses(&["222@dm", "333@dm"]),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, QuoteStatus::SendFailed);
        assert!(outcome.attempts.iter().all(|a| !a.is_ok()));
        assert!(outcome.attempts.iter().all(|a| a.detail.is_some()));

        let quote = ledger.store().get_quote(outcome.quote_id).await.unwrap().unwrap();
        assert_eq!(quote.status, QuoteStatus::SendFailed);
        assert!(quote.delivered_at.is_none());
    }

    #[tokio::test]
    async fn test_per_recipient_failure_does_not_abort_batch() {
        let (ledger, transport, _bus) = ledger().await;
        let session = transport.last_session();
        session.fail_send_to("111@dm");

        let outcome = ledger
            .create_and_send(
                sample_quote(DeliveryKind::Text),
                &addresses(&["111@dm", "222@dm"]),
                None,
            )
            .await
            .unwrap();

        // The second recipient was still attempted, in order
        assert_eq!(outcome.attempts.len(), 2);
        let sent = session.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "222@dm");
    }

    #[tokio::test]
    async fn test_text_payload_rendered_from_line_items() {
        let (ledger, transport, _bus) = ledger().await;

        ledger
            .create_and_send(sample_quote(DeliveryKind::Text), &addresses(&["111@dm"]), None)
            .await
            .unwrap();

        let sent = transport.last_session().sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("Quote for Acme Hardware"));
        assert!(sent[0].1.contains("10 x Cement bag 50kg"));
    }

    #[tokio::test]
    async fn test_dispatch_without_session_records_failures() {
        // Manager never started: no session exists
        let transport: Arc<dyn crate::transport::ChannelTransport> = Arc::new(MockTransport::new());
        let bus = NotificationBus::new();
        let manager = Arc::new(SessionManager::new(
            transport,
            bus.clone(),
            SessionConfig::default(),
        ));
        let store = QuoteStore::open_in_memory().await.unwrap();
        let ledger = DispatchLedger::new(store, manager, bus);

        let outcome = ledger
            .create_and_send(
                sample_quote(DeliveryKind::Text),
                &addresses(&["111@dm", "222@dm"]),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, QuoteStatus::SendFailed);
        assert_eq!(outcome.attempts.len(), 2);
        // The row still exists with the failure recorded
        let quote = ledger.store().get_quote(outcome.quote_id).await.unwrap().unwrap();
        assert_eq!(quote.status, QuoteStatus::SendFailed);
    }

    #[tokio::test]
    async fn test_insert_failure_aborts_dispatch() {
        let (manager, transport, bus) = ready_manager().await;
        let store = QuoteStore::open_in_memory().await.unwrap();
        store.close().await;
        let ledger = DispatchLedger::new(store, manager, bus);

        let result = ledger
            .create_and_send(sample_quote(DeliveryKind::Text), &addresses(&["111@dm"]), None)
            .await;

        assert!(matches!(result, Err(CourierError::Ledger(_))));
        // Nothing was sent
        assert!(transport.last_session().sent().is_empty());
    }

    #[tokio::test]
    async fn test_status_update_failure_does_not_mask_send_outcome() {
        let (ledger, transport, _bus) = ledger().await;
        let session = transport.last_session();
        let gate = session.gate_sends();

        let task = {
            let store = ledger.store().clone();
            let manager = Arc::clone(&ledger.manager);
            let bus = ledger.bus.clone();
            tokio::spawn(async move {
                DispatchLedger::new(store, manager, bus)
                    .create_and_send(
                        sample_quote(DeliveryKind::Text),
                        &addresses(&["111@dm"]),
                        None,
                    )
                    .await
            })
        };

        // The insert has happened once the dispatch blocks on its first
        // send; corrupt the row's status so the post-send update becomes an
        // illegal transition and fails
        let quote_id = loop {
            if let Some(quote) = ledger.store().list_quotes(1).await.unwrap().first() {
                break quote.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        ledger
            .store()
            .force_status(quote_id, QuoteStatus::Sent)
            .await
            .unwrap();
        gate.notify_one();

        let outcome = task.await.unwrap().unwrap();
        // The caller still gets the computed outcome, unaffected by the
        // failed persistence step
        assert_eq!(outcome.status, QuoteStatus::Sent);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].is_ok());
    }

    #[tokio::test]
    async fn test_resend_reuses_existing_row() {
        let (ledger, transport, _bus) = ledger().await;

        let first = ledger
            .create_and_send(sample_quote(DeliveryKind::Text), &addresses(&["111@dm"]), None)
            .await
            .unwrap();
        assert_eq!(first.status, QuoteStatus::Sent);
        assert_eq!(ledger.store().quote_count().await.unwrap(), 1);

        let resent = ledger
            .resend(first.quote_id, &addresses(&["444@dm"]), None)
            .await
            .unwrap();

        assert_eq!(resent.quote_id, first.quote_id);
        assert_eq!(resent.status, QuoteStatus::ResendSent);
        // No new row was created
        assert_eq!(ledger.store().quote_count().await.unwrap(), 1);

        let quote = ledger.store().get_quote(first.quote_id).await.unwrap().unwrap();
        assert_eq!(quote.status, QuoteStatus::ResendSent);
        assert!(quote.delivered_at.is_some());

        // The resend went to the new recipient with a re-rendered message
        let sent = transport.last_session().sent();
        assert_eq!(sent.last().unwrap().0, "444@dm");
        assert!(sent.last().unwrap().1.contains("Quote for Acme Hardware"));
    }

    #[tokio::test]
    async fn test_resend_of_failed_quote_is_rejected() {
        let (ledger, transport, _bus) = ledger().await;
        let session = transport.last_session();
        session.fail_send_to("111@dm");

        let failed = ledger
            .create_and_send(sample_quote(DeliveryKind::Text), &addresses(&["111@dm"]), None)
            .await
            .unwrap();
        assert_eq!(failed.status, QuoteStatus::SendFailed);

        let sends_before = session.sent().len();
        let result = ledger.resend(failed.quote_id, &addresses(&["222@dm"]), None).await;
        assert!(matches!(result, Err(CourierError::Ledger(_))));
        // Rejected before any send happened
        assert_eq!(session.sent().len(), sends_before);
    }

    #[tokio::test]
    async fn test_document_resend_requires_document() {
        let (ledger, _transport, _bus) = ledger().await;

        let outcome = ledger
            .create_and_send(
                sample_quote(DeliveryKind::Document),
                &addresses(&["111@dm"]),
                Some(DispatchPayload::Document(OutboundDocument {
                    bytes: vec![1, 2, 3],
                    filename: "quote.pdf".to_string(),
                    caption: Some("Your quote".to_string()),
                })),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, QuoteStatus::Sent);

        let result = ledger.resend(outcome.quote_id, &addresses(&["222@dm"]), None).await;
        assert!(matches!(result, Err(CourierError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_payload_kind_mismatch_rejected() {
        let (ledger, _transport, _bus) = ledger().await;

        let result = ledger
            .create_and_send(
                sample_quote(DeliveryKind::Document),
                &addresses(&["111@dm"]),
                Some(DispatchPayload::Text("not a document".to_string())),
            )
            .await;
        assert!(matches!(result, Err(CourierError::InvalidRequest(_))));
        assert_eq!(ledger.store().quote_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_content_dedup_across_calls() {
        let (ledger, _transport, _bus) = ledger().await;

        ledger
            .create_and_send(sample_quote(DeliveryKind::Text), &addresses(&["111@dm"]), None)
            .await
            .unwrap();
        ledger
            .create_and_send(sample_quote(DeliveryKind::Text), &addresses(&["111@dm"]), None)
            .await
            .unwrap();

        assert_eq!(ledger.store().quote_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_result_published_on_bus() {
        let (ledger, _transport, bus) = ledger().await;
        let mut rx = bus.subscribe();

        let outcome = ledger
            .create_and_send(sample_quote(DeliveryKind::Text), &addresses(&["111@dm"]), None)
            .await
            .unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let BusEvent::QuoteDispatchResult {
                quote_id,
                status,
                per_recipient_results,
            } = event
            {
                assert_eq!(quote_id, outcome.quote_id);
                assert_eq!(status, QuoteStatus::Sent);
                assert_eq!(per_recipient_results.len(), 1);
                break;
            }
        }
    }
}
