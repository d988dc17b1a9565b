//! Quote endpoints
//!
//! Dispatch, resend, save and listing. Responses carry the per-recipient
//! results so the UI can show exactly which recipients got the quote
//! instead of a single pass/fail flag.

use base64::Engine;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use crate::ledger::{DeliveryKind, DispatchPayload, LineItem, NewQuote};
use crate::server::http::{error_response, error_status, json_response, read_json_body};
use crate::server::AppState;
use crate::transport::{ChannelAddress, OutboundDocument};

/// Base64-encoded document attached to a send or resend
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPayload {
    pub filename: String,
    pub bytes: String,
    #[serde(default)]
    pub caption: Option<String>,
}

impl DocumentPayload {
    fn decode(self) -> std::result::Result<OutboundDocument, String> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.bytes)
            .map_err(|e| format!("document bytes are not valid base64: {e}"))?;
        Ok(OutboundDocument {
            bytes,
            filename: self.filename,
            caption: self.caption,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendQuoteRequest {
    customer_name: String,
    #[serde(default)]
    customer_address: Option<String>,
    line_items: Vec<LineItem>,
    total_amount: f64,
    delivery_kind: DeliveryKind,
    recipients: Vec<String>,
    /// Pre-rendered message for text quotes; rendered from the line items
    /// when omitted
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    document: Option<DocumentPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveQuoteRequest {
    customer_name: String,
    #[serde(default)]
    customer_address: Option<String>,
    line_items: Vec<LineItem>,
    total_amount: f64,
    delivery_kind: DeliveryKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResendRequest {
    recipients: Vec<String>,
    #[serde(default)]
    document: Option<DocumentPayload>,
}

fn to_addresses(recipients: Vec<String>) -> Vec<ChannelAddress> {
    recipients.into_iter().map(ChannelAddress::new).collect()
}

/// POST /quotes/send
pub async fn handle_send(state: &Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: SendQuoteRequest = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let payload = match (body.message, body.document) {
        (_, Some(document)) => match document.decode() {
            Ok(document) => Some(DispatchPayload::Document(document)),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
        },
        (Some(message), None) => Some(DispatchPayload::Text(message)),
        (None, None) => None,
    };

    let quote = NewQuote {
        customer_name: body.customer_name,
        customer_address: body.customer_address,
        line_items: body.line_items,
        total_amount: body.total_amount,
        delivery_kind: body.delivery_kind,
    };

    match state
        .ledger
        .create_and_send(quote, &to_addresses(body.recipients), payload)
        .await
    {
        Ok(outcome) => json_response(StatusCode::OK, &outcome),
        Err(e) => error_response(error_status(&e), &e.to_string()),
    }
}

/// POST /quotes
pub async fn handle_save(state: &Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: SaveQuoteRequest = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let quote = NewQuote {
        customer_name: body.customer_name,
        customer_address: body.customer_address,
        line_items: body.line_items,
        total_amount: body.total_amount,
        delivery_kind: body.delivery_kind,
    };
    match state.ledger.save(quote).await {
        Ok(quote_id) => json_response(
            StatusCode::CREATED,
            &serde_json::json!({ "quoteId": quote_id, "status": "created" }),
        ),
        Err(e) => error_response(error_status(&e), &e.to_string()),
    }
}

/// POST /quotes/{id}/resend
pub async fn handle_resend(
    state: &Arc<AppState>,
    path: &str,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let Some(quote_id) = parse_resend_id(path) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid quote id");
    };
    let body: ResendRequest = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let document = match body.document {
        Some(document) => match document.decode() {
            Ok(document) => Some(document),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
        },
        None => None,
    };

    match state
        .ledger
        .resend(quote_id, &to_addresses(body.recipients), document)
        .await
    {
        Ok(outcome) => json_response(StatusCode::OK, &outcome),
        Err(e) => error_response(error_status(&e), &e.to_string()),
    }
}

/// GET /quotes
pub async fn handle_list(state: &Arc<AppState>) -> Response<Full<Bytes>> {
    match state.store.list_quotes(100).await {
        Ok(quotes) => json_response(StatusCode::OK, &serde_json::json!({ "quotes": quotes })),
        Err(e) => error_response(error_status(&e), &e.to_string()),
    }
}

/// GET /quotes/{id}
pub async fn handle_get(state: &Arc<AppState>, path: &str) -> Response<Full<Bytes>> {
    let Some(quote_id) = path
        .strip_prefix("/quotes/")
        .and_then(|id| id.parse::<i64>().ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, "invalid quote id");
    };
    match state.store.get_quote(quote_id).await {
        Ok(Some(quote)) => json_response(StatusCode::OK, &quote),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "quote not found"),
        Err(e) => error_response(error_status(&e), &e.to_string()),
    }
}

fn parse_resend_id(path: &str) -> Option<i64> {
    path.strip_prefix("/quotes/")?
        .strip_suffix("/resend")?
        .parse()
        .ok()
}
