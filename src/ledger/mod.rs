//! Quote dispatch ledger
//!
//! Persists outbound quotes, dispatches them through the channel session
//! and reconciles the stored status with the aggregated per-recipient
//! results.

pub mod dispatch;
pub mod render;
pub mod store;

pub use dispatch::{
    AttemptOutcome, DispatchAttempt, DispatchLedger, DispatchOutcome, DispatchPayload,
};
pub use store::{DeliveryKind, LineItem, NewQuote, OutboundQuote, QuoteStatus, QuoteStore};
