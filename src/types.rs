//! Error taxonomy for Courier
//!
//! One variant per failure class from the delivery core's contract. Fallback
//! and retry logic that has a defined next step is resolved locally by the
//! component that owns it; only conditions with no recovery surface through
//! these variants.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout Courier
pub type Result<T> = std::result::Result<T, CourierError>;

/// Courier error types
#[derive(Error, Debug)]
pub enum CourierError {
    /// Channel transport failed to connect or dropped mid-operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// A send to a single recipient failed. Recorded per attempt, never
    /// aborts the rest of a dispatch batch.
    #[error("Send failed: {0}")]
    Send(String),

    /// Contact resolution tier failed (contained per tier)
    #[error("Contact resolution failed: {0}")]
    Resolution(String),

    /// Quote ledger storage error
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Liveness probe neither confirmed nor denied readiness in time
    #[error("Liveness probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    /// Session is missing or in the wrong phase for the requested operation
    #[error("Session error: {0}")]
    Session(String),

    /// Caller-supplied input was rejected
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CourierError {
    fn from(e: sqlx::Error) -> Self {
        CourierError::Ledger(e.to_string())
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Internal(format!("JSON serialization failed: {e}"))
    }
}
