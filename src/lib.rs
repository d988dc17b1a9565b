//! Courier - outbound quote delivery core
//!
//! Courier is the communication core of a small-business quoting tool: it
//! owns the single long-lived session to the external chat channel, resolves
//! deliverable contacts, and keeps a ledger of every outbound quote with its
//! per-recipient delivery results.
//!
//! ## Services
//!
//! - **Session**: channel session lifecycle with double-checked liveness
//!   probing and explicit reconnection
//! - **Contacts**: tiered contact resolution with a never-empty guarantee
//! - **Ledger**: SQLite-backed quote persistence and sequential dispatch
//! - **Bus**: fan-out of session and delivery events to any subscriber
//! - **Server**: hyper HTTP API plus a WebSocket event feed for the UI

pub mod bus;
pub mod config;
pub mod contacts;
pub mod ledger;
pub mod routes;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{CourierError, Result};
