//! HTTP server for the UI-facing API

pub mod http;

pub use http::{run, AppState};
