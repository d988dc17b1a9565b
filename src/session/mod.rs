//! Channel session lifecycle
//!
//! One session manager per process owns the single channel session, its
//! state machine and the reconnection policy; a liveness probe task keeps
//! the reported phase honest.

pub mod manager;
pub mod probe;

pub use manager::{SessionConfig, SessionManager, SessionPhase, SessionStatus, StartOutcome};
pub use probe::LivenessProbe;
