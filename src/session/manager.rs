//! Session manager - single source of truth for the channel session
//!
//! Owns the one long-lived session to the external chat channel: opening it,
//! tracking its phase, tearing it down and rebuilding it. Nothing else in the
//! process mutates session state; the ledger and the contact resolver only
//! read the current handle.
//!
//! ## Phase machine
//!
//! ```text
//! NOT_INITIALIZED ──start()──▶ INITIALIZING ──pairing──▶ AWAITING_PAIRING
//!        ▲                          │  │                        │
//!        │ connect failed           │  └──────logged in─────────┤
//!        └──────────────────────────┘                           ▼
//!             CLOSED ◀──disconnect()── any            READY ──probe──▶ DEGRADED
//!                │                                               │
//!                └───────────reconnect()──▶ INITIALIZING ◀───────┘
//! ```
//!
//! Readiness is double-checked: the transport's cached flag must agree with
//! a direct capability probe (`whoami`) before READY is ever reported. A
//! stale cached flag on its own is treated as an inconsistency and triggers
//! a teardown-and-rebuild.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, NotificationBus};
use crate::transport::{ChannelSession, ChannelTransport, ConnectOptions, TransportEvent};
use crate::types::{CourierError, Result};

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    NotInitialized,
    Initializing,
    AwaitingPairing,
    Ready,
    Degraded,
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::NotInitialized => "NOT_INITIALIZED",
            SessionPhase::Initializing => "INITIALIZING",
            SessionPhase::AwaitingPairing => "AWAITING_PAIRING",
            SessionPhase::Ready => "READY",
            SessionPhase::Degraded => "DEGRADED",
            SessionPhase::Closed => "CLOSED",
        }
    }

    /// Whether `next` is a legal move from this phase.
    ///
    /// `Initializing -> Ready` covers transports that restore stored
    /// credentials and log in without a pairing round-trip;
    /// `Initializing -> NotInitialized` is the connect-failure revert that
    /// keeps immediate retries possible.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (_, Closed)
                | (NotInitialized, Initializing)
                | (Closed, Initializing)
                | (Degraded, Initializing)
                | (Initializing, AwaitingPairing)
                | (Initializing, Ready)
                | (Initializing, NotInitialized)
                | (AwaitingPairing, Ready)
                | (Ready, Degraded)
        )
    }
}

/// Outcome of a `start()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session was opened; pairing/login progress follows on the bus
    Started,
    /// A live session passed the liveness probe; no new session was created
    AlreadyConnected,
    /// Another `start()` is in flight; this call had no side effects
    AlreadyInitializing,
}

impl StartOutcome {
    pub fn success(&self) -> bool {
        !matches!(self, StartOutcome::AlreadyInitializing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StartOutcome::Started => "started",
            StartOutcome::AlreadyConnected => "already_connected",
            StartOutcome::AlreadyInitializing => "already_initializing",
        }
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            StartOutcome::AlreadyInitializing => Some("already initializing"),
            _ => None,
        }
    }
}

/// Tunables for the session manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_options: ConnectOptions,
    /// Bounded wait between tearing down an old session and reopening
    pub teardown_grace: Duration,
    /// Window for the `whoami` capability probe; no answer counts as failure
    pub probe_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_options: ConnectOptions::default(),
            teardown_grace: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Point-in-time session state for status endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub phase: SessionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_token: Option<String>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

struct SessionInner {
    phase: SessionPhase,
    /// Present only while AWAITING_PAIRING
    pairing_token: Option<String>,
    session: Option<Arc<dyn ChannelSession>>,
    last_verified_at: Option<DateTime<Utc>>,
    /// Bumped on every teardown/connect so event loops for replaced
    /// sessions notice and exit
    epoch: u64,
}

/// Single source of truth for the channel session lifecycle
pub struct SessionManager {
    transport: Arc<dyn ChannelTransport>,
    bus: NotificationBus,
    config: SessionConfig,
    inner: RwLock<SessionInner>,
    /// Sole mutual-exclusion guard for `start()`; set and cleared on every
    /// exit path including errors
    initializing: AtomicBool,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        bus: NotificationBus,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            bus,
            config,
            inner: RwLock::new(SessionInner {
                phase: SessionPhase::NotInitialized,
                pairing_token: None,
                session: None,
                last_verified_at: None,
                epoch: 0,
            }),
            initializing: AtomicBool::new(false),
        }
    }

    /// Open the channel session, or verify the existing one.
    ///
    /// Idempotent while a start is in flight: a concurrent call returns
    /// [`StartOutcome::AlreadyInitializing`] without touching anything.
    /// With `force_new` the existing session is always torn down and
    /// rebuilt; without it, a live session that passes the liveness probe
    /// is reused.
    pub async fn start(self: &Arc<Self>, force_new: bool) -> Result<StartOutcome> {
        if self.initializing.swap(true, Ordering::SeqCst) {
            debug!("start() ignored: already initializing");
            return Ok(StartOutcome::AlreadyInitializing);
        }
        let result = self.start_inner(force_new).await;
        self.initializing.store(false, Ordering::SeqCst);
        result
    }

    async fn start_inner(self: &Arc<Self>, force_new: bool) -> Result<StartOutcome> {
        if !force_new {
            let (existing, phase) = {
                let inner = self.inner.read().await;
                (inner.session.clone(), inner.phase)
            };
            if let Some(session) = existing {
                if phase == SessionPhase::Ready {
                    match self.verify_session(&session).await {
                        Ok(identity) => {
                            self.inner.write().await.last_verified_at = Some(Utc::now());
                            debug!(identity = %identity, "Existing session verified, reusing");
                            return Ok(StartOutcome::AlreadyConnected);
                        }
                        Err(e) => {
                            // Cached state says ready, the probe disagrees:
                            // inconsistency, fall through to a full rebuild
                            warn!(error = %e, "Session claims ready but probe failed, rebuilding");
                        }
                    }
                } else {
                    info!(phase = phase.as_str(), "Existing session not ready, rebuilding");
                }
            }
        }

        let had_session = self.teardown_existing().await;
        self.set_phase(
            SessionPhase::Initializing,
            "Opening channel session".to_string(),
            None,
        )
        .await;
        if had_session {
            tokio::time::sleep(self.config.teardown_grace).await;
        }

        match self
            .transport
            .connect(self.config.connect_options.clone())
            .await
        {
            Ok(handle) => {
                let epoch = {
                    let mut inner = self.inner.write().await;
                    inner.session = Some(Arc::clone(&handle.session));
                    inner.epoch += 1;
                    inner.epoch
                };
                let manager = Arc::clone(self);
                tokio::spawn(async move { manager.run_event_loop(epoch, handle.events).await });
                info!("Channel session opened, waiting for transport events");
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                error!(error = %e, "Channel connect failed");
                self.set_phase(
                    SessionPhase::NotInitialized,
                    "Channel connect failed".to_string(),
                    None,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Tear down and rebuild the session. Valid from CLOSED and DEGRADED,
    /// and harmless from anywhere else.
    pub async fn reconnect(self: &Arc<Self>) -> Result<StartOutcome> {
        info!("Reconnect requested");
        self.start(true).await
    }

    /// Close the session and report the terminal phase
    pub async fn disconnect(&self) -> Result<()> {
        if !self.teardown_existing().await {
            self.set_phase(
                SessionPhase::Closed,
                "Channel session closed".to_string(),
                None,
            )
            .await;
        }
        Ok(())
    }

    /// Current session handle, only while READY. Callers never mutate
    /// session state through this.
    pub async fn current_session(&self) -> Option<Arc<dyn ChannelSession>> {
        let inner = self.inner.read().await;
        if inner.phase == SessionPhase::Ready {
            inner.session.clone()
        } else {
            None
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.phase == SessionPhase::Ready
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.read().await;
        SessionStatus {
            phase: inner.phase,
            pairing_token: inner.pairing_token.clone(),
            last_verified_at: inner.last_verified_at,
        }
    }

    /// Run one double-checked liveness probe.
    ///
    /// Returns true when the session verified. A failure while the phase is
    /// READY degrades the session (fail closed); in any other phase the
    /// failure is only reported to the caller.
    pub async fn check_liveness(&self) -> bool {
        let (session, phase) = {
            let inner = self.inner.read().await;
            (inner.session.clone(), inner.phase)
        };
        let Some(session) = session else {
            return false;
        };
        match self.verify_session(&session).await {
            Ok(_) => {
                self.inner.write().await.last_verified_at = Some(Utc::now());
                true
            }
            Err(e) => {
                if phase == SessionPhase::Ready {
                    warn!(error = %e, "Liveness probe disagrees with ready state");
                    self.set_phase(
                        SessionPhase::Degraded,
                        format!("Liveness probe failed: {e}"),
                        None,
                    )
                    .await;
                }
                false
            }
        }
    }

    /// Double-checked readiness: the transport's cached flag AND a
    /// successful capability probe within the probe window.
    async fn verify_session(&self, session: &Arc<dyn ChannelSession>) -> Result<String> {
        if !session.reports_ready() {
            return Err(CourierError::Session(
                "transport reports session not ready".to_string(),
            ));
        }
        match tokio::time::timeout(self.config.probe_timeout, session.whoami()).await {
            Ok(Ok(identity)) => Ok(identity),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CourierError::ProbeTimeout(self.config.probe_timeout)),
        }
    }

    /// Close and drop the current session, clearing cached pairing state.
    /// Teardown errors are logged and swallowed; teardown is always
    /// followed by a fresh attempt. Returns whether a session existed.
    async fn teardown_existing(&self) -> bool {
        let session = {
            let mut inner = self.inner.write().await;
            inner.pairing_token = None;
            inner.epoch += 1;
            inner.session.take()
        };
        match session {
            Some(session) => {
                if let Err(e) = session.close().await {
                    warn!(error = %e, "Session teardown failed (ignored)");
                }
                self.set_phase(
                    SessionPhase::Closed,
                    "Channel session closed".to_string(),
                    None,
                )
                .await;
                true
            }
            None => false,
        }
    }

    /// Consume transport events for one session generation
    async fn run_event_loop(
        self: Arc<Self>,
        epoch: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if self.inner.read().await.epoch != epoch {
                debug!("Event loop for replaced session exiting");
                return;
            }
            match event {
                TransportEvent::PairingCode(code) => {
                    self.set_phase(
                        SessionPhase::AwaitingPairing,
                        "Scan the pairing code to link the channel".to_string(),
                        Some(code),
                    )
                    .await;
                }
                TransportEvent::Connected => {
                    let session = self.inner.read().await.session.clone();
                    let Some(session) = session else { continue };
                    match self.verify_session(&session).await {
                        Ok(identity) => {
                            self.inner.write().await.last_verified_at = Some(Utc::now());
                            self.set_phase(
                                SessionPhase::Ready,
                                format!("Channel session ready as {identity}"),
                                None,
                            )
                            .await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Transport reported login but capability probe failed");
                        }
                    }
                }
                TransportEvent::Disconnected { reason } => {
                    let phase = self.inner.read().await.phase;
                    if phase == SessionPhase::Ready {
                        self.set_phase(
                            SessionPhase::Degraded,
                            format!("Channel connection lost: {reason}"),
                            None,
                        )
                        .await;
                    } else {
                        warn!(reason = %reason, phase = phase.as_str(), "Channel dropped before session was ready");
                    }
                }
            }
        }
        debug!("Transport event stream ended");
    }

    /// Apply a phase transition and publish it. Moves not in the transition
    /// table are rejected here, so observers never see a skipped or
    /// reversed phase. The pairing token is cleared on every transition
    /// away from AWAITING_PAIRING.
    async fn set_phase(&self, next: SessionPhase, message: String, pairing_token: Option<String>) {
        {
            let mut inner = self.inner.write().await;
            let current = inner.phase;
            if current == next {
                // Channels rotate pairing codes; republish those, drop the rest
                if next != SessionPhase::AwaitingPairing {
                    return;
                }
            } else if !current.can_transition_to(next) {
                warn!(
                    from = current.as_str(),
                    to = next.as_str(),
                    "Rejected phase transition"
                );
                return;
            }
            inner.phase = next;
            inner.pairing_token = if next == SessionPhase::AwaitingPairing {
                pairing_token.clone()
            } else {
                None
            };
        }
        info!(phase = next.as_str(), "{message}");
        self.bus.publish(BusEvent::SessionPhaseChanged {
            phase: next,
            message,
            pairing_token,
        });
    }
}
