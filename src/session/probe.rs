//! Background liveness probe
//!
//! Re-verifies the session on a fixed interval through the manager's
//! double-checked probe. The probe itself is time-bounded by the manager's
//! probe window, so a hung transport call counts as a failure instead of
//! wedging the loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::SessionManager;

/// Default probe interval
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Periodic liveness probe for the channel session
pub struct LivenessProbe {
    manager: Arc<SessionManager>,
    interval: Duration,
    /// Whether the probe loop is running
    running: Arc<RwLock<bool>>,
}

impl LivenessProbe {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            interval: PROBE_INTERVAL,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Set a custom probe interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the probe loop
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Liveness probe already running");
                return;
            }
            *running = true;
        }

        info!(interval = ?self.interval, "Starting session liveness probe");

        let probe = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe.interval);
            // The first tick fires immediately; skip it so a freshly
            // started session gets a full interval before its first probe
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if !*probe.running.read().await {
                    info!("Liveness probe stopped");
                    break;
                }

                if probe.manager.is_ready().await {
                    let alive = probe.manager.check_liveness().await;
                    debug!(alive, "Liveness probe tick");
                }
            }
        });
    }

    /// Stop the probe loop
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Stopping session liveness probe");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NotificationBus;
    use crate::session::{SessionConfig, SessionPhase};
    use crate::transport::mock::MockTransport;
    use crate::transport::{ConnectOptions, TransportEvent};

    fn test_manager(transport: Arc<MockTransport>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            transport,
            NotificationBus::new(),
            SessionConfig {
                connect_options: ConnectOptions::default(),
                teardown_grace: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(200),
            },
        ))
    }

    #[tokio::test]
    async fn test_start_stop() {
        let transport = Arc::new(MockTransport::new());
        let probe = Arc::new(LivenessProbe::new(test_manager(transport)));

        assert!(!probe.is_running().await);
        Arc::clone(&probe).start().await;
        assert!(probe.is_running().await);

        // Double start is a no-op
        Arc::clone(&probe).start().await;
        assert!(probe.is_running().await);

        probe.stop().await;
        assert!(!probe.is_running().await);
    }

    #[tokio::test]
    async fn test_probe_degrades_dead_session() {
        let transport = Arc::new(MockTransport::new());
        transport.emit_on_connect(vec![TransportEvent::Connected]);
        let manager = test_manager(Arc::clone(&transport));

        manager.start(false).await.unwrap();
        // Wait until the event loop promoted the session
        for _ in 0..50 {
            if manager.is_ready().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.is_ready().await);

        transport.last_session().fail_whoami(true);

        let probe =
            Arc::new(LivenessProbe::new(Arc::clone(&manager)).with_interval(Duration::from_millis(20)));
        Arc::clone(&probe).start().await;

        for _ in 0..100 {
            if manager.status().await.phase == SessionPhase::Degraded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.status().await.phase, SessionPhase::Degraded);
        probe.stop().await;
    }
}
