//! Configuration for Courier
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::session::SessionConfig;
use crate::transport::{BridgeConfig, ConnectOptions};

/// Courier - outbound quote delivery core
#[derive(Parser, Debug, Clone)]
#[command(name = "courier")]
#[command(about = "Chat-channel session, contact resolution and dispatch ledger for the quoting tool")]
pub struct Args {
    /// Unique node identifier for this instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on for the UI-facing API
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: SocketAddr,

    /// WebSocket URL of the channel bridge sidecar
    #[arg(long, env = "BRIDGE_URL", default_value = "ws://localhost:8055")]
    pub bridge_url: String,

    /// Device label shown on the paired channel account
    #[arg(long, env = "DEVICE_LABEL", default_value = "courier")]
    pub device_label: String,

    /// Path of the quote ledger database
    #[arg(long, env = "DB_PATH", default_value = "courier.db")]
    pub db_path: PathBuf,

    /// Open the channel session at startup (otherwise wait for an explicit
    /// start request)
    #[arg(long, env = "AUTOSTART_SESSION", default_value = "true")]
    pub autostart_session: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Per-request timeout against the bridge, in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Liveness probe interval in seconds
    #[arg(long, env = "PROBE_INTERVAL_SECS", default_value = "30")]
    pub probe_interval_secs: u64,

    /// Window for a single liveness probe in seconds; probes that neither
    /// confirm nor deny readiness in time count as failures
    #[arg(long, env = "PROBE_TIMEOUT_SECS", default_value = "10")]
    pub probe_timeout_secs: u64,

    /// Grace period between tearing down an old session and reopening, in
    /// milliseconds
    #[arg(long, env = "TEARDOWN_GRACE_MS", default_value = "2000")]
    pub teardown_grace_ms: u64,

    /// Age in seconds after which quotes stuck in `sending` are swept to
    /// `send_failed` at startup
    #[arg(long, env = "STALE_SENDING_SECS", default_value = "900")]
    pub stale_sending_secs: u64,
}

impl Args {
    /// Session manager tunables derived from the arguments
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_options: ConnectOptions {
                device_label: self.device_label.clone(),
                restore_state: true,
            },
            teardown_grace: Duration::from_millis(self.teardown_grace_ms),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }

    /// Bridge connection settings derived from the arguments
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig::new(&self.bridge_url)
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }
        if self.probe_timeout_secs >= self.probe_interval_secs {
            return Err(
                "PROBE_TIMEOUT_SECS must be shorter than PROBE_INTERVAL_SECS".to_string(),
            );
        }
        if !self.bridge_url.starts_with("ws://") && !self.bridge_url.starts_with("wss://") {
            return Err("BRIDGE_URL must be a ws:// or wss:// URL".to_string());
        }
        Ok(())
    }
}
