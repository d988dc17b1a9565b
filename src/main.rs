//! Courier - outbound quote delivery core

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier::{
    bus::NotificationBus,
    config::Args,
    contacts::ContactResolver,
    ledger::{DispatchLedger, QuoteStore},
    server::{self, AppState},
    session::{LivenessProbe, SessionManager},
    transport::BridgeTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("courier={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Courier - quote delivery core");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Bridge: {}", args.bridge_url);
    info!("Ledger: {}", args.db_path.display());
    info!("Probe interval: {}s", args.probe_interval_secs);
    info!("======================================");

    // Open the quote ledger
    let store = match QuoteStore::open(&args.db_path).await {
        Ok(store) => {
            info!("Quote ledger opened");
            store
        }
        Err(e) => {
            error!("Failed to open quote ledger: {}", e);
            std::process::exit(1);
        }
    };

    // Recover quotes left mid-send by a previous process life
    match store
        .sweep_stale_sending(chrono::Duration::seconds(args.stale_sending_secs as i64))
        .await
    {
        Ok(0) => {}
        Ok(swept) => warn!("Swept {} stale sending quotes to send_failed", swept),
        Err(e) => warn!("Stale sending sweep failed: {}", e),
    }

    let bus = NotificationBus::new();
    let transport = Arc::new(BridgeTransport::new(args.bridge_config()));
    let session = Arc::new(SessionManager::new(
        transport,
        bus.clone(),
        args.session_config(),
    ));

    // Open the channel session. A connect failure is non-fatal: the UI can
    // retry through POST /session/start at any time.
    if args.autostart_session {
        match session.start(false).await {
            Ok(outcome) => info!("Session start: {}", outcome.as_str()),
            Err(e) => warn!("Session start failed (retry via API): {}", e),
        }
    }

    // Background liveness probe
    let probe = Arc::new(
        LivenessProbe::new(Arc::clone(&session)).with_interval(args.probe_interval()),
    );
    Arc::clone(&probe).start().await;

    let resolver = Arc::new(ContactResolver::new(Arc::clone(&session)));
    let ledger = Arc::new(DispatchLedger::new(
        store.clone(),
        Arc::clone(&session),
        bus.clone(),
    ));

    let state = Arc::new(AppState::new(
        args, session, resolver, ledger, store, bus,
    ));

    server::run(state).await?;
    Ok(())
}
