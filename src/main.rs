//! DeckyClash - control plane for a supervised mihomo proxy core
//!
//! Runs as the plugin backend: installs bundled artifacts, supervises the core
//! and serves the external callback endpoint until asked to stop.

use anyhow::{Context, Result};
use single_instance::SingleInstance;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use deckyclash::core::{AppState, Paths, APP_NAME};
use deckyclash::persistence::Database;

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let paths = Paths::from_env();

    // Initialize database
    let db = Database::open(&paths.database_path())?;
    db.initialize()?;
    let log_level = db
        .load_settings()?
        .map(|settings| settings.log_level)
        .unwrap_or_else(|| "info".to_string());

    // Initialize logging
    init_logging(&log_level);
    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Ensure only one control plane drives the core
    let instance = SingleInstance::new(APP_NAME).context("Failed to create single instance lock")?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        return Ok(());
    }

    // Create application state
    let app_state = AppState::new(paths, db)?;
    info!("Application state initialized");

    let mut events = app_state.events.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("Event: {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event log skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    app_state.initialize().await;

    wait_for_shutdown().await;
    info!("{} shutting down", APP_NAME);
    app_state.shutdown().await;
    Ok(())
}

/// Initialize the logging system
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("deckyclash={}", level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve on Ctrl-C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}
