//! Application state - the capability surface the UI bridge calls into

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{error, info, warn};

use super::bundle;
use super::compose::{self, ComposeOptions};
use super::dashboard;
use super::download::http_client;
use super::events::{Artifact, Event, EventBus};
use super::install::run_blocking;
use super::process::{CoreBinary, CoreSupervisor};
use super::settings::{EnhancedMode, Paths, Settings, APP_NAME};
use super::subscription::{self, SubscriptionStore};
use super::upgrade::{UpgradeConfig, UpgradeCoordinator};
use crate::error::Error;
use crate::external::ExternalServer;
use crate::persistence::Database;
use crate::platform::{self, Owner};

/// Result of a capability call, as reported to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub error: Option<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }

    /// Log a failure under `action` and flatten it to a message
    fn from_result<T>(action: &str, result: crate::error::Result<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => {
                error!("Failed to {}: {}", action, e);
                Self::failed(e.to_string())
            }
        }
    }
}

/// Snapshot returned by `get_config`
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub status: bool,
    pub current: Option<String>,
    pub secret: String,
    pub override_dns: bool,
    pub enhanced_mode: EnhancedMode,
    pub controller_port: u16,
    pub allow_remote_access: bool,
    pub dashboard: Option<String>,
    pub skip_steam_download: bool,
    pub autostart: bool,
    pub external_run_bg: bool,
    pub external_port: u16,
}

/// Central application state
pub struct AppState {
    pub paths: Arc<Paths>,
    /// Application settings
    pub settings: Arc<RwLock<Settings>>,
    /// Database connection
    pub database: Arc<Database>,
    pub events: EventBus,
    pub supervisor: Arc<CoreSupervisor>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub upgrades: Arc<UpgradeCoordinator>,
    api_client: Client,
    external: Arc<tokio::sync::Mutex<Option<ExternalServer>>>,
}

impl AppState {
    /// Create the application state with releases fetched from GitHub
    pub fn new(paths: Paths, database: Database) -> Result<Self> {
        Self::build(paths, database, None)
    }

    /// Create the application state with an explicit release source
    pub fn with_upgrade_config(
        paths: Paths,
        database: Database,
        upgrade_config: UpgradeConfig,
    ) -> Result<Self> {
        Self::build(paths, database, Some(upgrade_config))
    }

    fn build(
        paths: Paths,
        database: Database,
        upgrade_config: Option<UpgradeConfig>,
    ) -> Result<Self> {
        paths
            .ensure()
            .context("Failed to create application directories")?;

        // Load settings from database, persisting the generated secret on first run
        let settings = database.load_settings()?.unwrap_or_default();
        database.save_settings(&settings)?;

        let app_agent = format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION"));
        let subscription_client = http_client(
            subscription::USER_AGENT,
            settings.timeout(),
            settings.disable_verify,
        )
        .context("Failed to build subscription HTTP client")?;
        let api_client = http_client(&app_agent, settings.timeout(), settings.disable_verify)
            .context("Failed to build API HTTP client")?;
        let download_client = http_client(
            &app_agent,
            settings.download_timeout(),
            settings.disable_verify,
        )
        .context("Failed to build download HTTP client")?;

        let events = EventBus::new();
        let binary = CoreBinary::new(paths.core_path(), paths.runtime_dir.clone());
        let supervisor = Arc::new(CoreSupervisor::new(
            binary.clone(),
            paths.runtime_config_path(),
            paths.core_log_path(),
            settings.stop_timeout(),
        ));
        let bus = events.clone();
        supervisor.set_exit_hook(Arc::new(move |code| {
            bus.emit(Event::CoreExit { code });
        }));

        let database = Arc::new(database);
        let subscriptions = Arc::new(
            SubscriptionStore::load(
                paths.subscriptions_dir(),
                Arc::clone(&database),
                subscription_client,
                binary,
            )
            .context("Failed to load subscriptions")?,
        );

        let upgrade_config =
            upgrade_config.unwrap_or_else(|| UpgradeConfig::from_settings(&settings));
        let upgrades = Arc::new(UpgradeCoordinator::new(
            paths.clone(),
            upgrade_config,
            api_client.clone(),
            download_client,
            Arc::clone(&supervisor),
            events.clone(),
        ));

        Ok(Self {
            paths: Arc::new(paths),
            settings: Arc::new(RwLock::new(settings)),
            database,
            events,
            supervisor,
            subscriptions,
            upgrades,
            api_client,
            external: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    /// Startup work: bundled artifacts, autostart, external server
    pub async fn initialize(&self) {
        let paths = Arc::clone(&self.paths);
        let owner = Owner::resolve();
        let installed = run_blocking(move || bundle::install_bundled(&paths, owner)).await;
        if let Err(e) = installed {
            error!("Failed to install bundled artifacts: {}", e);
        }

        let settings = self.settings_snapshot();
        if settings.autostart {
            info!("Autostarting core");
            self.set_core_status(true).await;
        }
        if settings.external_run_bg {
            self.set_external_status(true).await;
        }
    }

    /// Stop everything this process started
    pub async fn shutdown(&self) {
        if self.supervisor.is_running() {
            if let Err(e) = self.supervisor.stop().await {
                warn!("Failed to stop core: {}", e);
            }
        }
        if let Some(server) = self.external.lock().await.take() {
            server.stop().await;
        }
        info!("Shutdown complete");
    }

    pub fn settings_snapshot(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // === Core ===

    pub fn get_core_status(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Start (compose then spawn) or stop the core
    pub async fn set_core_status(&self, enable: bool) -> Outcome {
        if enable {
            Outcome::from_result("start core", self.start_core().await)
        } else {
            Outcome::from_result("stop core", self.supervisor.stop().await)
        }
    }

    async fn start_core(&self) -> crate::error::Result<()> {
        self.compose_runtime_config().await?;
        self.supervisor.start().await
    }

    /// Write the runtime config from the selected subscription
    async fn compose_runtime_config(&self) -> crate::error::Result<()> {
        let base = self
            .subscriptions
            .current_path()
            .ok_or_else(|| Error::Config("no subscription selected".to_string()))?;
        let options = ComposeOptions::from_settings(&self.settings_snapshot(), self.paths.dashboard_dir());
        let override_path = self.paths.override_path();
        let output = self.paths.runtime_config_path();
        run_blocking(move || compose::compose_to_file(&base, &override_path, &output, &options)).await
    }

    /// Recompose and ask the running core to reload in place
    pub async fn restart_core(&self) -> bool {
        if let Err(e) = self.compose_runtime_config().await {
            error!("Failed to compose config for restart: {}", e);
            return false;
        }

        let settings = self.settings_snapshot();
        let url = format!("http://127.0.0.1:{}/restart", settings.controller_port);
        let response = self
            .api_client
            .post(&url)
            .bearer_auth(&settings.secret)
            .json(&serde_json::json!({ "payload": "" }))
            .send()
            .await;
        match response {
            Ok(response) if response.status() == StatusCode::OK => {
                info!("Core restarted");
                true
            }
            Ok(response) => {
                warn!("Core restart answered {}", response.status());
                false
            }
            Err(e) => {
                error!("Failed to reach core controller: {}", e);
                false
            }
        }
    }

    // === Settings ===

    pub fn get_config(&self) -> ConfigView {
        let settings = self.settings_snapshot();
        ConfigView {
            status: self.get_core_status(),
            current: self.subscriptions.current(),
            secret: settings.secret,
            override_dns: settings.override_dns,
            enhanced_mode: settings.enhanced_mode,
            controller_port: settings.controller_port,
            allow_remote_access: settings.allow_remote_access,
            dashboard: settings.dashboard,
            skip_steam_download: settings.skip_steam_download,
            autostart: settings.autostart,
            external_run_bg: settings.external_run_bg,
            external_port: settings.external_port,
        }
    }

    pub fn get_config_value(&self, key: &str) -> Option<serde_json::Value> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get_value(key)
    }

    /// Change one allow-listed setting and persist it
    pub fn set_config_value(&self, key: &str, value: serde_json::Value) -> Outcome {
        let updated = {
            let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            if let Err(message) = settings.set_value(key, value) {
                warn!("Rejected config change: {}", message);
                return Outcome::failed(message);
            }
            settings.clone()
        };

        match self.database.save_settings(&updated) {
            Ok(()) => {
                info!("Config {} updated", key);
                Outcome::ok()
            }
            Err(e) => {
                error!("Failed to save settings: {:#}", e);
                Outcome::failed(e.to_string())
            }
        }
    }

    // === Versions and upgrades ===

    pub async fn get_version(&self, artifact: Artifact) -> String {
        self.upgrades.current_version(artifact).await
    }

    /// Latest published version, empty on failure
    pub async fn get_latest_version(&self, artifact: Artifact) -> String {
        match self.upgrades.latest_version(artifact).await {
            Ok(version) => version,
            Err(e) => {
                warn!("Failed to get latest {} version: {}", artifact.label(), e);
                String::new()
            }
        }
    }

    pub async fn upgrade(&self, artifact: Artifact) -> Outcome {
        let action = format!("upgrade {}", artifact.label());
        Outcome::from_result(&action, self.upgrades.upgrade(artifact).await)
    }

    pub fn download_progress(&self, artifact: Artifact) -> Option<u8> {
        self.upgrades.progress(artifact)
    }

    pub fn cancel_download(&self, artifact: Artifact) {
        self.upgrades.cancel(artifact);
    }

    pub fn get_dashboard_list(&self) -> Vec<String> {
        dashboard::list_dashboards(&self.paths.dashboard_dir())
    }

    // === Subscriptions ===

    /// Subscriptions in presentation order, after dropping those whose file vanished
    pub fn get_subscription_list(&self) -> Vec<(String, String)> {
        if let Err(e) = self.subscriptions.check_all() {
            error!("Failed to check subscriptions: {}", e);
        }
        self.subscriptions.list()
    }

    pub async fn download_subscription(&self, url: &str) -> Outcome {
        match self.subscriptions.download(url).await {
            Ok(name) => {
                self.events.emit(Event::SubscriptionUpdated { name });
                Outcome::ok()
            }
            Err(e) => {
                error!("Failed to download subscription {}: {}", url, e);
                Outcome::failed(e.to_string())
            }
        }
    }

    pub async fn update_subscription(&self, name: &str) -> Outcome {
        Outcome::from_result("update subscription", self.subscriptions.update(name).await)
    }

    /// Update every subscription concurrently, returning `(name, error)` failures
    pub async fn update_all_subscriptions(&self) -> Vec<(String, String)> {
        let failures = self.subscriptions.update_all().await;
        for (name, e) in &failures {
            warn!("Failed to update subscription {}: {}", name, e);
        }
        failures
    }

    pub async fn duplicate_subscription(&self, name: &str) {
        let subscriptions = Arc::clone(&self.subscriptions);
        let source = name.to_string();
        let result = run_blocking(move || subscriptions.duplicate(&source)).await;
        if let Err(e) = result {
            error!("Failed to duplicate subscription {}: {}", name, e);
        }
    }

    pub fn edit_subscription(&self, name: &str, new_name: &str, new_url: &str) {
        if let Err(e) = self.subscriptions.rename(name, new_name, new_url) {
            error!("Failed to edit subscription {}: {}", name, e);
        }
    }

    pub fn remove_subscription(&self, name: &str) {
        if let Err(e) = self.subscriptions.remove(name) {
            error!("Failed to remove subscription {}: {}", name, e);
        }
    }

    pub fn reorder_subscriptions(&self, names: &[String]) {
        if let Err(e) = self.subscriptions.reorder(names) {
            error!("Failed to reorder subscriptions: {}", e);
        }
    }

    /// Select a subscription, restarting a running core on it
    pub async fn set_current(&self, name: &str) -> bool {
        if let Err(e) = self.subscriptions.set_current(name) {
            error!("Failed to select subscription {}: {}", name, e);
            return false;
        }
        if self.supervisor.is_running() {
            let outcome = self.set_core_status(true).await;
            return outcome.success;
        }
        true
    }

    // === Network ===

    pub fn get_ip(&self) -> String {
        platform::local_ip().to_string()
    }

    pub async fn get_external_status(&self) -> bool {
        self.external.lock().await.is_some()
    }

    /// Start or stop the external callback server
    pub async fn set_external_status(&self, enable: bool) -> Outcome {
        let mut external = self.external.lock().await;
        if !enable {
            if let Some(server) = external.take() {
                server.stop().await;
            }
            return Outcome::ok();
        }
        if external.is_some() {
            return Outcome::ok();
        }

        let port = self.settings_snapshot().external_port;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        match ExternalServer::start(addr, self.clone()).await {
            Ok(server) => {
                *external = Some(server);
                Outcome::ok()
            }
            Err(e) => {
                error!("Failed to start external server: {:#}", e);
                Outcome::failed(e.to_string())
            }
        }
    }
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            paths: Arc::clone(&self.paths),
            settings: Arc::clone(&self.settings),
            database: Arc::clone(&self.database),
            events: self.events.clone(),
            supervisor: Arc::clone(&self.supervisor),
            subscriptions: Arc::clone(&self.subscriptions),
            upgrades: Arc::clone(&self.upgrades),
            api_client: self.api_client.clone(),
            external: Arc::clone(&self.external),
        }
    }
}
