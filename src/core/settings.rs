//! Control-plane settings and on-disk layout

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name, also used for default directories
pub const APP_NAME: &str = "DeckyClash";

/// Upper bound for the network timeouts and the release cache, in seconds
pub const MAX_WAIT_SECS: f64 = 86_400.0;

/// Keys the UI is allowed to change through `set_config_value`
pub const MUTABLE_KEYS: &[&str] = &[
    "override_dns",
    "enhanced_mode",
    "allow_remote_access",
    "autostart",
    "dashboard",
    "external_run_bg",
    "skip_steam_download",
];

/// DNS strategy, selects which `*-dns` block of the override template is merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EnhancedMode {
    #[default]
    FakeIp,
    RedirHost,
}

impl EnhancedMode {
    /// Value used by the core and by the override template key prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FakeIp => "fake-ip",
            Self::RedirHost => "redir-host",
        }
    }

    pub fn all() -> &'static [EnhancedMode] {
        &[EnhancedMode::FakeIp, EnhancedMode::RedirHost]
    }
}

/// Persisted control-plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Core
    /// Bearer secret for the core's external controller
    pub secret: String,
    /// Start the core when the control plane starts
    pub autostart: bool,
    /// Seconds to wait for the core to exit after SIGTERM before giving up
    pub stop_timeout_secs: u64,

    // Composition
    /// Replace the subscription's DNS block with the template's
    pub override_dns: bool,
    /// DNS strategy
    pub enhanced_mode: EnhancedMode,
    /// External controller port
    pub controller_port: u16,
    /// Bind the controller on all interfaces instead of loopback
    pub allow_remote_access: bool,
    /// Selected dashboard name
    pub dashboard: Option<String>,
    /// Prepend the template's Steam download bypass rules
    pub skip_steam_download: bool,

    // Network
    /// Timeout for API and subscription requests, in seconds
    pub timeout_secs: f64,
    /// Timeout for large artifact downloads, in seconds
    pub download_timeout_secs: f64,
    /// How long latest-version answers are cached, in seconds
    pub debounce_secs: f64,
    /// Skip TLS certificate verification
    pub disable_verify: bool,

    // External server
    /// Port of the external callback server
    pub external_port: u16,
    /// Start the external server with the control plane
    pub external_run_bg: bool,

    // Advanced
    /// Log level for the control plane itself
    pub log_level: String,
    /// Command that makes the host loader reload the package after an upgrade
    pub loader_restart_command: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Core
            secret: random_token(),
            autostart: false,
            stop_timeout_secs: 5,

            // Composition
            override_dns: true,
            enhanced_mode: EnhancedMode::FakeIp,
            controller_port: 9090,
            allow_remote_access: false,
            dashboard: None,
            skip_steam_download: false,

            // Network
            timeout_secs: 15.0,
            download_timeout_secs: 120.0,
            debounce_secs: 10.0,
            disable_verify: false,

            // External server
            external_port: 50581,
            external_run_bg: false,

            // Advanced
            log_level: "info".to_string(),
            loader_restart_command: vec![
                "pkill".to_string(),
                "-HUP".to_string(),
                "PluginLoader".to_string(),
            ],
        }
    }
}

impl Settings {
    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        if self.secret.is_empty() {
            self.secret = random_token();
        }
        if self.controller_port == 0 {
            self.controller_port = 9090;
        }
        if self.external_port == 0 {
            self.external_port = 50581;
        }
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            self.timeout_secs = 15.0;
        }
        if !self.download_timeout_secs.is_finite() || self.download_timeout_secs <= 0.0 {
            self.download_timeout_secs = 120.0;
        }
        if !self.debounce_secs.is_finite() || self.debounce_secs < 0.0 {
            self.debounce_secs = 10.0;
        }
        self.timeout_secs = self.timeout_secs.min(MAX_WAIT_SECS);
        self.download_timeout_secs = self.download_timeout_secs.min(MAX_WAIT_SECS);
        self.debounce_secs = self.debounce_secs.min(MAX_WAIT_SECS);
        self.stop_timeout_secs = self.stop_timeout_secs.clamp(1, 60);
        if !matches!(
            self.log_level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            self.log_level = "info".to_string();
        }
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        seconds(self.download_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        seconds(self.debounce_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Replace one allow-listed field, type-checked through serde.
    ///
    /// Returns an error message for unknown keys and mistyped values,
    /// leaving `self` untouched.
    pub fn set_value(&mut self, key: &str, value: serde_json::Value) -> Result<(), String> {
        if !MUTABLE_KEYS.contains(&key) {
            return Err(format!("not permitted key: {}", key));
        }
        let mut object = match serde_json::to_value(&*self) {
            Ok(serde_json::Value::Object(object)) => object,
            Ok(_) => return Err("settings are not an object".to_string()),
            Err(e) => return Err(e.to_string()),
        };
        object.insert(key.to_string(), value);
        let mut updated: Settings = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| format!("invalid value for {}: {}", key, e))?;
        updated.validate();
        *self = updated;
        Ok(())
    }

    /// Read one field as JSON
    pub fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut object)) => object.remove(key),
            _ => None,
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_WAIT_SECS)).unwrap_or(Duration::ZERO)
}

/// Short random URL-safe token, used for secrets and fallback names
pub fn random_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..11].to_string()
}

/// Directory layout shared by every component
#[derive(Debug, Clone)]
pub struct Paths {
    /// Installation directory (replaced wholesale by a package upgrade)
    pub plugin_dir: PathBuf,
    /// Working directory for the core, dashboards and downloads
    pub runtime_dir: PathBuf,
    /// Database and subscription files
    pub settings_dir: PathBuf,
    /// Log files
    pub log_dir: PathBuf,
}

impl Paths {
    /// Resolve directories from the host loader's environment
    pub fn from_env() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_NAME);
        let resolve = |var: &str, fallback: &str| {
            std::env::var_os(var)
                .map(PathBuf::from)
                .unwrap_or_else(|| base.join(fallback))
        };
        Self {
            plugin_dir: resolve("DECKY_PLUGIN_DIR", "plugin"),
            runtime_dir: resolve("DECKY_PLUGIN_RUNTIME_DIR", "runtime"),
            settings_dir: resolve("DECKY_PLUGIN_SETTINGS_DIR", "settings"),
            log_dir: resolve("DECKY_PLUGIN_LOG_DIR", "logs"),
        }
    }

    /// Layout rooted in a single directory, used by tests and portable installs
    pub fn under(root: &Path) -> Self {
        Self {
            plugin_dir: root.join("plugin"),
            runtime_dir: root.join("runtime"),
            settings_dir: root.join("settings"),
            log_dir: root.join("logs"),
        }
    }

    /// Create every directory the control plane writes into
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.bin_dir())?;
        std::fs::create_dir_all(&self.runtime_dir)?;
        std::fs::create_dir_all(self.subscriptions_dir())?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.plugin_dir.join("bin")
    }

    pub fn core_path(&self) -> PathBuf {
        self.bin_dir().join("core")
    }

    pub fn tool_path(&self) -> PathBuf {
        self.bin_dir().join("yq")
    }

    pub fn override_path(&self) -> PathBuf {
        self.plugin_dir.join("override.yaml")
    }

    pub fn runtime_config_path(&self) -> PathBuf {
        self.runtime_dir.join("config.yaml")
    }

    pub fn dashboard_dir(&self) -> PathBuf {
        self.runtime_dir.join("dashboard")
    }

    pub fn external_dir(&self) -> PathBuf {
        self.runtime_dir.join("external")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.runtime_dir.join("bin-backup")
    }

    pub fn subscriptions_dir(&self) -> PathBuf {
        self.settings_dir.join("subscriptions")
    }

    pub fn database_path(&self) -> PathBuf {
        self.settings_dir.join("deckyclash.db")
    }

    pub fn core_log_path(&self) -> PathBuf {
        self.log_dir.join("core.log")
    }
}
