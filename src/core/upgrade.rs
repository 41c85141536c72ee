//! Self-upgrade of the package, the core binary and the yq helper from GitHub releases

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::download::{Destination, DownloadEngine, DownloadOutput};
use super::events::{Artifact, Event, EventBus};
use super::install::{self, run_blocking};
use super::process::{extract_version, CoreSupervisor};
use super::settings::{Paths, Settings};
use crate::error::{Error, Result};
use crate::platform::{self, Owner};

pub const GITHUB_API: &str = "https://api.github.com";
pub const PACKAGE_REPO: &str = "chenx-dust/DeckyClash";
pub const CORE_REPO: &str = "MetaCubeX/mihomo";
pub const TOOL_REPO: &str = "mikefarah/yq";

/// `releases/latest` payload, reduced to what the upgrade needs
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

impl Release {
    /// Tag without a leading `v`
    pub fn version(&self) -> &str {
        self.tag_name.strip_prefix('v').unwrap_or(&self.tag_name)
    }

    pub fn find_asset(&self, pattern: &AssetPattern) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|asset| pattern.matches(&asset.name))
    }
}

/// Asset name matcher: an exact name, or a single `*` wildcard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPattern(String);

impl AssetPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn matches(&self, name: &str) -> bool {
        match self.0.split_once('*') {
            Some((prefix, suffix)) => {
                name.len() >= prefix.len() + suffix.len()
                    && name.starts_with(prefix)
                    && name.ends_with(suffix)
            }
            None => name == self.0,
        }
    }
}

impl std::fmt::Display for AssetPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Architecture label used in release asset names
fn release_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Asset to fetch for each artifact on this platform
pub fn asset_pattern(artifact: Artifact) -> AssetPattern {
    match artifact {
        Artifact::Package => AssetPattern::new("*.zip"),
        Artifact::Core => AssetPattern::new(format!("mihomo-linux-{}-*.gz", release_arch())),
        Artifact::Tool => AssetPattern::new(format!("yq_linux_{}", release_arch())),
    }
}

/// Where releases come from and how installs are finalized
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    pub api_base: String,
    pub package_repo: String,
    pub core_repo: String,
    pub tool_repo: String,
    /// How long a latest-version answer is reused
    pub debounce: Duration,
    /// Run after a package upgrade; empty to skip
    pub loader_restart_command: Vec<String>,
    pub owner: Owner,
}

impl UpgradeConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_base: GITHUB_API.to_string(),
            package_repo: PACKAGE_REPO.to_string(),
            core_repo: CORE_REPO.to_string(),
            tool_repo: TOOL_REPO.to_string(),
            debounce: settings.debounce(),
            loader_restart_command: settings.loader_restart_command.clone(),
            owner: Owner::resolve(),
        }
    }

    pub fn repo(&self, artifact: Artifact) -> &str {
        match artifact {
            Artifact::Package => &self.package_repo,
            Artifact::Core => &self.core_repo,
            Artifact::Tool => &self.tool_repo,
        }
    }

    pub fn release_url(&self, artifact: Artifact) -> String {
        format!(
            "{}/repos/{}/releases/latest",
            self.api_base.trim_end_matches('/'),
            self.repo(artifact)
        )
    }
}

/// Fetches releases and installs them
pub struct UpgradeCoordinator {
    paths: Paths,
    config: UpgradeConfig,
    supervisor: Arc<CoreSupervisor>,
    /// Release metadata fetches, one engine per artifact
    metadata: HashMap<Artifact, DownloadEngine>,
    /// Asset downloads, one engine per artifact
    assets: HashMap<Artifact, DownloadEngine>,
    versions: Mutex<HashMap<Artifact, (Instant, String)>>,
}

impl UpgradeCoordinator {
    pub fn new(
        paths: Paths,
        config: UpgradeConfig,
        api_client: Client,
        download_client: Client,
        supervisor: Arc<CoreSupervisor>,
        events: EventBus,
    ) -> Self {
        let mut metadata = HashMap::new();
        let mut assets = HashMap::new();
        for &artifact in Artifact::all() {
            metadata.insert(artifact, DownloadEngine::new(api_client.clone()));

            let engine = DownloadEngine::new(download_client.clone());
            let bus = events.clone();
            engine.set_progress_hook(Arc::new(move |percent| {
                bus.emit(Event::DownloadProgress { artifact, percent });
            }));
            assets.insert(artifact, engine);
        }

        Self {
            paths,
            config,
            supervisor,
            metadata,
            assets,
            versions: Mutex::new(HashMap::new()),
        }
    }

    /// Installed version, empty when unknown
    pub async fn current_version(&self, artifact: Artifact) -> String {
        match artifact {
            Artifact::Package => env!("CARGO_PKG_VERSION").to_string(),
            Artifact::Core => self.supervisor.binary().version().await,
            Artifact::Tool => tool_version(&self.paths.tool_path()).await,
        }
    }

    /// Latest published release
    pub async fn latest_release(&self, artifact: Artifact) -> Result<Release> {
        let url = self.config.release_url(artifact);
        let output = self.engine(&self.metadata, artifact)?
            .download(&url, Destination::Json)
            .await?;
        let DownloadOutput::Json(value) = output else {
            return Err(Error::Release(format!("{} returned no JSON", url)));
        };
        serde_json::from_value(value).map_err(|e| Error::Release(format!("{}: {}", url, e)))
    }

    /// Latest published version, cached for the debounce interval
    pub async fn latest_version(&self, artifact: Artifact) -> Result<String> {
        if let Some(version) = self.cached_version(artifact) {
            debug!("Using cached latest {} version", artifact.label());
            return Ok(version);
        }

        let version = self.latest_release(artifact).await?.version().to_string();
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(artifact, (Instant::now(), version.clone()));
        Ok(version)
    }

    fn cached_version(&self, artifact: Artifact) -> Option<String> {
        let versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        versions
            .get(&artifact)
            .filter(|(fetched, _)| fetched.elapsed() < self.config.debounce)
            .map(|(_, version)| version.clone())
    }

    /// Progress of the artifact's asset download
    pub fn progress(&self, artifact: Artifact) -> Option<u8> {
        self.assets.get(&artifact).and_then(DownloadEngine::progress)
    }

    pub fn cancel(&self, artifact: Artifact) {
        if let Some(engine) = self.assets.get(&artifact) {
            engine.cancel();
        }
    }

    pub async fn upgrade(&self, artifact: Artifact) -> Result<()> {
        info!("Upgrading {}", artifact.label());
        match artifact {
            Artifact::Package => self.upgrade_package().await,
            Artifact::Core => self.upgrade_core().await,
            Artifact::Tool => self.upgrade_tool().await,
        }
    }

    /// Replace the core binary; a failed download leaves binary and process alone
    async fn upgrade_core(&self) -> Result<()> {
        let archive = self.download_asset(Artifact::Core).await?;

        if self.supervisor.is_running() {
            info!("Stopping core for upgrade");
            match self.supervisor.stop().await {
                Ok(()) | Err(Error::NotRunning) => {}
                Err(e) => return Err(e),
            }
        }

        let target = self.paths.core_path();
        let owner = self.config.owner;
        run_blocking(move || install::install_gzip(&archive, &target, owner)).await?;
        info!("Core upgraded");
        Ok(())
    }

    async fn upgrade_tool(&self) -> Result<()> {
        let downloaded = self.download_asset(Artifact::Tool).await?;
        let target = self.paths.tool_path();
        let owner = self.config.owner;
        run_blocking(move || {
            install::move_file(&downloaded, &target)?;
            install::finalize_artifact(&target, owner)
        })
        .await?;
        info!("yq upgraded");
        Ok(())
    }

    async fn upgrade_package(&self) -> Result<()> {
        let archive = self.download_asset(Artifact::Package).await?;
        let plugin_dir = self.paths.plugin_dir.clone();
        let backup_dir = self.paths.backup_dir();
        let owner = self.config.owner;
        run_blocking(move || install_package(&archive, &plugin_dir, &backup_dir, owner)).await?;
        info!("Package upgraded");

        if !self.config.loader_restart_command.is_empty() {
            if let Err(e) = platform::spawn_detached(&self.config.loader_restart_command) {
                warn!("Failed to restart the plugin loader: {:#}", e);
            }
        }
        Ok(())
    }

    /// Download the artifact's release asset into the runtime directory
    async fn download_asset(&self, artifact: Artifact) -> Result<PathBuf> {
        let release = self.latest_release(artifact).await?;
        let pattern = asset_pattern(artifact);
        let asset = release.find_asset(&pattern).ok_or_else(|| {
            Error::Release(format!(
                "release {} has no asset matching {}",
                release.tag_name, pattern
            ))
        })?;

        let file_name = Path::new(&asset.name)
            .file_name()
            .ok_or_else(|| Error::Release(format!("bad asset name {:?}", asset.name)))?;
        let dest = self.paths.runtime_dir.join(file_name);
        info!(
            "Fetching {} {} from {}",
            artifact.label(),
            release.tag_name,
            asset.browser_download_url
        );

        self.engine(&self.assets, artifact)?
            .download(&asset.browser_download_url, Destination::File(dest.clone()))
            .await?;
        Ok(dest)
    }

    fn engine<'a>(
        &self,
        engines: &'a HashMap<Artifact, DownloadEngine>,
        artifact: Artifact,
    ) -> Result<&'a DownloadEngine> {
        engines
            .get(&artifact)
            .ok_or_else(|| Error::Process(format!("no downloader for {}", artifact.label())))
    }
}

async fn tool_version(path: &Path) -> String {
    match Command::new(path).arg("--version").output().await {
        Ok(output) => {
            extract_version(&String::from_utf8_lossy(&output.stdout)).unwrap_or_default()
        }
        Err(e) => {
            debug!("Failed to query yq version: {}", e);
            String::new()
        }
    }
}

/// Swap the installation directory for the archive's content.
///
/// `bin/` is backed up first and copied back over the new tree. The backup is
/// only deleted after that restore succeeds.
pub fn install_package(
    archive: &Path,
    plugin_dir: &Path,
    backup_dir: &Path,
    owner: Owner,
) -> Result<()> {
    let bin_dir = plugin_dir.join("bin");

    if bin_dir.is_dir() {
        if backup_dir.exists() {
            std::fs::remove_dir_all(backup_dir)
                .map_err(|e| Error::fs("failed to clear stale binary backup", e))?;
        }
        install::copy_tree(&bin_dir, backup_dir)
            .map_err(|e| Error::fs("failed to back up binaries", e))?;
        debug!("Binaries backed up to {:?}", backup_dir);
    } else if backup_dir.exists() {
        warn!("Reusing binary backup left by an earlier upgrade");
    }

    let parent = plugin_dir
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent", plugin_dir.display())))?;
    let dir_name = plugin_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Config(format!("{} has no name", plugin_dir.display())))?;

    // Unpack beside the installation so a bad archive never touches it
    let staging = parent.join(format!(".{}.staging", dir_name));
    if staging.exists() {
        std::fs::remove_dir_all(&staging)
            .map_err(|e| Error::fs("failed to clear staging directory", e))?;
    }
    std::fs::create_dir_all(&staging)
        .map_err(|e| Error::fs("failed to create staging directory", e))?;
    if let Err(e) = install::unzip(archive, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }
    let root = install::extracted_root(&staging, &dir_name)
        .map_err(|e| Error::fs("failed to inspect extracted package", e))?;

    if plugin_dir.exists() {
        platform::make_tree_writable(plugin_dir)
            .map_err(|e| Error::fs("failed to unlock installation", e))?;
        std::fs::remove_dir_all(plugin_dir)
            .map_err(|e| Error::fs("failed to remove old installation", e))?;
    }
    std::fs::rename(&root, plugin_dir)
        .map_err(|e| Error::fs("failed to move new installation into place", e))?;
    if staging.exists() {
        let _ = std::fs::remove_dir_all(&staging);
    }

    if backup_dir.is_dir() {
        install::copy_tree(backup_dir, &bin_dir)
            .map_err(|e| Error::fs("failed to restore binaries", e))?;
    }
    if bin_dir.is_dir() {
        let binaries = install::files_in(&bin_dir)
            .map_err(|e| Error::fs("failed to list binaries", e))?;
        for binary in binaries {
            install::finalize_artifact(&binary, owner)?;
        }
    }
    platform::set_tree_owner(plugin_dir, owner)
        .map_err(|e| Error::fs("failed to set installation owner", e))?;

    if backup_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(backup_dir) {
            warn!("Failed to remove binary backup: {}", e);
        }
    }
    if let Err(e) = std::fs::remove_file(archive) {
        warn!("Failed to remove {:?}: {}", archive, e);
    }
    Ok(())
}
