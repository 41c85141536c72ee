//! Subscription store - ordered name to URL registry backed by one file per entry

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::join_all;
use indexmap::IndexMap;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::download::{Destination, DownloadEngine, DownloadOutput};
use super::process::CoreBinary;
use super::settings::random_token;
use crate::error::{Error, Result};
use crate::persistence::Database;

/// User agent sent to subscription hosts; some only serve full configs to known clients
pub const USER_AGENT: &str = concat!(
    "DeckyClash/",
    env!("CARGO_PKG_VERSION"),
    " mihomo/1.19.10 clash-verge/2.2.3 Clash/v1.18.0"
);

/// Suffixes `_0` through `_99` are tried before giving up
pub const MAX_DEDUP_ATTEMPTS: usize = 100;

const SUBSCRIPTIONS_KEY: &str = "subscriptions";
const CURRENT_KEY: &str = "current";

#[derive(Debug, Default)]
struct Registry {
    subscriptions: IndexMap<String, String>,
    current: Option<String>,
}

/// Subscription registry and the files it owns
pub struct SubscriptionStore {
    dir: PathBuf,
    db: Arc<Database>,
    client: Client,
    validator: CoreBinary,
    registry: RwLock<Registry>,
    /// One engine per subscription, so overlapping updates of a name share a transfer
    updaters: Mutex<HashMap<String, Arc<DownloadEngine>>>,
}

impl SubscriptionStore {
    /// Load the registry persisted in `db`
    pub fn load(dir: PathBuf, db: Arc<Database>, client: Client, validator: CoreBinary) -> Result<Self> {
        let subscriptions: IndexMap<String, String> =
            db.get(SUBSCRIPTIONS_KEY)?.unwrap_or_default();
        let mut current: Option<String> = db.get(CURRENT_KEY)?;
        if current
            .as_ref()
            .is_some_and(|name| !subscriptions.contains_key(name))
        {
            warn!("Selected subscription {:?} is not registered", current);
            current = None;
        }
        info!("Loaded {} subscriptions", subscriptions.len());

        Ok(Self {
            dir,
            db,
            client,
            validator,
            registry: RwLock::new(Registry {
                subscriptions,
                current,
            }),
            updaters: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing a subscription
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.yaml", name))
    }

    /// Registered `(name, url)` pairs in presentation order
    pub fn list(&self) -> Vec<(String, String)> {
        self.read()
            .subscriptions
            .iter()
            .map(|(name, url)| (name.clone(), url.clone()))
            .collect()
    }

    pub fn url_of(&self, name: &str) -> Option<String> {
        self.read().subscriptions.get(name).cloned()
    }

    pub fn current(&self) -> Option<String> {
        self.read().current.clone()
    }

    /// File of the selected subscription
    pub fn current_path(&self) -> Option<PathBuf> {
        self.current().map(|name| self.path_of(&name))
    }

    /// Select a registered subscription
    pub fn set_current(&self, name: &str) -> Result<()> {
        let mut registry = self.write();
        if !registry.subscriptions.contains_key(name) {
            return Err(Error::UnknownSubscription(name.to_string()));
        }
        registry.current = Some(name.to_string());
        self.persist(&registry)?;
        info!("Selected subscription {}", name);
        Ok(())
    }

    /// Fetch a new subscription, validate it with the core and register it
    pub async fn download(&self, url: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::fs(format!("failed to create {}", self.dir.display()), e))?;

        let staging = self.dir.join(format!(".download-{}", random_token()));
        let engine = DownloadEngine::new(self.client.clone());
        let output = engine
            .download(url, Destination::File(staging.clone()))
            .await?;
        let advertised = match output {
            DownloadOutput::File { filename, .. } => filename,
            DownloadOutput::Json(_) => None,
        };
        let stem = derive_name(advertised.as_deref(), url);

        // The existence check and the rename happen under one lock
        let placed = {
            let registry = self.write();
            dedupe(&stem, |candidate| {
                registry.subscriptions.contains_key(candidate) || self.path_of(candidate).exists()
            })
            .and_then(|name| {
                let path = self.path_of(&name);
                std::fs::rename(&staging, &path)
                    .map_err(|e| Error::fs(format!("failed to move {}", path.display()), e))?;
                Ok((name, path))
            })
        };
        let (name, path) = match placed {
            Ok(placed) => placed,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }
        };

        if !self.validator.check_config(&path).await {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove rejected subscription {:?}: {}", path, e);
            }
            return Err(Error::Validation(format!(
                "{} is not a valid config",
                url
            )));
        }

        let mut registry = self.write();
        registry.subscriptions.insert(name.clone(), url.to_string());
        if registry.current.is_none() {
            registry.current = Some(name.clone());
        }
        self.persist(&registry)?;
        info!("Added subscription {} from {}", name, url);
        Ok(name)
    }

    /// Re-fetch a subscription; the old file stays until the new body is complete
    pub async fn update(&self, name: &str) -> Result<()> {
        let url = self
            .url_of(name)
            .ok_or_else(|| Error::UnknownSubscription(name.to_string()))?;
        let engine = self.updater(name);
        engine
            .download(&url, Destination::File(self.path_of(name)))
            .await?;
        info!("Updated subscription {}", name);
        Ok(())
    }

    fn updater(&self, name: &str) -> Arc<DownloadEngine> {
        let mut updaters = self.updaters.lock().unwrap_or_else(PoisonError::into_inner);
        let engine = updaters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DownloadEngine::new(self.client.clone())));
        Arc::clone(engine)
    }

    fn forget_updater(&self, name: &str) {
        self.updaters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Update every subscription concurrently, returning the failures
    pub async fn update_all(&self) -> Vec<(String, String)> {
        let names: Vec<String> = self.read().subscriptions.keys().cloned().collect();
        let results = join_all(names.iter().map(|name| self.update(name))).await;

        names
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| result.err().map(|e| (name, e.to_string())))
            .collect()
    }

    /// Copy a subscription under a fresh name with the same URL
    pub fn duplicate(&self, name: &str) -> Result<String> {
        let url = self
            .url_of(name)
            .ok_or_else(|| Error::UnknownSubscription(name.to_string()))?;
        let source = self.path_of(name);

        let mut registry = self.write();
        let copy = dedupe(name, |candidate| {
            registry.subscriptions.contains_key(candidate) || self.path_of(candidate).exists()
        })?;
        let target = self.path_of(&copy);
        std::fs::copy(&source, &target)
            .map_err(|e| Error::fs(format!("failed to copy {}", source.display()), e))?;
        registry.subscriptions.insert(copy.clone(), url);
        self.persist(&registry)?;
        info!("Duplicated subscription {} as {}", name, copy);
        Ok(copy)
    }

    /// Rename a subscription and replace its URL
    pub fn rename(&self, name: &str, new_name: &str, new_url: &str) -> Result<()> {
        let new_name = sanitize(new_name);
        if new_name.is_empty() {
            return Err(Error::Config("subscription name is empty".to_string()));
        }

        let mut registry = self.write();
        let Some(index) = registry.subscriptions.get_index_of(name) else {
            return Err(Error::UnknownSubscription(name.to_string()));
        };

        if new_name == name {
            registry
                .subscriptions
                .insert(name.to_string(), new_url.to_string());
            self.persist(&registry)?;
            debug!("Updated URL of subscription {}", name);
            return Ok(());
        }
        if registry.subscriptions.contains_key(&new_name) {
            return Err(Error::NameConflict(new_name));
        }

        let from = self.path_of(name);
        let to = self.path_of(&new_name);
        std::fs::rename(&from, &to)
            .map_err(|e| Error::fs(format!("failed to move {}", from.display()), e))?;

        self.forget_updater(name);
        registry.subscriptions.shift_remove(name);
        let (last, _) = registry
            .subscriptions
            .insert_full(new_name.clone(), new_url.to_string());
        registry.subscriptions.move_index(last, index);
        if registry.current.as_deref() == Some(name) {
            registry.current = Some(new_name.clone());
        }
        self.persist(&registry)?;
        info!("Renamed subscription {} to {}", name, new_name);
        Ok(())
    }

    /// Unregister a subscription and delete its file
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut registry = self.write();
        if registry.subscriptions.shift_remove(name).is_none() {
            return Err(Error::UnknownSubscription(name.to_string()));
        }
        if registry.current.as_deref() == Some(name) {
            registry.current = None;
        }
        self.persist(&registry)?;
        drop(registry);
        self.forget_updater(name);

        let path = self.path_of(name);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Failed to delete {:?}: {}", path, e);
        }
        info!("Removed subscription {}", name);
        Ok(())
    }

    /// Apply a new presentation order; `names` must be a permutation of the keys
    pub fn reorder(&self, names: &[String]) -> Result<()> {
        let mut registry = self.write();
        let unique: HashSet<&String> = names.iter().collect();
        let is_permutation = names.len() == registry.subscriptions.len()
            && unique.len() == names.len()
            && names.iter().all(|n| registry.subscriptions.contains_key(n));
        if !is_permutation {
            return Err(Error::Config(
                "reorder list does not match the subscriptions".to_string(),
            ));
        }

        let reordered: IndexMap<String, String> = names
            .iter()
            .filter_map(|name| {
                registry
                    .subscriptions
                    .get(name)
                    .map(|url| (name.clone(), url.clone()))
            })
            .collect();
        registry.subscriptions = reordered;
        self.persist(&registry)?;
        debug!("Subscriptions reordered");
        Ok(())
    }

    /// Drop entries whose file disappeared, returning their names
    pub fn check_all(&self) -> Result<Vec<String>> {
        let mut registry = self.write();
        let missing: Vec<String> = registry
            .subscriptions
            .keys()
            .filter(|name| !self.path_of(name).exists())
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(missing);
        }

        for name in &missing {
            warn!("Subscription file for {} is missing, removing it", name);
            registry.subscriptions.shift_remove(name);
            if registry.current.as_deref() == Some(name.as_str()) {
                registry.current = None;
            }
        }
        self.persist(&registry)?;
        Ok(missing)
    }

    fn persist(&self, registry: &Registry) -> Result<()> {
        self.db.set(SUBSCRIPTIONS_KEY, &registry.subscriptions)?;
        match &registry.current {
            Some(name) => self.db.set(CURRENT_KEY, name)?,
            None => self.db.remove(CURRENT_KEY)?,
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replace path separators so a name maps to exactly one file
pub fn sanitize(name: &str) -> String {
    name.trim().replace(['/', '\\'], "-")
}

/// Subscription name from the advertised file name, the URL, or a random token
pub fn derive_name(advertised: Option<&str>, url: &str) -> String {
    let from_url = || {
        reqwest::Url::parse(url).ok().and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
    };

    let raw = advertised
        .map(str::to_string)
        .filter(|name| !name.trim().is_empty())
        .or_else(from_url)
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(random_token);

    let stem = sanitize(strip_yaml_suffix(&raw));
    if stem.is_empty() {
        random_token()
    } else {
        stem
    }
}

fn strip_yaml_suffix(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for suffix in [".yaml", ".yml"] {
        if lower.ends_with(suffix) {
            return &name[..name.len() - suffix.len()];
        }
    }
    name
}

/// `stem` if free, else the first free `stem_0` .. `stem_99`
pub fn dedupe(stem: &str, taken: impl Fn(&str) -> bool) -> Result<String> {
    if !taken(stem) {
        return Ok(stem.to_string());
    }
    (0..MAX_DEDUP_ATTEMPTS)
        .map(|i| format!("{}_{}", stem, i))
        .find(|candidate| !taken(candidate))
        .ok_or_else(|| Error::NameConflict(stem.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_name_prefers_advertised() {
        assert_eq!(
            derive_name(Some("Work.YAML"), "https://host/sub/other.yaml"),
            "Work"
        );
    }

    #[test]
    fn test_derive_name_from_url() {
        assert_eq!(
            derive_name(None, "https://host/api/v1/client/home.yml?token=1"),
            "home"
        );
        assert_eq!(derive_name(Some(""), "https://host/plain"), "plain");
    }

    #[test]
    fn test_derive_name_random_fallback() {
        let name = derive_name(None, "https://host/");
        assert_eq!(name.len(), 11);
    }

    #[test]
    fn test_sanitize_path_separators() {
        assert_eq!(sanitize("a/b\\c"), "a-b-c");
        assert_eq!(derive_name(Some("../evil.yaml"), "https://h/x"), "..-evil");
    }

    #[test]
    fn test_dedupe_first_free_suffix() {
        let taken = ["sub", "sub_0", "sub_1"];
        assert_eq!(dedupe("sub", |n| taken.contains(&n)).unwrap(), "sub_2");
        assert_eq!(dedupe("fresh", |n| taken.contains(&n)).unwrap(), "fresh");
    }

    #[test]
    fn test_dedupe_exhausted() {
        let result = dedupe("sub", |_| true);
        assert!(matches!(result, Err(Error::NameConflict(_))));
    }
}
