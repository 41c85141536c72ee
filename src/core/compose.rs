//! Runtime config composition - layers the override template onto a subscription
//!
//! Precedence, later steps win:
//! 1. subscription document
//! 2. `dns-override` then `<mode>-dns` (when DNS override is on)
//! 3. `skip-steam-rules` prepended to `rules` (when enabled)
//! 4. controller, secret and dashboard keys
//! 5. `tun-override` replaces `tun`
//! 6. `always-override`, merged over the whole document

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use super::dashboard;
use super::settings::{EnhancedMode, Settings};
use crate::error::{Error, Result};

/// Runtime parameters injected into the composed config
#[derive(Debug, Clone)]
pub struct ComposeOptions {
    pub secret: String,
    pub override_dns: bool,
    pub enhanced_mode: EnhancedMode,
    pub controller_port: u16,
    pub allow_remote_access: bool,
    pub dashboard_dir: PathBuf,
    pub dashboard: Option<String>,
    pub skip_steam_download: bool,
}

impl ComposeOptions {
    pub fn from_settings(settings: &Settings, dashboard_dir: PathBuf) -> Self {
        Self {
            secret: settings.secret.clone(),
            override_dns: settings.override_dns,
            enhanced_mode: settings.enhanced_mode,
            controller_port: settings.controller_port,
            allow_remote_access: settings.allow_remote_access,
            dashboard_dir,
            dashboard: settings.dashboard.clone(),
            skip_steam_download: settings.skip_steam_download,
        }
    }

    /// `host:port` the core's controller listens on
    pub fn controller_address(&self) -> String {
        let host = if self.allow_remote_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };
        format!("{}:{}", host, self.controller_port)
    }
}

/// Read and parse a YAML document
pub fn load_document(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Config(format!("{} does not exist", path.display()))
        } else {
            Error::fs(format!("failed to read {}", path.display()), e)
        }
    })?;
    serde_yaml::from_str(&text).map_err(|source| Error::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Compose the runtime document from a subscription and the override template
pub fn compose(base_path: &Path, override_path: &Path, options: &ComposeOptions) -> Result<Value> {
    let base = load_document(base_path)?;
    let template = load_document(override_path)?;
    debug!(
        "Composing {:?} with template {:?}",
        base_path, override_path
    );
    merge(base, &template, options)
}

/// Compose and atomically write the runtime config
pub fn compose_to_file(
    base_path: &Path,
    override_path: &Path,
    output_path: &Path,
    options: &ComposeOptions,
) -> Result<()> {
    let document = compose(base_path, override_path, options)?;
    write_document(output_path, &document)?;
    info!("Runtime config written to {:?}", output_path);
    Ok(())
}

/// Apply the override layers to an already parsed subscription
pub fn merge(base: Value, template: &Value, options: &ComposeOptions) -> Result<Value> {
    let mut config = match base {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => {
            return Err(Error::Config(
                "subscription document is not a mapping".to_string(),
            ))
        }
    };

    if options.override_dns {
        let mut dns = mapping_section(template, "dns-override")?.clone();
        let mode_key = format!("{}-dns", options.enhanced_mode.as_str());
        merge_mapping(&mut dns, mapping_section(template, &mode_key)?);
        config.insert(key("dns"), Value::Mapping(dns));
    }

    if options.skip_steam_download {
        let skip_rules = match section(template, "skip-steam-rules")? {
            Value::Sequence(rules) => rules.clone(),
            _ => {
                return Err(Error::Config(
                    "`skip-steam-rules` is not a sequence".to_string(),
                ))
            }
        };
        let existing = match config.remove("rules") {
            Some(Value::Sequence(rules)) => rules,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(Error::Config(
                    "subscription `rules` is not a sequence".to_string(),
                ))
            }
        };
        let mut rules = skip_rules;
        rules.extend(existing);
        config.insert(key("rules"), Value::Sequence(rules));
    }

    config.insert(
        key("external-controller"),
        Value::String(options.controller_address()),
    );
    config.insert(key("secret"), Value::String(options.secret.clone()));
    config.insert(
        key("external-ui"),
        Value::String(options.dashboard_dir.to_string_lossy().into_owned()),
    );
    if let Some(name) = &options.dashboard {
        config.insert(key("external-ui-name"), Value::String(name.clone()));
        if let Some(url) = dashboard::builtin_url(name) {
            config.insert(key("external-ui-url"), Value::String(url.to_string()));
        }
    }

    config.insert(key("tun"), section(template, "tun-override")?.clone());

    merge_mapping(&mut config, mapping_section(template, "always-override")?);

    Ok(Value::Mapping(config))
}

/// Serialize `document` next to `path` and rename it into place
pub fn write_document(path: &Path, document: &Value) -> Result<()> {
    let text = serde_yaml::to_string(document)
        .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| Error::fs(format!("failed to create {}", parent.display()), e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config.yaml".to_string());
    let tmp_path = parent.join(format!(".{}.tmp", file_name));

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    };
    write().map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        Error::fs(format!("failed to write {}", path.display()), e)
    })
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn section<'a>(template: &'a Value, name: &str) -> Result<&'a Value> {
    template
        .get(name)
        .ok_or_else(|| Error::Config(format!("override template has no `{}`", name)))
}

fn mapping_section<'a>(template: &'a Value, name: &str) -> Result<&'a Mapping> {
    section(template, name)?
        .as_mapping()
        .ok_or_else(|| Error::Config(format!("`{}` is not a mapping", name)))
}

/// Shallow merge: top-level keys of `overlay` replace those of `target`
fn merge_mapping(target: &mut Mapping, overlay: &Mapping) {
    for (k, v) in overlay {
        target.insert(k.clone(), v.clone());
    }
}
