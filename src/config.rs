//! Layered CLI configuration: endpoints, contexts and the active context.
//!
//! The configuration is assembled from an ordered list of YAML files. Later
//! files override scalar fields when they set them, and are unioned into the
//! endpoint/context mappings with the later entry winning per name. Edits are
//! written back to the last file of the search list.

use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::ValarError;

pub(crate) const CONFIG_ENV: &str = "VALARCONFIG";
pub(crate) const DEFAULT_ENDPOINT_URL: &str = "https://api.valar.dev/v2";
const CONFIG_DIR_NAME: &str = ".valar";
const CONFIG_FILE_NAME: &str = "config";
const CONFIG_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct Endpoint {
    #[serde(default)]
    pub(crate) token: String,
    #[serde(default)]
    pub(crate) url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct ContextEntry {
    #[serde(default)]
    pub(crate) endpoint: String,
    #[serde(default)]
    pub(crate) project: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CliConfig {
    pub(crate) active_context: String,
    pub(crate) endpoints: BTreeMap<String, Endpoint>,
    pub(crate) contexts: BTreeMap<String, ContextEntry>,
    #[serde(skip)]
    pub(crate) path: PathBuf,
}

/// One file of the search list. Every field is optional so that a layer only
/// overrides what it actually sets.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigLayer {
    active_context: Option<String>,
    endpoints: Option<BTreeMap<String, Endpoint>>,
    contexts: Option<BTreeMap<String, ContextEntry>>,
}

/// Resolves the ordered list of config files for this invocation.
///
/// An explicit `--config` value wins over `$VALARCONFIG`, which wins over
/// `~/.valar/config`. Both overrides accept a semicolon-separated list.
pub(crate) fn search_paths(override_spec: Option<&str>) -> Result<Vec<PathBuf>, ValarError> {
    let spec = match override_spec {
        Some(spec) => Some(spec.to_string()),
        None => env::var(CONFIG_ENV).ok(),
    };
    match spec.filter(|spec| !spec.trim().is_empty()) {
        Some(spec) => {
            let paths = split_search_spec(&spec);
            if paths.is_empty() {
                return Err(ValarError::Config(format!(
                    "config search path '{spec}' does not name any file"
                )));
            }
            Ok(paths)
        }
        None => Ok(vec![default_config_path()?]),
    }
}

fn split_search_spec(spec: &str) -> Vec<PathBuf> {
    spec.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| PathBuf::from(expand_path(part)))
        .collect()
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn default_config_path() -> Result<PathBuf, ValarError> {
    let home = home_dir().ok_or_else(|| {
        ValarError::Config("unable to resolve $HOME; set HOME or VALARCONFIG".to_string())
    })?;
    let dir = home.join(CONFIG_DIR_NAME);
    fs::create_dir_all(&dir)?;
    Ok(dir.join(CONFIG_FILE_NAME))
}

/// Loads and merges every file of `paths`.
///
/// Unreadable files are skipped with a warning. A file that exists but is not
/// valid YAML aborts the load.
pub(crate) fn load(paths: &[PathBuf]) -> Result<CliConfig, ValarError> {
    let last = paths
        .last()
        .ok_or_else(|| ValarError::Config("no config file to load".to_string()))?;
    let mut cfg = CliConfig {
        path: last.clone(),
        ..CliConfig::default()
    };
    for path in paths {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                warn!("could not read config file {}: {}", path.display(), err);
                continue;
            }
        };
        let layer = parse_layer(&content).map_err(|err| {
            ValarError::Config(format!("invalid config file {}: {}", path.display(), err))
        })?;
        debug!(path = %path.display(), "merged config layer");
        cfg.merge(layer);
    }
    Ok(cfg)
}

fn parse_layer(content: &str) -> Result<ConfigLayer, serde_yaml::Error> {
    if content.trim().is_empty() {
        return Ok(ConfigLayer::default());
    }
    serde_yaml::from_str(content)
}

fn require<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str, ValarError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ValarError::Config(format!(
            "operation requires valid {what}; choose or configure a context using `valar config`"
        ))),
    }
}

impl CliConfig {
    fn merge(&mut self, layer: ConfigLayer) {
        if let Some(active) = layer.active_context.filter(|name| !name.is_empty()) {
            self.active_context = active;
        }
        self.endpoints.extend(layer.endpoints.unwrap_or_default());
        self.contexts.extend(layer.contexts.unwrap_or_default());
    }

    fn active(&self) -> Option<&ContextEntry> {
        self.contexts.get(&self.active_context)
    }

    fn active_endpoint(&self) -> Option<&Endpoint> {
        self.active()
            .and_then(|context| self.endpoints.get(&context.endpoint))
    }

    pub(crate) fn token(&self) -> Result<&str, ValarError> {
        require(
            self.active_endpoint().map(|endpoint| endpoint.token.as_str()),
            "endpoint token",
        )
    }

    pub(crate) fn endpoint_url(&self) -> Result<&str, ValarError> {
        require(
            self.active_endpoint().map(|endpoint| endpoint.url.as_str()),
            "endpoint URL",
        )
    }

    pub(crate) fn project(&self) -> Result<&str, ValarError> {
        require(
            self.active().map(|context| context.project.as_str()),
            "context project",
        )
    }

    pub(crate) fn active_context_is_usable(&self) -> bool {
        self.token().is_ok() && self.endpoint_url().is_ok() && self.project().is_ok()
    }

    /// Updates the named endpoint, creating it when missing. Unset fields keep their value.
    pub(crate) fn set_endpoint(&mut self, name: &str, url: Option<String>, token: Option<String>) {
        let endpoint = self.endpoints.entry(name.to_string()).or_default();
        if let Some(url) = url.filter(|url| !url.is_empty()) {
            endpoint.url = url;
        }
        if let Some(token) = token.filter(|token| !token.is_empty()) {
            endpoint.token = token;
        }
    }

    pub(crate) fn remove_endpoint(&mut self, name: &str) -> Result<Endpoint, ValarError> {
        let removed = self
            .endpoints
            .remove(name)
            .ok_or_else(|| ValarError::Config(format!("endpoint '{name}' is not configured")))?;
        for (context_name, context) in &self.contexts {
            if context.endpoint == name {
                warn!("context '{context_name}' still references removed endpoint '{name}'");
            }
        }
        Ok(removed)
    }

    /// Updates the named context, creating it when missing. Unset fields keep their value.
    pub(crate) fn set_context(
        &mut self,
        name: &str,
        endpoint: Option<String>,
        project: Option<String>,
    ) {
        let context = self.contexts.entry(name.to_string()).or_default();
        if let Some(endpoint) = endpoint.filter(|endpoint| !endpoint.is_empty()) {
            context.endpoint = endpoint;
        }
        if let Some(project) = project.filter(|project| !project.is_empty()) {
            context.project = project;
        }
        if !self.endpoints.contains_key(&context.endpoint) {
            warn!(
                "context '{name}' references endpoint '{}' which is not configured",
                context.endpoint
            );
        }
    }

    pub(crate) fn use_context(&mut self, name: &str) -> Result<(), ValarError> {
        if !self.contexts.contains_key(name) {
            return Err(ValarError::Config(format!(
                "context '{name}' is not configured"
            )));
        }
        self.active_context = name.to_string();
        Ok(())
    }

    pub(crate) fn remove_context(&mut self, name: &str) -> Result<ContextEntry, ValarError> {
        let removed = self
            .contexts
            .remove(name)
            .ok_or_else(|| ValarError::Config(format!("context '{name}' is not configured")))?;
        if self.active_context == name {
            warn!("removed the active context '{name}'; select another one with `valar config context use`");
            self.active_context.clear();
        }
        Ok(removed)
    }

    /// Writes the merged configuration to the last file of the search list.
    pub(crate) fn write(&self) -> Result<(), ValarError> {
        let content = serde_yaml::to_string(self)?;
        write_atomic_text_file(&self.path, &content, CONFIG_FILE_MODE)
    }
}

pub(crate) fn ensure_parent(path: &Path) -> Result<(), ValarError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Replaces `path` with `content` through a temporary sibling and a rename, so
/// a failed write never leaves a truncated file behind. An existing file keeps
/// its permissions; a new one gets `default_mode`.
pub(crate) fn write_atomic_text_file(
    path: &Path,
    content: &str,
    default_mode: u32,
) -> Result<(), ValarError> {
    ensure_parent(path)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "valar".to_string()),
        pid,
        ts
    ));

    if let Err(err) = fs::write(&tmp_path, content) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .map(|m| m.permissions().mode())
            .unwrap_or(default_mode);
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = default_mode;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
