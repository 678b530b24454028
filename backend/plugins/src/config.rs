//! Host-supplied plugin configuration.
//!
//! Every override a host may apply at construction time is enumerated here;
//! unknown keys are rejected rather than attached to the plugin.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::{PluginError, Result};
use crate::store::StoreFormat;

/// Canonical persistence format when none is configured.
pub const DEFAULT_SAVE_TYPE: &str = "json";

const DEFAULT_PLUGINS_DIR: &str = "plugins";
const DEFAULT_PERSISTENT_DIR: &str = "data";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginConfig {
    /// Persistence format, used as the data file's extension.
    pub save_type: Option<String>,
    /// Replaces the dependency table the plugin declares.
    pub dependencies: Option<BTreeMap<String, String>>,
    /// Seed content adopted by the store on load.
    pub data: Option<Map<String, Value>>,
    /// Where the plugin is installed. Defaults to `<plugins_dir>/<name>`.
    pub source_dir: Option<PathBuf>,
    pub plugins_dir: Option<PathBuf>,
    pub persistent_dir: Option<PathBuf>,
    /// Skip the save on unload and dump the data instead.
    pub debug: bool,
}

impl PluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a loose JSON mapping, rejecting unknown keys.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| PluginError::Config(e.to_string()))
    }

    /// Read a config file; the format follows the extension.
    pub async fn load(path: &Path) -> Result<Self> {
        let format = StoreFormat::from_path(path).ok_or_else(|| {
            PluginError::Config(format!("unsupported config file: {}", path.display()))
        })?;
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read plugin config: {}", path.display()))
            .map_err(|e| PluginError::Config(format!("{e:#}")))?;
        let value = format.parse(&raw).map_err(PluginError::Config)?;
        debug!(path = %path.display(), "Loaded plugin config");
        Self::from_value(value)
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_save_type(mut self, save_type: impl Into<String>) -> Self {
        self.save_type = Some(save_type.into());
        self
    }

    pub fn with_dependencies(mut self, dependencies: BTreeMap<String, String>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    pub fn with_plugins_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugins_dir = Some(dir.into());
        self
    }

    pub fn with_persistent_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistent_dir = Some(dir.into());
        self
    }

    /// Resolved save type; empty values fall back to the default.
    pub fn save_type(&self) -> &str {
        match self.save_type.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => DEFAULT_SAVE_TYPE,
        }
    }

    /// Priority: explicit config > `PERCH_PLUGINS_DIR` env > `plugins`.
    pub fn plugins_root(&self) -> PathBuf {
        resolve_dir(self.plugins_dir.as_ref(), "PERCH_PLUGINS_DIR", DEFAULT_PLUGINS_DIR)
    }

    /// Priority: explicit config > `PERCH_PERSISTENT_DIR` env > `data`.
    pub fn persistent_root(&self) -> PathBuf {
        resolve_dir(
            self.persistent_dir.as_ref(),
            "PERCH_PERSISTENT_DIR",
            DEFAULT_PERSISTENT_DIR,
        )
    }
}

fn resolve_dir(explicit: Option<&PathBuf>, env_key: &str, fallback: &str) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.clone();
    }
    if let Ok(dir) = std::env::var(env_key) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = PluginConfig::from_value(json!({ "debug": true, "colour": "red" })).unwrap_err();
        assert!(matches!(err, PluginError::Config(_)));
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn test_from_value_and_defaults() {
        let config = PluginConfig::from_value(json!({
            "debug": true,
            "data": { "count": 1 },
            "plugins_dir": "/srv/plugins"
        }))
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.save_type(), "json");
        assert_eq!(config.plugins_root(), PathBuf::from("/srv/plugins"));
        assert_eq!(config.data.unwrap()["count"], 1);
    }

    #[test]
    fn test_blank_save_type_falls_back() {
        assert_eq!(PluginConfig::new().with_save_type(" ").save_type(), DEFAULT_SAVE_TYPE);
        assert_eq!(PluginConfig::new().with_save_type("yaml").save_type(), "yaml");
    }

    #[tokio::test]
    async fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.toml");
        std::fs::write(
            &path,
            "save_type = \"yaml\"\ndebug = true\n[dependencies]\ncore = \">=1.0\"\n",
        )
        .unwrap();

        let config = PluginConfig::load(&path).await.unwrap();
        assert_eq!(config.save_type(), "yaml");
        assert!(config.debug);
        assert_eq!(config.dependencies.unwrap()["core"], ">=1.0");
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_extension() {
        let err = PluginConfig::load(Path::new("plugin.ini")).await.unwrap_err();
        assert!(matches!(err, PluginError::Config(_)));
    }
}
