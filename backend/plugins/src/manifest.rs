//! Plugin identity: the name, version and dependency table every plugin declares.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{PluginError, Result};

/// Identity a plugin must declare before it can be constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub name: String,
    pub version: String,
    /// Dependency name → semver requirement (e.g. `">=1.2"`).
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl PluginIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn with_dependency(
        mut self,
        name: impl Into<String>,
        requirement: impl Into<String>,
    ) -> Self {
        self.dependencies.insert(name.into(), requirement.into());
        self
    }

    /// Validate the identity for required fields.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PluginError::Config("plugin is missing a name".into()));
        }
        if self.version.trim().is_empty() {
            return Err(PluginError::Config(format!(
                "plugin '{}' is missing a version",
                self.name
            )));
        }
        Ok(())
    }
}
