//! Plugin registry: loads and tracks a host's plugins.
//!
//! Plugins are loaded in dependency order. A plugin whose dependencies are
//! missing, failed, or at an incompatible version is skipped and the rest
//! keep loading; unloading runs in reverse load order.
use async_trait::async_trait;
use semver::{Version, VersionReq};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};

use crate::error::{PluginError, Result};
use crate::lifecycle::{CloseArgs, Plugin, PluginLifecycle, PluginState};

/// Type-erased view of a [`PluginLifecycle`] for hosts juggling many plugins.
#[async_trait]
pub trait ManagedPlugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn dependencies(&self) -> &BTreeMap<String, String>;
    fn state(&self) -> PluginState;
    async fn onload(&mut self) -> Result<()>;
    async fn unload(&mut self, args: CloseArgs) -> Result<()>;
}

#[async_trait]
impl<P: Plugin> ManagedPlugin for PluginLifecycle<P> {
    fn name(&self) -> &str {
        self.context().name()
    }

    fn version(&self) -> &str {
        self.context().version()
    }

    fn dependencies(&self) -> &BTreeMap<String, String> {
        self.context().dependencies()
    }

    fn state(&self) -> PluginState {
        PluginLifecycle::state(self)
    }

    async fn onload(&mut self) -> Result<()> {
        PluginLifecycle::onload(self).await
    }

    async fn unload(&mut self, args: CloseArgs) -> Result<()> {
        PluginLifecycle::unload(self, args).await
    }
}

/// Outcome of [`PluginRegistry::load_all`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, PluginError)>,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Box<dyn ManagedPlugin>>,
    load_order: Vec<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn ManagedPlugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            return Err(PluginError::Config(format!("plugin '{name}' is already registered")));
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn ManagedPlugin> {
        self.plugins.get(name).map(|p| p.as_ref())
    }

    pub fn state(&self, name: &str) -> Option<PluginState> {
        self.plugins.get(name).map(|p| p.state())
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Load every unloaded plugin, dependencies first.
    pub async fn load_all(&mut self) -> LoadReport {
        let mut report = LoadReport::default();
        let (ordered, cyclic) = self.dependency_order();

        for name in ordered {
            if self.state(&name) != Some(PluginState::Unloaded) {
                continue;
            }
            if let Err(e) = self.check_dependencies(&name) {
                warn!(plugin = %name, error = %e, "Skipping plugin");
                report.failed.push((name, e));
                continue;
            }
            let Some(plugin) = self.plugins.get_mut(&name) else {
                continue;
            };
            match plugin.onload().await {
                Ok(()) => {
                    self.load_order.push(name.clone());
                    report.loaded.push(name);
                }
                Err(e) => report.failed.push((name, e)),
            }
        }

        for name in cyclic {
            warn!(plugin = %name, "Dependency cycle, not loading");
            report.failed.push((
                name.clone(),
                PluginError::Dependency {
                    plugin: name,
                    message: "dependency cycle".into(),
                },
            ));
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "[Plugins] Load pass finished"
        );
        report
    }

    /// Tear down every plugin that needs it: failed plugins first (nothing
    /// depends on them), then active ones in reverse load order. Every
    /// plugin is attempted; failures are collected.
    pub async fn unload_all(&mut self, args: CloseArgs) -> Vec<(String, PluginError)> {
        let mut order: Vec<String> = self
            .plugins
            .iter()
            .filter(|(_, plugin)| plugin.state() == PluginState::Failed)
            .map(|(name, _)| name.clone())
            .collect();
        order.sort_unstable();
        let loaded: Vec<String> = self
            .load_order
            .drain(..)
            .rev()
            .filter(|name| !order.contains(name))
            .collect();
        order.extend(loaded);

        let mut failures = Vec::new();
        for name in order {
            let Some(plugin) = self.plugins.get_mut(&name) else {
                continue;
            };
            if !matches!(plugin.state(), PluginState::Active | PluginState::Failed) {
                continue;
            }
            if let Err(e) = plugin.unload(args.clone()).await {
                warn!(plugin = %name, error = %e, "Unload failed");
                failures.push((name, e));
            }
        }
        failures
    }

    /// Kahn's algorithm over registered plugins; ties resolve by name.
    /// Returns the load order and the plugins caught in cycles.
    fn dependency_order(&self) -> (Vec<String>, Vec<String>) {
        let mut pending: BTreeMap<&str, BTreeSet<&str>> = self
            .plugins
            .iter()
            .map(|(name, plugin)| {
                let deps = plugin
                    .dependencies()
                    .keys()
                    .map(String::as_str)
                    .filter(|dep| *dep != name.as_str() && self.plugins.contains_key(*dep))
                    .collect();
                (name.as_str(), deps)
            })
            .collect();

        let mut ordered = Vec::with_capacity(pending.len());
        loop {
            let ready: Vec<&str> = pending
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| *name)
                .collect();
            if ready.is_empty() {
                break;
            }
            for name in ready {
                pending.remove(name);
                for deps in pending.values_mut() {
                    deps.remove(name);
                }
                ordered.push(name.to_string());
            }
        }

        let cyclic = pending.keys().map(|n| n.to_string()).collect();
        (ordered, cyclic)
    }

    fn check_dependencies(&self, name: &str) -> Result<()> {
        let Some(plugin) = self.plugins.get(name) else {
            return Ok(());
        };
        let fail = |message: String| PluginError::Dependency {
            plugin: name.to_string(),
            message,
        };

        for (dep_name, requirement) in plugin.dependencies() {
            let dep = self
                .plugins
                .get(dep_name)
                .ok_or_else(|| fail(format!("missing dependency '{dep_name}'")))?;
            if dep.state() != PluginState::Active {
                return Err(fail(format!("dependency '{dep_name}' is not loaded")));
            }
            let req = VersionReq::parse(requirement).map_err(|e| {
                fail(format!("invalid requirement '{requirement}' for '{dep_name}': {e}"))
            })?;
            let version = Version::parse(dep.version()).map_err(|e| {
                fail(format!("'{dep_name}' has invalid version '{}': {e}", dep.version()))
            })?;
            if !req.matches(&version) {
                return Err(fail(format!(
                    "requires '{dep_name}' {requirement}, found {version}"
                )));
            }
        }
        Ok(())
    }
}
