//! Plugin path resolution.
//!
//! A plugin installed at `<plugins_root>/a/b` keeps its state under
//! `<persistent_root>/a/b/<name>.<save_type>`.

use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::info;

use crate::config::PluginConfig;
use crate::error::{PluginError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPaths {
    /// Install location, re-rooted under the plugins root.
    pub self_path: PathBuf,
    pub work_dir: PathBuf,
    pub data_file: PathBuf,
}

impl PluginPaths {
    /// Compute all paths for `name`. Touches nothing on disk.
    ///
    /// The name and save type become path components, so each must be a
    /// single plain component.
    pub fn resolve(name: &str, config: &PluginConfig) -> Result<Self> {
        let save_type = config.save_type();
        for (what, value) in [("name", name), ("save type", save_type)] {
            if !is_plain_component(value) {
                return Err(PluginError::load(
                    name,
                    format!("{what} {value:?} is not a plain file name"),
                ));
            }
        }

        let plugins_root =
            absolutize(&config.plugins_root()).map_err(|e| PluginError::load(name, e.to_string()))?;
        let persistent_root = absolutize(&config.persistent_root())
            .map_err(|e| PluginError::load(name, e.to_string()))?;

        let source = match &config.source_dir {
            Some(dir) => absolutize(dir).map_err(|e| PluginError::load(name, e.to_string()))?,
            None => plugins_root.join(name),
        };
        let relative = source.strip_prefix(&plugins_root).map_err(|_| {
            PluginError::load(
                name,
                format!(
                    "{} is not inside the plugins directory {}",
                    source.display(),
                    plugins_root.display()
                ),
            )
        })?;

        let self_path = plugins_root.join(relative);
        let work_dir = persistent_root.join(relative);
        let data_file = work_dir.join(format!("{name}.{save_type}"));
        Ok(Self {
            self_path,
            work_dir,
            data_file,
        })
    }

    /// Create the work dir if needed and report whether this is a first load.
    ///
    /// First load means the work dir or the data file did not exist yet.
    pub fn prepare(&self, name: &str) -> Result<bool> {
        let first_load = if !self.work_dir.exists() {
            std::fs::create_dir_all(&self.work_dir).map_err(|e| {
                PluginError::load(
                    name,
                    format!("cannot create {}: {e}", self.work_dir.display()),
                )
            })?;
            info!(plugin = %name, dir = %self.work_dir.display(), "Created plugin work dir");
            true
        } else {
            !self.data_file.exists()
        };

        if !self.work_dir.is_dir() {
            return Err(PluginError::load(
                name,
                format!("{} is not a directory", self.work_dir.display()),
            ));
        }
        Ok(first_load)
    }
}

fn is_plain_component(value: &str) -> bool {
    if value.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == value
    )
}

/// Make `path` absolute against the current directory and fold `.`/`..`
/// lexically. The path does not need to exist.
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}
