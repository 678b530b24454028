use thiserror::Error;

use crate::lifecycle::PluginState;
use crate::store::StoreError;

/// Errors surfaced by the plugin lifecycle to the hosting runtime.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("plugin '{plugin}' failed to load: {message}")]
    Load { plugin: String, message: String },

    #[error("plugin '{plugin}': {message}")]
    Runtime { plugin: String, message: String },

    #[error("invalid scheduled task: {0}")]
    InvalidTask(String),

    #[error("plugin '{plugin}' is {state:?}, expected {expected}")]
    InvalidState {
        plugin: String,
        state: PluginState,
        expected: &'static str,
    },

    #[error("plugin '{plugin}' dependency error: {message}")]
    Dependency { plugin: String, message: String },

    /// Errors returned by plugin hooks, passed through untouched.
    #[error(transparent)]
    Hook(#[from] anyhow::Error),
}

impl PluginError {
    pub(crate) fn load(plugin: &str, message: impl Into<String>) -> Self {
        Self::Load {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn runtime(plugin: &str, message: impl Into<String>) -> Self {
        Self::Runtime {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn persistence(plugin: &str, action: &str, err: &StoreError) -> Self {
        Self::runtime(plugin, format!("error while {action} persistent data: {err}"))
    }
}

pub type Result<T, E = PluginError> = std::result::Result<T, E>;
