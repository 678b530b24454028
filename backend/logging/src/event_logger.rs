//! Plugin lifecycle records.
//!
//! Each lifecycle transition is emitted as one structured event under the
//! `plugin_lifecycle` target, so the NDJSON file can be filtered on it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Target every lifecycle record is emitted under.
pub const LIFECYCLE_TARGET: &str = "plugin_lifecycle";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Constructed { first_load: bool },
    /// The data file was unreadable and was reset to an empty document.
    DataReset,
    Loaded,
    LoadFailed { error: String },
    /// Debug mode: the unload save was skipped.
    SaveSkipped,
    Unloaded,
    UnloadFailed { error: String },
}

#[derive(Debug, Serialize)]
pub struct LifecycleLogEntry {
    pub plugin: String,
    pub timestamp: DateTime<Utc>,
    pub event: LifecycleEvent,
}

impl LifecycleLogEntry {
    pub fn new(plugin: &str, event: LifecycleEvent) -> Self {
        Self {
            plugin: plugin.into(),
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

pub struct LifecycleLogger;

impl LifecycleLogger {
    pub fn log_event(plugin: &str, event: LifecycleEvent) {
        let entry = LifecycleLogEntry::new(plugin, event);
        info!(
            target: LIFECYCLE_TARGET,
            plugin = %entry.plugin,
            entry = %entry.to_json(),
            "Plugin lifecycle event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serializes_with_tag() {
        let entry =
            LifecycleLogEntry::new("Echo", LifecycleEvent::Constructed { first_load: true });
        let value: serde_json::Value = serde_json::from_str(&entry.to_json()).unwrap();
        assert_eq!(value["plugin"], "Echo");
        assert_eq!(value["event"]["type"], "constructed");
        assert_eq!(value["event"]["first_load"], true);
    }

    #[test]
    fn test_unit_variant_tag() {
        let entry = LifecycleLogEntry::new("Echo", LifecycleEvent::SaveSkipped);
        assert!(entry.to_json().contains(r#""type":"save_skipped""#));
    }
}
