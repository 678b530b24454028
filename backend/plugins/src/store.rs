//! Persistent store: a plugin's durable key-value tree.
//!
//! The on-disk format follows the data file's extension. Writes go to a
//! temp file first and are renamed into place.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown persistence format for {}", .0.display())]
    UnknownFormat(PathBuf),

    #[error("data file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to load {}: {message}", path.display())]
    Load { path: PathBuf, message: String },

    #[error("failed to save {}: {message}", path.display())]
    Save { path: PathBuf, message: String },
}

impl StoreError {
    /// Failures the onload sequence is allowed to repair by resetting the file.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownFormat(_) | Self::NotFound(_) | Self::Load { .. }
        )
    }
}

/// Serialization formats a data file may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    Json,
    Yaml,
    Toml,
}

impl StoreFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// The document written when a data file is reset.
    pub fn empty_document(self) -> &'static str {
        match self {
            Self::Json | Self::Yaml => "{}",
            Self::Toml => "",
        }
    }

    pub fn parse(self, raw: &str) -> Result<Value, String> {
        let value = match self {
            Self::Json => serde_json::from_str::<Value>(raw).map_err(|e| e.to_string())?,
            Self::Yaml => serde_yaml::from_str::<Value>(raw).map_err(|e| e.to_string())?,
            Self::Toml => toml::from_str::<Value>(raw).map_err(|e| e.to_string())?,
        };
        match value {
            Value::Object(_) => Ok(value),
            // An empty YAML document deserializes to null.
            Value::Null => Ok(Value::Object(Map::new())),
            other => Err(format!("expected a mapping at the top level, found {}", kind_of(&other))),
        }
    }

    pub fn render(self, data: &Value) -> Result<String, String> {
        match self {
            Self::Json => serde_json::to_string_pretty(data).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::to_string(data).map_err(|e| e.to_string()),
            Self::Toml => toml::to_string_pretty(data).map_err(|e| e.to_string()),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}

/// File-backed hierarchical key-value container.
#[derive(Debug)]
pub struct PersistentStore {
    path: PathBuf,
    data: Value,
    /// Set when the content was seeded by the host; the seed is overlaid on
    /// the next successful load.
    seeded: bool,
}

impl PersistentStore {
    /// Bind a store to `path`. No I/O happens until `load`/`save`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: Value::Object(Map::new()),
            seeded: false,
        }
    }

    /// Adopt a host-supplied mapping as the in-memory content.
    pub fn adopt(&mut self, seed: Map<String, Value>) {
        self.data = Value::Object(seed);
        self.seeded = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Value {
        &mut self.data
    }

    fn format(&self) -> Result<StoreFormat, StoreError> {
        StoreFormat::from_path(&self.path)
            .ok_or_else(|| StoreError::UnknownFormat(self.path.clone()))
    }

    /// Replace the in-memory content with the file's content.
    pub async fn load(&mut self) -> Result<(), StoreError> {
        let format = self.format()?;
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()));
            }
            Err(e) => {
                return Err(StoreError::Load {
                    path: self.path.clone(),
                    message: e.to_string(),
                });
            }
        };
        let mut loaded = format.parse(&raw).map_err(|message| StoreError::Load {
            path: self.path.clone(),
            message,
        })?;

        if self.seeded {
            if let (Value::Object(target), Value::Object(seed)) =
                (&mut loaded, std::mem::take(&mut self.data))
            {
                target.extend(seed);
            }
            self.seeded = false;
        }
        self.data = loaded;
        debug!(path = %self.path.display(), "Loaded persistent data");
        Ok(())
    }

    /// Write the in-memory content to the file (temp file, then rename).
    pub async fn save(&self) -> Result<(), StoreError> {
        let format = self.format()?;
        let save_err = |message: String| StoreError::Save {
            path: self.path.clone(),
            message,
        };
        let rendered = format.render(&self.data).map_err(save_err)?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, rendered.as_bytes())
            .await
            .map_err(|e| save_err(e.to_string()))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| save_err(e.to_string()))?;

        debug!(path = %self.path.display(), "Saved persistent data");
        Ok(())
    }

    /// Overwrite the file with an empty document. Unknown formats get an
    /// empty JSON object.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let empty = self
            .format()
            .map(StoreFormat::empty_document)
            .unwrap_or("{}");
        fs::write(&self.path, empty).await.map_err(|e| StoreError::Save {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}
