//! Stream registry read/write operations
//!
//! The registry is a single JSON object mapping stream ids to their
//! configuration:
//!
//! ```json
//! {
//!     "cam1": {
//!         "sourceUrl": "rtsp://10.0.0.2:554/stream1",
//!         "outputLocator": "cam1/index.m3u8",
//!         "addedAt": "2024-05-01T12:00:00Z"
//!     }
//! }
//! ```
//!
//! Files written by older deployments that use `rtsp_url` still load. A
//! malformed entry is logged and left out; the rest of the file still loads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Registry-related errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to replace registry file {path}: {reason}")]
    Persist { path: String, reason: String },
}

/// Persisted configuration of one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// Live source URL
    #[serde(alias = "sourceURL", alias = "rtsp_url", alias = "source_url")]
    pub source_url: String,

    /// Playlist location relative to the stream root
    #[serde(default)]
    pub output_locator: String,

    /// When the stream was added
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,
}

impl StreamConfig {
    pub fn new(source_url: impl Into<String>, output_locator: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            output_locator: output_locator.into(),
            added_at: Some(Utc::now()),
        }
    }
}

/// Stream id -> configuration, ordered by id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Registry {
    streams: BTreeMap<String, StreamConfig>,
}

impl Registry {
    pub fn get(&self, id: &str) -> Option<&StreamConfig> {
        self.streams.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, config: StreamConfig) -> Option<StreamConfig> {
        self.streams.insert(id.into(), config)
    }

    pub fn remove(&mut self, id: &str) -> Option<StreamConfig> {
        self.streams.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StreamConfig)> {
        self.streams.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Durable storage for the registry
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry; a missing or empty file is an empty registry
    pub fn load(&self) -> Result<Registry, RegistryError> {
        if !self.path.exists() {
            tracing::info!("No registry at {:?}, starting empty", self.path);
            return Ok(Registry::default());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Registry::default());
        }

        // Entries are decoded one by one so a bad entry only loses itself
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)?;
        let mut registry = Registry::default();
        for (id, value) in raw {
            match serde_json::from_value::<StreamConfig>(value) {
                Ok(config) => {
                    registry.insert(id, config);
                }
                Err(e) => {
                    tracing::warn!("Skipping malformed registry entry {} in {:?}: {}", id, self.path, e);
                }
            }
        }

        tracing::debug!("Loaded {} streams from {:?}", registry.len(), self.path);
        Ok(registry)
    }

    /// Rewrite the whole registry.
    ///
    /// The new content goes to a temporary file in the same directory which
    /// then replaces the old file by rename, so readers see either the old
    /// or the new registry, never a partial write.
    pub fn save(&self, registry: &Registry) -> Result<(), RegistryError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let content = serde_json::to_string_pretty(registry)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| RegistryError::Persist {
            path: self.path.display().to_string(),
            reason: e.error.to_string(),
        })?;

        tracing::debug!("Saved {} streams to {:?}", registry.len(), self.path);
        Ok(())
    }
}
