//! Stream lifecycle state
//!
//! Defines the per-stream state machine, the listing returned to callers and
//! the supervisor error type.

use crate::registry::RegistryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle of one stream id.
///
/// `Absent -> Starting -> Running -> Stopping -> Absent`. A pipeline that
/// fails is cleaned up and reported as `Absent`; no failed state is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// No pipeline for this id
    Absent,
    /// Probing the source and launching the encoder
    Starting,
    /// Capture worker is feeding the encoder
    Running,
    /// Worker is being joined and the encoder closed
    Stopping,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::Absent
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Absent => "absent",
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// One entry of `list_streams`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamListing {
    /// Live source URL
    pub source_url: String,

    /// URL path of the playlist served by the HTTP layer
    pub playback_url: String,

    /// Whether a pipeline is currently producing segments
    pub active: bool,
}

/// Outcome of starting every persisted stream at startup
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    /// Streams whose pipelines started
    pub started: Vec<String>,

    /// Streams that could not be started, with the reason
    pub skipped: Vec<(String, String)>,
}

/// Outcome of tearing down every pipeline
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Streams torn down cleanly
    pub stopped: Vec<String>,

    /// Streams whose teardown hit an error (teardown still completed)
    pub failures: Vec<(String, StreamError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Supervisor errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream '{0}' already exists")]
    DuplicateId(String),

    #[error("Invalid stream id '{0}'")]
    InvalidId(String),

    #[error("Source {url} is unreachable: {reason}")]
    SourceUnreachable { url: String, reason: String },

    #[error("Encoder for stream '{id}' failed to start: {reason}")]
    EncoderInitFailed { id: String, reason: String },

    #[error("Encoder for stream '{id}' died: {reason}")]
    EncoderDead { id: String, reason: String },

    #[error("Source of stream '{id}' became unavailable: {reason}")]
    SourceUnavailable { id: String, reason: String },

    #[error("Worker of stream '{0}' did not stop in time and was force-released")]
    StopTimeout(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::DuplicateId(_) => "DUPLICATE_ID",
            StreamError::InvalidId(_) => "INVALID_ID",
            StreamError::SourceUnreachable { .. } => "SOURCE_UNREACHABLE",
            StreamError::EncoderInitFailed { .. } => "ENCODER_INIT_FAILED",
            StreamError::EncoderDead { .. } => "ENCODER_DEAD",
            StreamError::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
            StreamError::StopTimeout(_) => "STOP_TIMEOUT",
            StreamError::Registry(_) => "REGISTRY_ERROR",
            StreamError::Io(_) => "IO_ERROR",
        }
    }
}

/// Reject ids that cannot safely name a directory
pub fn validate_stream_id(id: &str) -> Result<(), StreamError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control);

    if valid {
        Ok(())
    } else {
        Err(StreamError::InvalidId(id.to_string()))
    }
}
