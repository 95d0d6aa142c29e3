//! Pipeline backends
//!
//! The supervisor obtains sources and encoders through this seam so the
//! lifecycle logic does not depend on how they are produced.

use crate::capture::{CaptureError, FfmpegSource, FrameSource, SyntheticSource};
use crate::encoder::{EncoderError, EncoderSettings, SegmentEncoder};
use crate::utils::AppConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Factory for the two halves of a pipeline
#[async_trait]
pub trait PipelineBackend: Send + Sync {
    /// Connect to `url` and probe its properties
    async fn open_source(&self, url: &str) -> Result<Box<dyn FrameSource>, CaptureError>;

    /// Launch an encoder writing its playlist to `playlist`
    async fn open_encoder(
        &self,
        playlist: &Path,
        settings: EncoderSettings,
    ) -> Result<SegmentEncoder, EncoderError>;
}

/// Production backend built on ffmpeg and ffprobe
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    source_timeout: Duration,
}

impl FfmpegBackend {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>, source_timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            source_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.ffmpeg_bin.clone(),
            config.ffprobe_bin.clone(),
            config.source_timeout,
        )
    }
}

#[async_trait]
impl PipelineBackend for FfmpegBackend {
    async fn open_source(&self, url: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        if SyntheticSource::handles(url) {
            return Ok(Box::new(SyntheticSource::from_url(url)?));
        }

        let ffmpeg = self.ffmpeg.clone();
        let ffprobe = self.ffprobe.clone();
        let url = url.to_string();
        let timeout = self.source_timeout;

        // Probing blocks on the network
        let source = tokio::task::spawn_blocking(move || FfmpegSource::open(&ffmpeg, &ffprobe, &url, timeout))
            .await
            .map_err(|e| CaptureError::Read(format!("source open task failed: {}", e)))??;

        Ok(Box::new(source))
    }

    async fn open_encoder(
        &self,
        playlist: &Path,
        settings: EncoderSettings,
    ) -> Result<SegmentEncoder, EncoderError> {
        let ffmpeg = self.ffmpeg.clone();
        let playlist = playlist.to_path_buf();

        tokio::task::spawn_blocking(move || SegmentEncoder::open(&ffmpeg, &playlist, settings))
            .await
            .map_err(|e| EncoderError::Spawn(format!("encoder open task failed: {}", e)))?
    }
}
