//! Encoder types and configuration
//!
//! This module defines the codec presets, the immutable per-stream encoder
//! settings and the encoder error type.

use crate::capture::PixelFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Codec paths available to a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HlsPreset {
    /// Software H.264 (libx264)
    Cpu,
    /// NVIDIA hardware H.264 (h264_nvenc)
    Gpu,
}

impl HlsPreset {
    /// FFmpeg video codec
    pub fn video_codec(&self) -> &'static str {
        match self {
            HlsPreset::Cpu => "libx264",
            HlsPreset::Gpu => "h264_nvenc",
        }
    }

    /// Codec speed/quality preset
    pub fn codec_preset(&self) -> &'static str {
        match self {
            HlsPreset::Cpu => "veryfast",
            // p1 (fastest) .. p7 (slowest)
            HlsPreset::Gpu => "p3",
        }
    }

    /// Codec tuning, if any
    pub fn tune(&self) -> Option<&'static str> {
        match self {
            HlsPreset::Cpu => None,
            HlsPreset::Gpu => Some("ll"),
        }
    }

    /// Target bitrate, also used as maxrate and buffer size
    pub fn bitrate(&self) -> &'static str {
        "6M"
    }

    /// Codec arguments for the ffmpeg output
    pub fn codec_args(&self) -> Vec<String> {
        let mut args = vec![
            "-c:v".to_string(),
            self.video_codec().to_string(),
            "-preset".to_string(),
            self.codec_preset().to_string(),
        ];
        if let Some(tune) = self.tune() {
            args.extend(["-tune".to_string(), tune.to_string()]);
        }
        args.extend([
            "-b:v".to_string(),
            self.bitrate().to_string(),
            "-maxrate".to_string(),
            self.bitrate().to_string(),
            "-bufsize".to_string(),
            self.bitrate().to_string(),
        ]);
        args
    }
}

impl FromStr for HlsPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "default_cpu" => Ok(HlsPreset::Cpu),
            "gpu" | "default_gpu" => Ok(HlsPreset::Gpu),
            other => Err(format!("unknown HLS preset '{}', expected cpu or gpu", other)),
        }
    }
}

impl fmt::Display for HlsPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HlsPreset::Cpu => f.write_str("cpu"),
            HlsPreset::Gpu => f.write_str("gpu"),
        }
    }
}

/// How `submit` timestamps frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimestampMode {
    /// Evenly spaced at `1 / frame_rate`, regardless of arrival jitter
    Synthetic,
    /// Wall-clock arrival time
    WallClock,
}

/// Immutable encoder configuration, resolved once per stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderSettings {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Input frame rate
    pub frame_rate: u32,
    /// Layout of submitted frames
    pub pixel_format: PixelFormat,
    /// Target segment duration in seconds
    pub segment_duration: u32,
    /// Number of segments kept in the playlist (and on disk)
    pub playlist_size: u32,
    /// Codec path
    pub preset: HlsPreset,
    /// Frame timestamping
    pub timestamps: TimestampMode,
}

impl EncoderSettings {
    pub const DEFAULT_SEGMENT_DURATION: u32 = 2;
    /// Two minutes of rewind at the default segment duration
    pub const DEFAULT_PLAYLIST_SIZE: u32 = 60;

    /// Settings for a probed source with the default segmenting
    pub fn new(width: u32, height: u32, frame_rate: u32, preset: HlsPreset) -> Result<Self, EncoderError> {
        if width == 0 || height == 0 {
            return Err(EncoderError::InvalidSettings(format!(
                "frame dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        if frame_rate == 0 {
            return Err(EncoderError::InvalidSettings(
                "frame rate must be positive".to_string(),
            ));
        }

        Ok(Self {
            width,
            height,
            frame_rate,
            pixel_format: PixelFormat::Rgb24,
            segment_duration: Self::DEFAULT_SEGMENT_DURATION,
            playlist_size: Self::DEFAULT_PLAYLIST_SIZE,
            preset,
            timestamps: TimestampMode::Synthetic,
        })
    }

    pub fn with_segment_duration(mut self, seconds: u32) -> Self {
        self.segment_duration = seconds.max(1);
        self
    }

    pub fn with_playlist_size(mut self, segments: u32) -> Self {
        self.playlist_size = segments.max(1);
        self
    }

    pub fn with_timestamps(mut self, mode: TimestampMode) -> Self {
        self.timestamps = mode;
        self
    }

    /// Frames between keyframes; one GOP per segment so every segment
    /// starts on a keyframe
    pub fn keyframe_interval(&self) -> u32 {
        self.segment_duration * self.frame_rate
    }

    /// Expected size of one submitted frame in bytes
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }

    /// ffmpeg input arguments for the raw frame pipe
    pub fn input_args(&self) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            self.pixel_format.ffmpeg_name().to_string(),
            "-s".to_string(),
            format!("{}x{}", self.width, self.height),
            "-r".to_string(),
            self.frame_rate.to_string(),
        ];
        if self.timestamps == TimestampMode::WallClock {
            args.extend(["-use_wallclock_as_timestamps".to_string(), "1".to_string()]);
        }
        args.extend(["-i".to_string(), "pipe:".to_string()]);
        args
    }

    /// ffmpeg output arguments producing a rolling HLS playlist
    pub fn output_args(&self) -> Vec<String> {
        let keyint = self.keyframe_interval().to_string();
        let mut args = self.preset.codec_args();
        args.extend([
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-g".to_string(),
            keyint.clone(),
            "-keyint_min".to_string(),
            keyint,
            "-sc_threshold".to_string(),
            "0".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            self.segment_duration.to_string(),
            "-hls_list_size".to_string(),
            self.playlist_size.to_string(),
            // Outdated segments are removed from disk by ffmpeg
            "-hls_flags".to_string(),
            "delete_segments".to_string(),
            "-start_number".to_string(),
            "0".to_string(),
        ]);
        args
    }
}

/// Encoder errors
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to start encoder: {0}")]
    Spawn(String),

    #[error("Invalid encoder settings: {0}")]
    InvalidSettings(String),

    #[error("Encoder is closed")]
    Closed,

    #[error("Encoder process died: {0}")]
    Dead(String),

    #[error("Frame size mismatch: got {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
}
