//! Capture trait definitions
//!
//! Source-agnostic traits and types shared by every frame source.

use super::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Probe failed for {url}: {reason}")]
    Probe { url: String, reason: String },

    #[error("Failed to open source {url}: {reason}")]
    Open { url: String, reason: String },

    #[error("Read error: {0}")]
    Read(String),

    #[error("Invalid frame layout: {0}")]
    FrameLayout(String),

    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),
}

/// Stream properties probed from a live source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Native frame rate (may be fractional, e.g. 30000/1001)
    pub frame_rate: f64,

    /// Layout of the frames returned by `read_frame`
    pub pixel_format: PixelFormat,
}

impl SourceInfo {
    /// Frame rate rounded to a whole number of frames per second, never zero.
    ///
    /// Rounds to nearest, so 29.97 becomes 30 rather than being truncated to 29.
    pub fn whole_frame_rate(&self) -> u32 {
        (self.frame_rate.round() as u32).max(1)
    }

    /// Size in bytes of one frame from this source
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

/// Outcome of a single frame read
#[derive(Debug)]
pub enum FrameRead {
    /// A complete frame in the source's pixel format
    Frame(Vec<u8>),
    /// No frame available right now; the caller should retry
    Pending,
    /// The source ended and will not produce more frames
    Ended,
}

/// Out-of-band handle that unblocks a source stuck in a read
pub trait SourceAbort: Send + Sync {
    fn abort(&self);
}

/// A live source producing decoded frames
pub trait FrameSource: Send {
    /// Properties probed when the source was opened
    fn info(&self) -> &SourceInfo;

    /// Block until the next frame, a transient miss, or the end of the source
    fn read_frame(&mut self) -> Result<FrameRead, CaptureError>;

    /// Handle that can interrupt a blocking read from another thread
    fn abort_handle(&self) -> Arc<dyn SourceAbort>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_frame_rate_rounds_ntsc() {
        let info = SourceInfo {
            width: 1920,
            height: 1080,
            frame_rate: 30000.0 / 1001.0,
            pixel_format: PixelFormat::Rgb24,
        };
        assert_eq!(info.whole_frame_rate(), 30);
        assert_eq!(info.frame_size(), 1920 * 1080 * 3);
    }

    #[test]
    fn test_whole_frame_rate_never_zero() {
        let info = SourceInfo {
            width: 2,
            height: 2,
            frame_rate: 0.0,
            pixel_format: PixelFormat::Bgr24,
        };
        assert_eq!(info.whole_frame_rate(), 1);
    }
}
