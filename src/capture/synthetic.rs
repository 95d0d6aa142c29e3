//! Generated test-pattern source
//!
//! `synthetic://<name>?fps=15&width=640&height=480` produces a moving
//! gradient in BGR order, paced at the requested rate. Optional query keys:
//! `frames` ends the source after that many frames, `miss_every` reports a
//! transient miss on every n-th read.

use super::frame::PixelFormat;
use super::traits::{CaptureError, FrameRead, FrameSource, SourceAbort, SourceInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// URL scheme handled by [`SyntheticSource`]
pub const SYNTHETIC_SCHEME: &str = "synthetic://";

/// Largest accepted width or height
const MAX_DIMENSION: u32 = 8192;

/// Largest accepted frame rate
const MAX_FRAME_RATE: u32 = 240;

struct FlagAbort {
    aborted: Arc<AtomicBool>,
}

impl SourceAbort for FlagAbort {
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Paced generator of BGR test frames
pub struct SyntheticSource {
    info: SourceInfo,
    frame_limit: Option<u64>,
    miss_every: Option<u64>,
    frames_made: u64,
    reads: u64,
    started: Option<Instant>,
    aborted: Arc<AtomicBool>,
}

impl SyntheticSource {
    /// Create a source with the given shape and rate
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            info: SourceInfo {
                width,
                height,
                frame_rate: frame_rate as f64,
                pixel_format: PixelFormat::Bgr24,
            },
            frame_limit: None,
            miss_every: None,
            frames_made: 0,
            reads: 0,
            started: None,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// End the source after `frames` frames
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Report a transient miss on every n-th read
    pub fn with_miss_every(mut self, n: u64) -> Self {
        self.miss_every = Some(n.max(1));
        self
    }

    /// Whether `url` names a synthetic source
    pub fn handles(url: &str) -> bool {
        url.starts_with(SYNTHETIC_SCHEME)
    }

    /// Build a source from a `synthetic://` URL
    pub fn from_url(url: &str) -> Result<Self, CaptureError> {
        let rest = url
            .strip_prefix(SYNTHETIC_SCHEME)
            .ok_or_else(|| CaptureError::InvalidUrl(url.to_string()))?;

        let mut width = 640;
        let mut height = 480;
        let mut fps = 15;
        let mut frame_limit = None;
        let mut miss_every = None;

        if let Some((_, query)) = rest.split_once('?') {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| CaptureError::InvalidUrl(format!("{}: malformed '{}'", url, pair)))?;
                let number: u64 = value
                    .parse()
                    .map_err(|_| CaptureError::InvalidUrl(format!("{}: '{}' is not a number", url, key)))?;
                let small = || {
                    u32::try_from(number)
                        .map_err(|_| CaptureError::InvalidUrl(format!("{}: '{}' is out of range", url, key)))
                };
                match key {
                    "width" => width = small()?,
                    "height" => height = small()?,
                    "fps" => fps = small()?,
                    "frames" => frame_limit = Some(number),
                    "miss_every" => miss_every = Some(number),
                    other => {
                        return Err(CaptureError::InvalidUrl(format!("{}: unknown key '{}'", url, other)))
                    }
                }
            }
        }

        if width == 0 || height == 0 || fps == 0 {
            return Err(CaptureError::InvalidUrl(format!(
                "{}: width, height and fps must be positive",
                url
            )));
        }
        if width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(CaptureError::InvalidUrl(format!(
                "{}: {}x{} exceeds {}x{}",
                url, width, height, MAX_DIMENSION, MAX_DIMENSION
            )));
        }
        if fps > MAX_FRAME_RATE {
            return Err(CaptureError::InvalidUrl(format!(
                "{}: fps {} exceeds {}",
                url, fps, MAX_FRAME_RATE
            )));
        }

        let mut source = Self::new(width, height, fps);
        if let Some(frames) = frame_limit {
            source = source.with_frame_limit(frames);
        }
        if let Some(n) = miss_every {
            source = source.with_miss_every(n);
        }
        Ok(source)
    }

    fn render(&self, index: u64) -> Vec<u8> {
        let width = self.info.width as usize;
        let height = self.info.height as usize;
        let shift = (index * 4) as usize;
        let mut frame = Vec::with_capacity(self.info.frame_size());
        for y in 0..height {
            for x in 0..width {
                let blue = ((x + shift) * 255 / width.max(1)) as u8;
                let green = (y * 255 / height.max(1)) as u8;
                let red = (index % 256) as u8;
                frame.extend_from_slice(&[blue, green, red]);
            }
        }
        frame
    }
}

impl FrameSource for SyntheticSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<FrameRead, CaptureError> {
        if self.aborted.load(Ordering::SeqCst) {
            return Ok(FrameRead::Ended);
        }
        if let Some(limit) = self.frame_limit {
            if self.frames_made >= limit {
                return Ok(FrameRead::Ended);
            }
        }

        self.reads += 1;
        if let Some(n) = self.miss_every {
            if self.reads % n == 0 {
                return Ok(FrameRead::Pending);
            }
        }

        // Pace frames against the start time so drift does not accumulate
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started + Duration::from_secs_f64(self.frames_made as f64 / self.info.frame_rate);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }

        let frame = self.render(self.frames_made);
        self.frames_made += 1;
        Ok(FrameRead::Frame(frame))
    }

    fn abort_handle(&self) -> Arc<dyn SourceAbort> {
        Arc::new(FlagAbort {
            aborted: self.aborted.clone(),
        })
    }
}
