//! FFmpeg segment encoder
//!
//! Wraps one long-running ffmpeg process that reads raw frames on stdin and
//! writes a rolling HLS playlist plus segments next to it.

use crate::encoder::types::{EncoderError, EncoderSettings, TimestampMode};
use crate::utils::process::{forward_stderr, wait_timeout};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Playlist file written inside each stream directory
pub const PLAYLIST_FILE: &str = "index.m3u8";

/// A launch or configuration error makes ffmpeg exit within this window
const STARTUP_PROBE: Duration = Duration::from_millis(200);

/// Time allowed for ffmpeg to flush after end-of-stream before it is killed
const EXIT_GRACE: Duration = Duration::from_secs(10);

struct Input {
    pipe: ChildStdin,
    last_wallclock: f64,
}

/// Segmenting transcoder fed with raw frames
pub struct SegmentEncoder {
    output: PathBuf,
    settings: EncoderSettings,
    process: Mutex<Option<Child>>,
    input: Mutex<Option<Input>>,
    frames_written: AtomicU64,
    closed: AtomicBool,
}

impl SegmentEncoder {
    /// Start ffmpeg writing an HLS playlist to `output`
    pub fn open(ffmpeg: &Path, output: &Path, settings: EncoderSettings) -> Result<Self, EncoderError> {
        let mut command = Command::new(ffmpeg);
        command
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(settings.input_args())
            .args(settings.output_args())
            .arg(output);

        tracing::info!(
            "Starting HLS encoder for {:?}: {}x{} @ {}fps, {} ({}s segments, window {}, keyint {})",
            output,
            settings.width,
            settings.height,
            settings.frame_rate,
            settings.preset.video_codec(),
            settings.segment_duration,
            settings.playlist_size,
            settings.keyframe_interval()
        );

        Self::spawn(command, output, settings)
    }

    /// Start an arbitrary transcoder command that consumes raw frames on stdin
    pub fn spawn(mut command: Command, output: &Path, settings: EncoderSettings) -> Result<Self, EncoderError> {
        let mut process = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncoderError::Spawn(format!("failed to start transcoder: {}", e)))?;

        let pipe = match process.stdin.take() {
            Some(pipe) => pipe,
            None => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(EncoderError::Spawn("failed to capture transcoder stdin".to_string()));
            }
        };

        if let Some(stderr) = process.stderr.take() {
            forward_stderr(stderr, format!("encode {}", output.display()));
        }

        match wait_timeout(&mut process, STARTUP_PROBE) {
            Ok(Some(status)) => {
                return Err(EncoderError::Spawn(format!(
                    "transcoder exited during startup with {}",
                    status
                )));
            }
            Ok(None) => {}
            Err(e) => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(EncoderError::Io(e));
            }
        }

        Ok(Self {
            output: output.to_path_buf(),
            settings,
            process: Mutex::new(Some(process)),
            input: Mutex::new(Some(Input {
                pipe,
                last_wallclock: 0.0,
            })),
            frames_written: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Settings this encoder was opened with
    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Playlist path
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Number of frames accepted so far
    pub fn frame_count(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Whether the transcoder process is still running
    pub fn is_alive(&self) -> bool {
        match self.process.lock().as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Write one frame and return its presentation timestamp in seconds.
    ///
    /// Blocks while the transcoder's input pipe is full.
    pub fn submit(&self, frame: &[u8]) -> Result<f64, EncoderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EncoderError::Closed);
        }

        let expected = self.settings.frame_size();
        if frame.len() != expected {
            return Err(EncoderError::FrameSize {
                expected,
                actual: frame.len(),
            });
        }

        let mut guard = self.input.lock();
        let input = guard.as_mut().ok_or(EncoderError::Closed)?;

        let index = self.frames_written.load(Ordering::Relaxed);
        let timestamp = match self.settings.timestamps {
            TimestampMode::Synthetic => index as f64 / self.settings.frame_rate as f64,
            TimestampMode::WallClock => {
                let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
                let ts = now.max(input.last_wallclock + 1e-6);
                input.last_wallclock = ts;
                ts
            }
        };

        if let Err(e) = input.pipe.write_all(frame) {
            drop(guard);
            if self.closed.load(Ordering::SeqCst) {
                return Err(EncoderError::Closed);
            }
            return Err(EncoderError::Dead(self.failure_reason(&e)));
        }

        self.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(timestamp)
    }

    fn failure_reason(&self, error: &std::io::Error) -> String {
        match self.process.lock().as_mut().map(|p| p.try_wait()) {
            Some(Ok(Some(status))) => format!("transcoder exited with {}", status),
            _ => format!("input pipe failed: {}", error),
        }
    }

    /// Signal end-of-stream and wait for the transcoder to exit.
    ///
    /// Calling it again after the first call does nothing.
    pub fn close(&self) -> Result<(), EncoderError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        drop(self.input.lock().take());

        let deadline = Instant::now() + EXIT_GRACE;
        let status = loop {
            {
                let mut guard = self.process.lock();
                let process = match guard.as_mut() {
                    Some(process) => process,
                    None => return Ok(()),
                };
                if let Some(status) = process.try_wait()? {
                    guard.take();
                    break status;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(
                        "Encoder for {:?} did not exit within {:?}, killing it",
                        self.output,
                        EXIT_GRACE
                    );
                    let _ = process.kill();
                    let status = process.wait()?;
                    guard.take();
                    break status;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        tracing::info!(
            "Encoder for {:?} finished: {} frames written",
            self.output,
            self.frame_count()
        );

        if status.success() {
            Ok(())
        } else {
            Err(EncoderError::Dead(format!("transcoder exited with {}", status)))
        }
    }

    /// Kill the transcoder immediately, unblocking a stuck `submit`
    pub fn kill(&self) {
        if let Some(process) = self.process.lock().as_mut() {
            if let Err(e) = process.kill() {
                tracing::debug!("Encoder kill failed (already exited?): {}", e);
            }
        }
    }
}

impl Drop for SegmentEncoder {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        drop(self.input.get_mut().take());
        if let Some(mut process) = self.process.get_mut().take() {
            let _ = process.kill();
            let _ = process.wait();
            tracing::debug!("Encoder for {:?} released without close", self.output);
        }
    }
}
