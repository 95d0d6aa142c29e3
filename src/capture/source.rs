//! ffmpeg-backed live source
//!
//! Probes a network stream with ffprobe, then keeps an ffmpeg process
//! decoding it to raw frames on stdout.

use super::frame::PixelFormat;
use super::traits::{CaptureError, FrameRead, FrameSource, SourceAbort, SourceInfo};
use crate::utils::process::forward_stderr;
use parking_lot::Mutex;
use serde::Deserialize;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// Pixel format requested from the decoder
const DECODE_PIXEL_FORMAT: PixelFormat = PixelFormat::Rgb24;

/// Rates above this are treated as timebase artefacts rather than real rates
const MAX_PLAUSIBLE_FPS: f64 = 240.0;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Parse a frame rate such as "30/1", "30000/1001" or "25"
fn parse_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den <= 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate > 0.0 && rate <= MAX_PLAUSIBLE_FPS).then_some(rate)
}

/// Extract dimensions and frame rate from ffprobe's JSON output
pub fn parse_probe_output(url: &str, json: &str) -> Result<SourceInfo, CaptureError> {
    let probe_error = |reason: String| CaptureError::Probe {
        url: url.to_string(),
        reason,
    };

    let output: ProbeOutput =
        serde_json::from_str(json).map_err(|e| probe_error(format!("unreadable ffprobe output: {}", e)))?;

    let stream = output
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| probe_error("no video stream found".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(probe_error("missing frame dimensions".to_string())),
    };

    let frame_rate = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_rate))
        .ok_or_else(|| probe_error("missing frame rate".to_string()))?;

    Ok(SourceInfo {
        width,
        height,
        frame_rate,
        pixel_format: DECODE_PIXEL_FORMAT,
    })
}

/// Input options bounding how long a network read may block
pub fn network_input_args(url: &str, timeout: Duration) -> Vec<String> {
    let micros = timeout.as_micros().to_string();
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default();

    match scheme.as_str() {
        "rtsp" | "rtsps" => vec![
            "-rtsp_transport".to_string(),
            "tcp".to_string(),
            "-timeout".to_string(),
            micros,
        ],
        "http" | "https" | "rtmp" | "rtmps" | "tcp" | "udp" | "srt" => {
            vec!["-rw_timeout".to_string(), micros]
        }
        _ => Vec::new(),
    }
}

/// Probe a source for its dimensions and frame rate
pub fn probe_source(ffprobe: &Path, url: &str, timeout: Duration) -> Result<SourceInfo, CaptureError> {
    let mut args = vec!["-v".to_string(), "error".to_string()];
    args.extend(network_input_args(url, timeout));
    args.extend(
        [
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,avg_frame_rate",
            "-of",
            "json",
            url,
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    let output = Command::new(ffprobe)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| CaptureError::Probe {
            url: url.to_string(),
            reason: format!("failed to run ffprobe: {}", e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CaptureError::Probe {
            url: url.to_string(),
            reason: format!("ffprobe failed: {}", stderr.trim()),
        });
    }

    parse_probe_output(url, &String::from_utf8_lossy(&output.stdout))
}

/// Kills the decoder process, unblocking a pending read with EOF
struct ProcessAbort {
    process: Arc<Mutex<Child>>,
}

impl SourceAbort for ProcessAbort {
    fn abort(&self) {
        if let Err(e) = self.process.lock().kill() {
            tracing::debug!("Decoder kill failed (already exited?): {}", e);
        }
    }
}

/// Live source decoded by an ffmpeg child process
pub struct FfmpegSource {
    url: String,
    process: Arc<Mutex<Child>>,
    stdout: BufReader<ChildStdout>,
    info: SourceInfo,
    frame_size: usize,
    frames_read: u64,
}

impl FfmpegSource {
    /// Probe `url` and start decoding it
    pub fn open(ffmpeg: &Path, ffprobe: &Path, url: &str, timeout: Duration) -> Result<Self, CaptureError> {
        let info = probe_source(ffprobe, url, timeout)?;

        tracing::info!(
            "Opening source {}: {}x{} @ {:.2}fps",
            url,
            info.width,
            info.height,
            info.frame_rate
        );

        let mut args = vec!["-hide_banner".to_string(), "-loglevel".to_string(), "error".to_string()];
        args.extend(network_input_args(url, timeout));
        args.extend([
            "-i".to_string(),
            url.to_string(),
            "-an".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            info.pixel_format.ffmpeg_name().to_string(),
            // Exact output size, no padding
            "-s".to_string(),
            format!("{}x{}", info.width, info.height),
            "-".to_string(),
        ]);

        let mut process = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CaptureError::Open {
                url: url.to_string(),
                reason: format!("failed to start ffmpeg decoder: {}", e),
            })?;

        let stdout = match process.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = process.kill();
                let _ = process.wait();
                return Err(CaptureError::Open {
                    url: url.to_string(),
                    reason: "failed to capture decoder stdout".to_string(),
                });
            }
        };

        if let Some(stderr) = process.stderr.take() {
            forward_stderr(stderr, format!("decode {}", url));
        }

        let frame_size = info.frame_size();

        Ok(Self {
            url: url.to_string(),
            process: Arc::new(Mutex::new(process)),
            stdout: BufReader::with_capacity(frame_size * 2, stdout),
            info,
            frame_size,
            frames_read: 0,
        })
    }

    /// Number of frames read so far
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<FrameRead, CaptureError> {
        let mut buffer = vec![0u8; self.frame_size];

        match self.stdout.read_exact(&mut buffer) {
            Ok(()) => {
                self.frames_read += 1;
                Ok(FrameRead::Frame(buffer))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(FrameRead::Ended),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(FrameRead::Pending)
            }
            Err(e) => Err(CaptureError::Read(format!("{}: {}", self.url, e))),
        }
    }

    fn abort_handle(&self) -> Arc<dyn SourceAbort> {
        Arc::new(ProcessAbort {
            process: self.process.clone(),
        })
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let mut process = self.process.lock();
        let _ = process.kill();
        let _ = process.wait();
        tracing::debug!("Decoder for {} released after {} frames", self.url, self.frames_read);
    }
}
