//! Capture worker
//!
//! One OS thread per stream pulls frames from its source, normalises their
//! color layout and feeds the paired encoder until told to stop or until the
//! pipeline fails.

use super::frame::convert;
use super::traits::{FrameRead, FrameSource, SourceAbort};
use crate::encoder::{EncoderError, SegmentEncoder};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Pause before retrying after a transient miss
const PENDING_BACKOFF: Duration = Duration::from_millis(10);

/// Why a worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on request
    Stopped,
    /// The source dropped or ended after capture had started
    SourceUnavailable(String),
    /// The transcoder exited mid-stream
    EncoderDead(String),
    /// The capture thread panicked
    Panicked,
}

impl WorkerExit {
    /// Whether the worker ended because of a failure rather than a request
    pub fn is_failure(&self) -> bool {
        !matches!(self, WorkerExit::Stopped)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Stopped => f.write_str("stopped"),
            WorkerExit::SourceUnavailable(reason) => write!(f, "source unavailable: {}", reason),
            WorkerExit::EncoderDead(reason) => write!(f, "encoder dead: {}", reason),
            WorkerExit::Panicked => f.write_str("capture thread panicked"),
        }
    }
}

/// Clears the running flag however the thread ends
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cancellation and completion handle for a running capture worker
pub struct WorkerHandle {
    stream_id: String,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    abort: Arc<dyn SourceAbort>,
    done: Option<oneshot::Receiver<WorkerExit>>,
    exit: Option<WorkerExit>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Shared flag that is true while the capture thread runs
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to exit before its next read
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Interrupt a read that is blocking the loop
    pub fn force_release(&self) {
        self.abort.abort();
    }

    /// Wait up to `timeout` for the worker to finish.
    ///
    /// Returns `None` if it is still running at the deadline.
    pub async fn wait(&mut self, timeout: Duration) -> Option<WorkerExit> {
        if let Some(exit) = &self.exit {
            return Some(exit.clone());
        }

        let done = self.done.as_mut()?;
        let exit = match tokio::time::timeout(timeout, done).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(_)) => WorkerExit::Panicked,
            Err(_) => return None,
        };
        self.finish(exit.clone());
        Some(exit)
    }

    /// Collect the exit of a worker that already finished, without waiting
    pub fn try_exit(&mut self) -> Option<WorkerExit> {
        if let Some(exit) = &self.exit {
            return Some(exit.clone());
        }

        let done = self.done.as_mut()?;
        let exit = match done.try_recv() {
            Ok(exit) => exit,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => WorkerExit::Panicked,
        };
        self.finish(exit.clone());
        Some(exit)
    }

    fn finish(&mut self, exit: WorkerExit) {
        self.done = None;
        self.exit = Some(exit);
        // The thread sends its exit as its last action, so this join is immediate
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Start capturing `source` into `encoder` on a dedicated thread
pub fn spawn_worker(
    stream_id: &str,
    source: Box<dyn FrameSource>,
    encoder: Arc<SegmentEncoder>,
) -> std::io::Result<WorkerHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let running = Arc::new(AtomicBool::new(true));
    let abort = source.abort_handle();
    let (done_tx, done_rx) = oneshot::channel();

    let id = stream_id.to_string();
    let thread_stop = stop.clone();
    let thread_running = running.clone();

    let thread = std::thread::Builder::new()
        .name(format!("capture-{}", stream_id))
        .spawn(move || {
            let _running = RunningGuard(thread_running);
            let mut source = source;

            let exit = capture_loop(&id, source.as_mut(), &encoder, &thread_stop);
            drop(source);

            if exit.is_failure() {
                tracing::error!("Stream {} terminated: {}", id, exit);
                // Release the transcoder now; nobody else will feed it
                if let Err(e) = encoder.close() {
                    tracing::warn!("Closing encoder of failed stream {}: {}", id, e);
                }
            }

            let _ = done_tx.send(exit);
        });

    let thread = match thread {
        Ok(thread) => thread,
        Err(e) => {
            running.store(false, Ordering::SeqCst);
            return Err(e);
        }
    };

    Ok(WorkerHandle {
        stream_id: stream_id.to_string(),
        stop,
        running,
        abort,
        done: Some(done_rx),
        exit: None,
        thread: Some(thread),
    })
}

fn capture_loop(
    stream_id: &str,
    source: &mut dyn FrameSource,
    encoder: &SegmentEncoder,
    stop: &AtomicBool,
) -> WorkerExit {
    let source_format = source.info().pixel_format;
    let target_format = encoder.settings().pixel_format;
    let started = Instant::now();
    let mut frames: u64 = 0;
    let mut misses: u64 = 0;

    tracing::info!(
        "Capture started for {} ({} -> {})",
        stream_id,
        source_format,
        target_format
    );

    let exit = loop {
        if stop.load(Ordering::SeqCst) {
            break WorkerExit::Stopped;
        }

        let frame = match source.read_frame() {
            Ok(FrameRead::Frame(frame)) => frame,
            Ok(FrameRead::Pending) => {
                misses += 1;
                tracing::debug!("Failed to read frame {}", stream_id);
                std::thread::sleep(PENDING_BACKOFF);
                continue;
            }
            Ok(FrameRead::Ended) => {
                if stop.load(Ordering::SeqCst) {
                    break WorkerExit::Stopped;
                }
                break WorkerExit::SourceUnavailable("end of stream".to_string());
            }
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break WorkerExit::Stopped;
                }
                break WorkerExit::SourceUnavailable(e.to_string());
            }
        };

        let frame = match convert(frame, source_format, target_format) {
            Ok(frame) => frame,
            Err(e) => break WorkerExit::SourceUnavailable(e.to_string()),
        };

        match encoder.submit(&frame) {
            Ok(_) => frames += 1,
            Err(EncoderError::Closed) if stop.load(Ordering::SeqCst) => break WorkerExit::Stopped,
            Err(EncoderError::FrameSize { expected, actual }) => {
                break WorkerExit::SourceUnavailable(format!(
                    "source delivered {} byte frames, encoder expects {}",
                    actual, expected
                ));
            }
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break WorkerExit::Stopped;
                }
                break WorkerExit::EncoderDead(e.to_string());
            }
        }
    };

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        "Capture for {} ended after {} frames in {:.1}s ({} misses): {}",
        stream_id,
        frames,
        elapsed,
        misses,
        exit
    );
    exit
}
