//! Live source capture
//!
//! This module provides the frame sources (ffmpeg-decoded network streams
//! and a synthetic test pattern) and the worker that pumps their frames
//! into a segment encoder.

pub mod frame;
pub mod source;
pub mod synthetic;
pub mod traits;
pub mod worker;

pub use frame::PixelFormat;
pub use source::{probe_source, FfmpegSource};
pub use synthetic::SyntheticSource;
pub use traits::{CaptureError, FrameRead, FrameSource, SourceAbort, SourceInfo};
pub use worker::{spawn_worker, WorkerExit, WorkerHandle};
