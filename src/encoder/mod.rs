//! Segment encoder module
//!
//! Turns a stream of raw frames into a rolling HLS playlist on disk using an
//! external ffmpeg process.

pub mod ffmpeg;
pub mod types;

pub use ffmpeg::{SegmentEncoder, PLAYLIST_FILE};
pub use types::{EncoderError, EncoderSettings, HlsPreset, TimestampMode};
