//! Stream lifecycle supervision
//!
//! Starts, stops and tracks one capture pipeline per registered stream.

pub mod backend;
pub mod manager;
pub mod state;

pub use backend::{FfmpegBackend, PipelineBackend};
pub use manager::{StreamSupervisor, SupervisorOptions};
pub use state::{
    validate_stream_id, BootstrapReport, ShutdownReport, StreamError, StreamListing, StreamState,
};
