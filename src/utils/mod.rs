//! Shared utilities: configuration, error types and process helpers.

pub mod config;
pub mod error;
pub mod process;

pub use config::AppConfig;
pub use error::{AppError, AppResult, ErrorResponse};
