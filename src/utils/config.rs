//! Environment configuration
//!
//! Every setting has a default, so an empty environment yields a working
//! local deployment.

use crate::encoder::HlsPreset;
use crate::utils::error::{AppError, AppResult};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration resolved from the process environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host the HTTP layer binds to
    pub host: String,

    /// Port the HTTP layer binds to
    pub port: u16,

    /// Log verbosity used when `RUST_LOG` is not set
    pub log_level: String,

    /// Persisted stream registry file
    pub registry_path: PathBuf,

    /// Root directory holding one sub-directory per stream
    pub stream_root: PathBuf,

    /// Codec path shared by every stream of this deployment
    pub preset: HlsPreset,

    /// ffmpeg executable
    pub ffmpeg_bin: PathBuf,

    /// ffprobe executable
    pub ffprobe_bin: PathBuf,

    /// How long removal waits for a worker before forcing release
    pub stop_timeout: Duration,

    /// Network read timeout handed to the source decoder
    pub source_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3597,
            log_level: "info".to_string(),
            registry_path: PathBuf::from("metadata").join("stream.json"),
            stream_root: PathBuf::from("stream"),
            preset: HlsPreset::Cpu,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            stop_timeout: Duration::from_secs(10),
            source_timeout: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match lookup("API_PORT") {
            Some(raw) => parse_value::<u16>("API_PORT", &raw)?,
            None => defaults.port,
        };

        let preset = match lookup("HLS_PRESET") {
            Some(raw) => raw.parse::<HlsPreset>().map_err(AppError::Config)?,
            None => defaults.preset,
        };

        let stop_timeout = match lookup("STOP_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_value::<u64>("STOP_TIMEOUT_SECS", &raw)?),
            None => defaults.stop_timeout,
        };

        let source_timeout = match lookup("SOURCE_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_value::<u64>("SOURCE_TIMEOUT_SECS", &raw)?),
            None => defaults.source_timeout,
        };

        Ok(Self {
            host: lookup("API_HOST").unwrap_or(defaults.host),
            port,
            log_level: lookup("LOGGING_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
            registry_path: lookup("REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            stream_root: lookup("STREAM_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.stream_root),
            preset,
            ffmpeg_bin: lookup("FFMPEG_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg_bin),
            ffprobe_bin: lookup("FFPROBE_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffprobe_bin),
            stop_timeout,
            source_timeout,
        })
    }

    /// Socket address string for the HTTP listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> AppResult<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| AppError::Config(format!("{} has invalid value '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:3597");
        assert_eq!(config.preset, HlsPreset::Cpu);
        assert_eq!(config.registry_path, PathBuf::from("metadata/stream.json"));
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("API_HOST", "0.0.0.0"),
            ("API_PORT", "8080"),
            ("LOGGING_LEVEL", "DEBUG"),
            ("HLS_PRESET", "gpu"),
            ("STOP_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.preset, HlsPreset::Gpu);
        assert_eq!(config.stop_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let result = AppConfig::from_lookup(lookup_from(&[("API_PORT", "not-a-port")]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_unknown_preset_is_rejected() {
        let result = AppConfig::from_lookup(lookup_from(&[("HLS_PRESET", "quantum")]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
