//! # Configuration Management
//!
//! Centralized configuration for picklers, unpicklers and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables (`PICKLE_CODEC_*`) via `from_env()`
//! - Direct instantiation with defaults and `default_with_overrides()`
//!
//! ## Security Considerations
//! - Unpicklers are secure by default: no global resolves unless allowed
//! - `max_preallocation` caps memory reserved from a declared container size
//! - `max_frame_size` bounds the bytes a stream decoder buffers for one value

use crate::error::{PickleError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::Level;

/// Protocol written when none is requested
pub const DEFAULT_PROTOCOL: u8 = 5;

/// Newest protocol understood by this codec
pub const HIGHEST_PROTOCOL: u8 = 5;

/// Oldest protocol understood by this codec
pub const LOWEST_PROTOCOL: u8 = 2;

/// Elements per chunk when a large container is split (protocol 5)
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Text and bytes at or below this length are never memoised
pub const MIN_TEXT_SIZE_FOR_REF: usize = crate::core::memo::MIN_SIZE_FOR_REF;

/// Upper bound on elements reserved up front from a declared container size
pub const MAX_PREALLOCATION: usize = 0xFFFF;

/// Max bytes a stream decoder buffers for one value (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Nesting limit for packing and unpacking. Both sides count a container
/// as one deeper than its deepest member, references included.
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// Largest accepted depth limit; decoded values are dropped recursively
const MAX_DEPTH_LIMIT: usize = 10_000;

/// Buffered output size that triggers a flush when packing to a writer
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CodecConfig {
    /// Encoding settings
    #[serde(default)]
    pub pickler: PicklerConfig,

    /// Decoding settings
    #[serde(default)]
    pub unpickler: UnpicklerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl CodecConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| PickleError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| PickleError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| PickleError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(protocol) = env_parse::<u8>("PICKLE_CODEC_PROTOCOL") {
            config.pickler.protocol = protocol;
        }

        if let Some(track) = env_parse::<bool>("PICKLE_CODEC_TRACK_REFERENCES") {
            config.pickler.track_references = track;
        }

        if let Some(size) = env_parse::<usize>("PICKLE_CODEC_CHUNK_SIZE") {
            config.pickler.chunk_size = size;
        }

        if let Some(depth) = env_parse::<usize>("PICKLE_CODEC_MAX_DEPTH") {
            config.pickler.max_depth = depth;
            config.unpickler.max_depth = depth;
        }

        if let Some(secure) = env_parse::<bool>("PICKLE_CODEC_SECURE") {
            config.unpickler.secure = secure;
        }

        if let Some(size) = env_parse::<usize>("PICKLE_CODEC_MAX_FRAME_SIZE") {
            config.unpickler.max_frame_size = size;
        }

        if let Ok(level) = std::env::var("PICKLE_CODEC_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| PickleError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PickleError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| PickleError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.pickler.validate());
        errors.extend(self.unpickler.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PickleError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn check_protocol(errors: &mut Vec<String>, field: &str, protocol: u8) {
    if !(LOWEST_PROTOCOL..=HIGHEST_PROTOCOL).contains(&protocol) {
        errors.push(format!(
            "Invalid {field}: {protocol} (supported: {LOWEST_PROTOCOL}-{HIGHEST_PROTOCOL})"
        ));
    }
}

fn check_depth(errors: &mut Vec<String>, max_depth: usize) {
    if max_depth == 0 {
        errors.push("Max depth must be greater than 0".to_string());
    } else if max_depth > MAX_DEPTH_LIMIT {
        errors.push(format!(
            "Max depth too large: {max_depth} (maximum recommended: {MAX_DEPTH_LIMIT})"
        ));
    }
}

/// Encoding configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PicklerConfig {
    /// Protocol version written at the start of every value
    pub protocol: u8,

    /// Emit memo references for shared and cyclic values
    pub track_references: bool,

    /// Max elements per chunk for large containers (protocol 5)
    pub chunk_size: usize,

    /// Max nesting depth of a packed value
    pub max_depth: usize,

    /// Buffered bytes that trigger a flush when packing to a writer
    pub flush_threshold: usize,
}

impl Default for PicklerConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL,
            track_references: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl PicklerConfig {
    /// Validate pickler configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        check_protocol(&mut errors, "protocol", self.protocol);
        check_depth(&mut errors, self.max_depth);

        if self.chunk_size == 0 {
            errors.push("Chunk size must be greater than 0".to_string());
        } else if self.chunk_size > u32::MAX as usize {
            errors.push(format!("Chunk size too large: {}", self.chunk_size));
        }

        if self.flush_threshold == 0 {
            errors.push("Flush threshold must be greater than 0".to_string());
        }

        errors
    }
}

/// Decoding configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UnpicklerConfig {
    /// Enforce the security gate on every named global
    pub secure: bool,

    /// Protocol assumed when a value carries no version marker
    pub default_protocol: u8,

    /// Max nesting depth of a decoded value, counted through references
    pub max_depth: usize,

    /// Max elements reserved up front from a declared container size
    pub max_preallocation: usize,

    /// Max bytes buffered by the stream decoder for one value
    pub max_frame_size: usize,
}

impl Default for UnpicklerConfig {
    fn default() -> Self {
        Self {
            secure: true,
            default_protocol: DEFAULT_PROTOCOL,
            max_depth: DEFAULT_MAX_DEPTH,
            max_preallocation: MAX_PREALLOCATION,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl UnpicklerConfig {
    /// Validate unpickler configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        check_protocol(&mut errors, "default protocol", self.default_protocol);
        check_depth(&mut errors, self.max_depth);

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        }

        if self.max_preallocation > self.max_frame_size {
            errors.push("Max preallocation cannot be larger than max frame size".to_string());
        }

        if !self.secure {
            errors.push(
                "WARNING: Security gate is disabled - never unpickle untrusted data".to_string(),
            );
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("pickle-codec"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
