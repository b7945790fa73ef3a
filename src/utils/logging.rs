//! Structured logging setup.
//!
//! The codec itself only emits `tracing` events; hosts that do not install
//! their own subscriber can call [`init_logging`] with a [`LoggingConfig`].

use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::fmt;

use crate::config::LoggingConfig;
use crate::error::{PickleError, Result};

/// Install a global `fmt` subscriber. Returns `Ok(false)` when another
/// subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let installed = if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            PickleError::ConfigError("log_file_path must be set when log_to_file is true".into())
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| PickleError::ConfigError(format!("Failed to open log file: {e}")))?;
        let builder = fmt()
            .with_max_level(config.log_level)
            .with_ansi(false)
            .with_writer(Mutex::new(file));
        if config.json_format {
            builder.json().try_init().is_ok()
        } else {
            builder.try_init().is_ok()
        }
    } else {
        let builder = fmt().with_max_level(config.log_level).with_target(true);
        if config.json_format {
            builder.json().try_init().is_ok()
        } else {
            builder.try_init().is_ok()
        }
    };

    if installed {
        info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    Ok(installed)
}
