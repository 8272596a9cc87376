//! Configuration module
//!
//! Handles session tunables and record reader defaults

mod settings;

pub use settings::{AppConfig, ConfigError, P1BinConfig, SessionConfig};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "pointone", "p1link").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the configuration file path
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}
