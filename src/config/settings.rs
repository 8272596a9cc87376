//! Application and session settings

use crate::core::transport::{DATA_BUFFER_DROP_SIZE, MAX_DATA_BUFFER_SIZE, RESPONSE_TIMEOUT, RX_BYTE_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization failure
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// No platform configuration directory
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Device session tunables
    pub session: SessionConfig,
    /// Record file reader options
    pub p1bin: P1BinConfig,
}

impl AppConfig {
    /// Load config from the platform config directory; a missing file yields defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&config_path)
    }

    /// Save config to the platform config directory
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.save_to(&config_path)
    }

    /// Load config from an explicit path; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Device session settings. Durations are stored as seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default wait for a response
    pub response_timeout_secs: f64,
    /// Poll interval while waiting for data
    pub rx_byte_timeout_secs: f64,
    /// How long to wait for the device to go silent after a reset
    pub reboot_stop_timeout_secs: f64,
    /// Silence that counts as "device stopped"
    pub reboot_min_silence_secs: f64,
    /// How long to wait for traffic to resume after the silence
    pub reboot_resume_timeout_secs: f64,
    /// Serial receive buffer cap
    pub max_buffer_size: usize,
    /// Oldest bytes dropped when the cap is exceeded
    pub buffer_drop_size: usize,
    /// Requested OS socket buffer size
    pub socket_buffer_size: usize,
    /// Capture kernel receive timestamps on sockets
    pub socket_kernel_timestamps: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: RESPONSE_TIMEOUT.as_secs_f64(),
            rx_byte_timeout_secs: RX_BYTE_TIMEOUT.as_secs_f64(),
            reboot_stop_timeout_secs: 7.0,
            reboot_min_silence_secs: 1.0,
            reboot_resume_timeout_secs: 5.0,
            max_buffer_size: MAX_DATA_BUFFER_SIZE,
            buffer_drop_size: DATA_BUFFER_DROP_SIZE,
            socket_buffer_size: MAX_DATA_BUFFER_SIZE,
            socket_kernel_timestamps: true,
        }
    }
}

/// Negative or non-finite values clamp to zero
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl SessionConfig {
    /// Default response timeout
    pub fn response_timeout(&self) -> Duration {
        secs(self.response_timeout_secs)
    }

    /// Poll interval
    pub fn rx_byte_timeout(&self) -> Duration {
        secs(self.rx_byte_timeout_secs)
    }

    /// Reboot stop timeout
    pub fn reboot_stop_timeout(&self) -> Duration {
        secs(self.reboot_stop_timeout_secs)
    }

    /// Reboot minimum silence
    pub fn reboot_min_silence(&self) -> Duration {
        secs(self.reboot_min_silence_secs)
    }

    /// Reboot resume timeout
    pub fn reboot_resume_timeout(&self) -> Duration {
        secs(self.reboot_resume_timeout_secs)
    }

    /// Set the response timeout
    #[must_use]
    pub fn response_timeout_secs(mut self, secs: f64) -> Self {
        self.response_timeout_secs = secs;
        self
    }

    /// Set the reboot timeouts
    #[must_use]
    pub fn reboot_timeouts(mut self, stop_secs: f64, min_silence_secs: f64, resume_secs: f64) -> Self {
        self.reboot_stop_timeout_secs = stop_secs;
        self.reboot_min_silence_secs = min_silence_secs;
        self.reboot_resume_timeout_secs = resume_secs;
        self
    }
}

/// Record file reader defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct P1BinConfig {
    /// Write a sidecar index after a full pass over a file
    pub generate_index: bool,
    /// Never load an existing sidecar index
    pub ignore_index: bool,
}

impl Default for P1BinConfig {
    fn default() -> Self {
        Self { generate_index: true, ignore_index: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
        assert_eq!(config.rx_byte_timeout(), Duration::from_millis(100));
        assert_eq!(config.reboot_stop_timeout(), Duration::from_secs(7));
        assert_eq!(config.reboot_min_silence(), Duration::from_secs(1));
        assert_eq!(config.reboot_resume_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_buffer_size, 10 * 1024 * 1024);
        assert_eq!(config.buffer_drop_size, 1024 * 1024);
    }

    #[test]
    fn test_negative_duration_clamps() {
        let config = SessionConfig::default().response_timeout_secs(-1.0);
        assert_eq!(config.response_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.session = config.session.reboot_timeouts(3.0, 0.5, 2.0);
        config.p1bin.ignore_index = true;
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nresponse_timeout_secs = 1.5\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.session.response_timeout(), Duration::from_millis(1500));
        assert_eq!(config.p1bin, P1BinConfig::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(AppConfig::load_from(&dir.path().join("absent.toml")).unwrap(), AppConfig::default());
    }
}
