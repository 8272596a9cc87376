//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::p1bin::P1BinError;
use crate::core::session::SessionError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// No response before the deadline
    pub const TIMEOUT: u8 = 4;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Device reported an error or sent something unexpected
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Unsupported or corrupt file contents
    pub const VALIDATION_FAILED: u8 = 17;

    /// Device did not go silent and come back after a reset
    pub const REBOOT_NOT_DETECTED: u8 = 18;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;

    /// Every defined code, in ascending order
    pub const ALL: [u8; 13] = [
        Self::SUCCESS,
        Self::ERROR,
        Self::INVALID_ARGS,
        Self::CONNECTION_FAILED,
        Self::TIMEOUT,
        Self::FILE_NOT_FOUND,
        Self::PERMISSION_DENIED,
        Self::CONFIG_ERROR,
        Self::PROTOCOL_ERROR,
        Self::PORT_NOT_FOUND,
        Self::VALIDATION_FAILED,
        Self::REBOOT_NOT_DETECTED,
        Self::INTERNAL_ERROR,
    ];
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Success without a message
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Timed out waiting for the device
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::TIMEOUT, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Classify an error chain from the command-line tool
    pub fn from_error(err: &anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(|cause| {
                if let Some(e) = cause.downcast_ref::<TransportError>() {
                    Some(transport_code(e))
                } else if let Some(e) = cause.downcast_ref::<SessionError>() {
                    Some(match e {
                        SessionError::Transport(e) => transport_code(e),
                        SessionError::Encode(_) => ExitCodes::INVALID_ARGS,
                    })
                } else if let Some(e) = cause.downcast_ref::<P1BinError>() {
                    Some(match e {
                        P1BinError::Io(e) => io_code(e),
                        P1BinError::UnsupportedApiVersion(_)
                        | P1BinError::UnsupportedHeaderVersion { .. }
                        | P1BinError::CorruptIndex(_) => ExitCodes::VALIDATION_FAILED,
                        P1BinError::InvalidFilter(_) | P1BinError::InvalidMessageIndex { .. } => {
                            ExitCodes::INVALID_ARGS
                        }
                        P1BinError::IndexRequired | P1BinError::IndexInProgress => ExitCodes::ERROR,
                    })
                } else if cause.downcast_ref::<ConfigError>().is_some() {
                    Some(ExitCodes::CONFIG_ERROR)
                } else {
                    cause.downcast_ref::<std::io::Error>().map(io_code)
                }
            })
            .unwrap_or(ExitCodes::ERROR);
        Self::Error(code, format!("{err:#}"))
    }
}

fn io_code(err: &std::io::Error) -> u8 {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
        ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
        ErrorKind::ConnectionRefused => ExitCodes::CONNECTION_FAILED,
        ErrorKind::TimedOut => ExitCodes::TIMEOUT,
        _ => ExitCodes::ERROR,
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::ConnectionFailed(_) | TransportError::NotConnected | TransportError::Disconnected => {
            ExitCodes::CONNECTION_FAILED
        }
        TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
        TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
        TransportError::InvalidConfiguration(_) => ExitCodes::INVALID_ARGS,
        TransportError::IoError(e) => io_code(e),
        TransportError::WebSocket(_) => ExitCodes::PROTOCOL_ERROR,
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        Self::Error(io_code(&err), err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Timed out waiting for the device",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        14 => "Port not found",
        17 => "Unsupported or corrupt data",
        18 => "Reboot not detected",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let result = CliResult::from(err);
        assert_eq!(result.code(), ExitCodes::FILE_NOT_FOUND);
    }

    #[test]
    fn test_from_error_chain() {
        let err = anyhow::Error::new(P1BinError::UnsupportedApiVersion(3)).context("Reading input.p1bin");
        assert_eq!(CliResult::from_error(&err).code(), ExitCodes::VALIDATION_FAILED);

        let err = anyhow::Error::new(SessionError::Transport(TransportError::PortNotFound("/dev/ttyX".into())));
        assert_eq!(CliResult::from_error(&err).code(), ExitCodes::PORT_NOT_FOUND);

        let err = anyhow::anyhow!("something else");
        assert_eq!(CliResult::from_error(&err).code(), ExitCodes::ERROR);
    }

    #[test]
    fn test_every_code_is_described() {
        for code in ExitCodes::ALL {
            assert_ne!(exit_code_description(code), "Unknown error");
        }
    }
}
