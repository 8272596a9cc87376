//! Transport layer for device connections
//!
//! Supports:
//! - Serial ports, drained by a background reader thread
//! - TCP sockets, optionally with kernel receive timestamps
//! - WebSocket connections
//!
//! All variants share one blocking contract: [`Transport::read`] waits at most
//! `timeout` and returns whatever arrived (possibly nothing). A timeout is never
//! an error.

mod serial;
mod socket;
mod websocket;

pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialParity, SerialTransport};
pub use socket::{SocketConfig, SocketTransport};
pub use websocket::{ReadTimeout, WebSocketTransport};

use crate::core::capture::RxSink;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Default wait used by callers that have no better deadline
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for the next byte
pub const RX_BYTE_TIMEOUT: Duration = Duration::from_millis(100);
/// Hard cap on buffered-but-unread receive data
pub const MAX_DATA_BUFFER_SIZE: usize = 10 * 1024 * 1024;
/// Amount of oldest data dropped once the cap is exceeded
pub const DATA_BUFFER_DROP_SIZE: usize = 1024 * 1024;

/// Chunk size used when draining receive data
const FLUSH_CHUNK_SIZE: usize = 1024;

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// Serial port
    Serial,
    /// TCP socket
    Tcp,
    /// WebSocket
    WebSocket,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial"),
            Self::Tcp => write!(f, "TCP"),
            Self::WebSocket => write!(f, "WebSocket"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid configuration or address
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Used after `stop()`
    #[error("Not connected")]
    NotConnected,

    /// Remote end closed the connection
    #[error("Disconnected")]
    Disconnected,

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes handed to the caller by `read()` or discarded by `flush_rx()`
    pub bytes_received: u64,
    /// Bytes dropped because the receive buffer overflowed
    pub bytes_dropped: u64,
}

/// Blocking bidirectional byte transport
pub trait Transport: Send {
    /// Send all of `data`, blocking until it has been handed to the OS
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read up to `max_len` bytes, waiting at most `timeout`.
    ///
    /// Returns fewer bytes (possibly none) on timeout. With `return_any`, returns
    /// as soon as any data is available.
    fn read(&mut self, max_len: usize, timeout: Duration, return_any: bool) -> Result<Bytes, TransportError>;

    /// Discard everything received so far; returns the number of bytes dropped.
    ///
    /// Discarded bytes are still mirrored to the receive sink. Any byte read
    /// afterwards was received after this call.
    fn flush_rx(&mut self) -> Result<usize, TransportError> {
        let mut flushed = 0;
        loop {
            let data = self.read(FLUSH_CHUNK_SIZE, Duration::ZERO, true)?;
            if data.is_empty() {
                break;
            }
            flushed += data.len();
        }
        debug!("Flushing data in buffer. [size={} B]", flushed);
        Ok(flushed)
    }

    /// Release all resources. Calling more than once is a no-op.
    fn stop(&mut self) -> Result<(), TransportError>;

    /// Time the most recent data was received
    fn last_rx_time(&self) -> Option<DateTime<Utc>>;

    /// Get transport type
    fn transport_type(&self) -> TransportType;

    /// Get connection info string
    fn connection_info(&self) -> String;

    /// Get statistics
    fn stats(&self) -> TransportStats;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }

    fn read(&mut self, max_len: usize, timeout: Duration, return_any: bool) -> Result<Bytes, TransportError> {
        (**self).read(max_len, timeout, return_any)
    }

    fn flush_rx(&mut self) -> Result<usize, TransportError> {
        (**self).flush_rx()
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        (**self).stop()
    }

    fn last_rx_time(&self) -> Option<DateTime<Utc>> {
        (**self).last_rx_time()
    }

    fn transport_type(&self) -> TransportType {
        (**self).transport_type()
    }

    fn connection_info(&self) -> String {
        (**self).connection_info()
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }
}

/// Mirror received bytes into the optional sink.
///
/// A failing sink must not lose data for the caller, so errors are only logged.
pub(crate) fn mirror_rx(sink: &mut Option<Box<dyn RxSink>>, data: &[u8], timestamp: Option<DateTime<Utc>>) {
    if data.is_empty() {
        return;
    }
    if let Some(sink) = sink.as_mut() {
        let result = match timestamp {
            Some(ts) => sink.write_with_timestamp(data, ts),
            None => sink.write(data),
        };
        if let Err(e) = result {
            error!("Failed to write received data to capture sink: {}", e);
        }
    }
}

/// Connection address as accepted on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    /// `serial:///dev/ttyUSB0[:baud]`
    Serial {
        /// Device path
        port: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// `tcp://host[:port]`
    Tcp {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// `ws://host:port[/path]`
    WebSocket {
        /// Full URL
        url: String,
    },
}

impl TransportAddress {
    /// Baud rate used when a serial address does not name one
    pub const DEFAULT_BAUD_RATE: u32 = 460_800;
    /// Port used when a TCP address does not name one
    pub const DEFAULT_TCP_PORT: u16 = 30201;

    /// Open a transport for this address
    pub fn open(
        &self,
        config: &crate::config::SessionConfig,
        rx_sink: Option<Box<dyn RxSink>>,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let transport: Box<dyn Transport> = match self {
            Self::Serial { port, baud_rate } => {
                let serial = SerialConfig::new(port, *baud_rate)
                    .max_buffer_size(config.max_buffer_size)
                    .drop_size(config.buffer_drop_size);
                Box::new(SerialTransport::open(&serial, rx_sink)?)
            }
            Self::Tcp { host, port } => {
                let socket = SocketConfig::new(host, *port)
                    .buffer_size(config.socket_buffer_size)
                    .kernel_timestamps(config.socket_kernel_timestamps);
                Box::new(SocketTransport::connect(&socket, rx_sink)?)
            }
            Self::WebSocket { url } => Box::new(WebSocketTransport::connect(url, rx_sink)?),
        };
        Ok(transport)
    }
}

impl FromStr for TransportAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TransportError::InvalidConfiguration(format!("{reason}: '{s}'"));

        if let Some(rest) = s.strip_prefix("serial://") {
            // The device path keeps its leading `/`; an optional `:baud` follows.
            let (port, baud_rate) = match rest.rsplit_once(':') {
                Some((port, baud)) => (port, baud.parse().map_err(|_| invalid("Invalid baud rate"))?),
                None => (rest, Self::DEFAULT_BAUD_RATE),
            };
            if port.is_empty() {
                return Err(invalid("Missing serial device"));
            }
            Ok(Self::Serial { port: port.to_string(), baud_rate })
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().map_err(|_| invalid("Invalid TCP port"))?),
                None => (rest, Self::DEFAULT_TCP_PORT),
            };
            if host.is_empty() {
                return Err(invalid("Missing host"));
            }
            Ok(Self::Tcp { host: host.to_string(), port })
        } else if s.starts_with("ws://") || s.starts_with("wss://") {
            Ok(Self::WebSocket { url: s.to_string() })
        } else {
            Err(invalid("Unsupported address"))
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { port, baud_rate } => write!(f, "serial://{port}:{baud_rate}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::WebSocket { url } => write!(f, "{url}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            "serial:///dev/ttyUSB0:115200".parse::<TransportAddress>().unwrap(),
            TransportAddress::Serial { port: "/dev/ttyUSB0".into(), baud_rate: 115200 }
        );
        assert_eq!(
            "serial:///dev/ttyUSB0".parse::<TransportAddress>().unwrap(),
            TransportAddress::Serial { port: "/dev/ttyUSB0".into(), baud_rate: TransportAddress::DEFAULT_BAUD_RATE }
        );
        assert_eq!(
            "tcp://192.168.1.10".parse::<TransportAddress>().unwrap(),
            TransportAddress::Tcp { host: "192.168.1.10".into(), port: TransportAddress::DEFAULT_TCP_PORT }
        );
        assert_eq!(
            "tcp://localhost:1234".parse::<TransportAddress>().unwrap(),
            TransportAddress::Tcp { host: "localhost".into(), port: 1234 }
        );
        assert_eq!(
            "ws://device:8080/stream".parse::<TransportAddress>().unwrap(),
            TransportAddress::WebSocket { url: "ws://device:8080/stream".into() }
        );
    }

    #[test]
    fn test_parse_invalid_addresses() {
        assert!("udp://host:1".parse::<TransportAddress>().is_err());
        assert!("tcp://host:notaport".parse::<TransportAddress>().is_err());
        assert!("serial://:9600".parse::<TransportAddress>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let address = TransportAddress::Tcp { host: "localhost".into(), port: 1234 };
        assert_eq!(address.to_string().parse::<TransportAddress>().unwrap(), address);
    }
}
