//! # p1link Core Library
//!
//! Host-side link to a GNSS/INS receiver over serial, TCP or WebSocket, with support for:
//! - RTCM3 and NMEA-0183 framing from a multiplexed, corruption-prone byte stream
//! - Blocking reads with timeouts over every transport
//! - Capture of received data with timestamps
//! - P1Bin record files with filtering, an offset index and random access
//! - Command/response dialogues and reboot detection
//!
//! ## Example
//!
//! ```rust,no_run
//! use p1link_core::{DeviceSession, MessageId, SessionConfig, TransportAddress};
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::default();
//!     let address: TransportAddress = "tcp://192.168.0.10".parse()?;
//!     let transport = address.open(&config, None)?;
//!
//!     let mut session = DeviceSession::new(transport, config);
//!     session.send_nmea("PQTMVERNO")?;
//!     if let Some(response) = session.wait_for(&MessageId::nmea("PQTMVERNO"), Duration::from_secs(5))? {
//!         println!("{:?}", response.sentence());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{AppConfig, P1BinConfig, SessionConfig};
pub use crate::core::capture::{CaptureLog, RxSink, WriterSink};
pub use crate::core::p1bin::{
    find_matching_p1bin_types, P1BinError, P1BinReader, P1BinRecord, P1BinStream, P1BinType, P1BinWriter,
    ReaderOptions, RecordFilter, TimeRange,
};
pub use crate::core::protocol::{FrameOptions, FramedMessage, MessageId, NmeaFramer, Protocol, RtcmFramer};
pub use crate::core::session::{DeviceSession, SequenceTracker, SessionError};
pub use crate::core::transport::{Transport, TransportAddress, TransportError, TransportType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
