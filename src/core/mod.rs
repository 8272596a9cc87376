//! Core module containing the main functionality of p1link
//!
//! This module provides:
//! - Streaming framers for NMEA-0183 and RTCM3 (with the vendor 4050 message)
//! - Transport layer for serial, TCP and WebSocket connections
//! - Receive capture logs with a timestamp sidecar
//! - P1Bin record container reading, indexing and writing
//! - Device command/response sessions with reboot detection

pub mod capture;
pub mod p1bin;
pub mod protocol;
pub mod session;
pub mod transport;
