//! Protocol implementations
//!
//! Provides streaming framers and helpers for the receiver's wire formats:
//! - NMEA-0183 ASCII sentences
//! - RTCM3 binary frames (including the vendor 4050 message)
//! - Checksum algorithms (NMEA XOR, CRC-24Q)

pub mod checksum;
pub mod nmea;
pub mod rtcm;

pub use checksum::{crc24q, encode_nmea, nmea_checksum, nmea_sentence_checksum};
pub use nmea::NmeaFramer;
pub use rtcm::{
    encode_rtcm_frame, message_number, reset_mask, FrameOptions, Po4050, Po4050Control, Po4050DiagType, RtcmError,
    RtcmFramer, RtcmPayload, PO4050_MESSAGE_ID, PO4050_RESPONSE_ERROR, PO4050_RESPONSE_OK, RTCM3_PREAMBLE,
};

use bytes::Bytes;
use std::fmt;

/// Wire protocol a framed message was recovered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// NMEA-0183 sentence
    Nmea,
    /// RTCM3 frame
    Rtcm3,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nmea => write!(f, "NMEA"),
            Self::Rtcm3 => write!(f, "RTCM3"),
        }
    }
}

/// Protocol-specific message type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// NMEA talker + sentence ID, without the leading `$` (e.g. `GPGGA`)
    Nmea(String),
    /// 12-bit RTCM message number
    Rtcm(u16),
}

impl MessageId {
    /// Protocol this ID belongs to
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Nmea(_) => Protocol::Nmea,
            Self::Rtcm(_) => Protocol::Rtcm3,
        }
    }

    /// NMEA ID from a user-supplied string, tolerating a leading `$`
    pub fn nmea(id: &str) -> Self {
        Self::Nmea(id.strip_prefix('$').unwrap_or(id).to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nmea(id) => write!(f, "{id}"),
            Self::Rtcm(id) => write!(f, "{id}"),
        }
    }
}

/// A complete message that passed checksum/CRC validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    /// Message type
    pub type_id: MessageId,
    /// NMEA: the full sentence as received, `$` through `\n`.
    /// RTCM: the payload between the 3-byte header and the CRC.
    pub payload: Bytes,
    /// Offset of the first byte of the message within the stream, if requested
    pub byte_offset: Option<u64>,
    /// Number of stream bytes the message occupies
    pub byte_length: usize,
    /// Full frame bytes (header, payload and CRC), if requested. RTCM only.
    pub raw: Option<Bytes>,
}

impl FramedMessage {
    /// Protocol the message was framed from
    pub fn protocol(&self) -> Protocol {
        self.type_id.protocol()
    }

    /// NMEA sentence as text with trailing line terminators removed
    pub fn sentence(&self) -> Option<&str> {
        match self.type_id {
            MessageId::Nmea(_) => std::str::from_utf8(&self.payload)
                .ok()
                .map(|s| s.trim_end_matches(['\r', '\n'])),
            MessageId::Rtcm(_) => None,
        }
    }
}
