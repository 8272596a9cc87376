//! P1Bin record types and entry encoding
//!
//! Entry layout (all integers little-endian):
//!
//! ```text
//! u8  file entry header version (1)
//! u32 serialization time, seconds
//! u32 serialization time, fractional nanoseconds
//! u8  message header version (1: no pad, 2: one pad byte follows)
//! u16 message type
//! u32 payload size
//! u32 source identifier
//! ... payload
//! ```

use super::P1BinError;
use bytes::{BufMut, Bytes, BytesMut};
use regex::RegexBuilder;
use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, Read};
use tracing::warn;

/// Leading byte of every P1Bin file
pub const API_VERSION: u8 = 1;
/// Supported file entry header version
pub const FILE_ENTRY_HEADER_VERSION: u8 = 1;
/// Message header without padding
pub const MESSAGE_HEADER_VERSION_NO_PAD: u8 = 1;
/// Message header with a 1-byte pad after the version
pub const MESSAGE_HEADER_VERSION_PADDED: u8 = 2;

/// Fixed bytes before the payload for an unpadded entry
const ENTRY_HEADER_LENGTH: usize = 1 + 8 + 1 + 2 + 4 + 4;

/// Record payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum P1BinType {
    /// Debug output
    Debug,
    /// RTCM3 stream from the corrections service
    Rtcm3Polaris,
    /// Raw bytes from an external GNSS receiver
    ExternalUnframedGnss,
    /// Invalid / unset
    Invalid,
    /// Any other value
    Unknown(u16),
}

impl P1BinType {
    /// Every named type
    pub const KNOWN: [P1BinType; 4] = [Self::Invalid, Self::Debug, Self::Rtcm3Polaris, Self::ExternalUnframedGnss];

    /// Upper-case name
    pub fn name(&self) -> String {
        match self {
            Self::Debug => "DEBUG".to_string(),
            Self::Rtcm3Polaris => "RTCM3_POLARIS".to_string(),
            Self::ExternalUnframedGnss => "EXTERNAL_UNFRAMED_GNSS".to_string(),
            Self::Invalid => "INVALID".to_string(),
            Self::Unknown(value) => format!("UNKNOWN_{value}"),
        }
    }
}

impl From<u16> for P1BinType {
    fn from(value: u16) -> Self {
        match value {
            0x01 => Self::Debug,
            0x21 => Self::Rtcm3Polaris,
            0x42 => Self::ExternalUnframedGnss,
            0xFFFF => Self::Invalid,
            other => Self::Unknown(other),
        }
    }
}

impl From<P1BinType> for u16 {
    fn from(value: P1BinType) -> Self {
        match value {
            P1BinType::Debug => 0x01,
            P1BinType::Rtcm3Polaris => 0x21,
            P1BinType::ExternalUnframedGnss => 0x42,
            P1BinType::Invalid => 0xFFFF,
            P1BinType::Unknown(other) => other,
        }
    }
}

impl fmt::Display for P1BinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One container entry
#[derive(Debug, Clone, PartialEq)]
pub struct P1BinRecord {
    /// Host serialization time, unix seconds
    pub capture_timestamp: f64,
    /// Payload type
    pub message_type: P1BinType,
    /// Producer of the record
    pub source_identifier: u32,
    /// Opaque payload
    pub contents: Bytes,
}

impl P1BinRecord {
    /// Encode as a container entry
    pub fn encode(&self, message_header_version: u8) -> Vec<u8> {
        let seconds = self.capture_timestamp.max(0.0).floor();
        let nanos = ((self.capture_timestamp - seconds) * 1e9).round().min(999_999_999.0);

        let mut out = BytesMut::with_capacity(ENTRY_HEADER_LENGTH + 1 + self.contents.len());
        out.put_u8(FILE_ENTRY_HEADER_VERSION);
        out.put_u32_le(seconds.min(f64::from(u32::MAX)) as u32);
        out.put_u32_le(nanos.max(0.0) as u32);
        out.put_u8(message_header_version);
        if message_header_version == MESSAGE_HEADER_VERSION_PADDED {
            out.put_u8(0);
        }
        out.put_u16_le(self.message_type.into());
        out.put_u32_le(self.contents.len() as u32);
        out.put_u32_le(self.source_identifier);
        out.put_slice(&self.contents);
        out.to_vec()
    }
}

/// A record together with where it was found
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRecord {
    /// The record
    pub record: P1BinRecord,
    /// File offset of the entry
    pub offset: u64,
    /// 0-based position of the entry within the whole file
    pub message_index: usize,
}

/// Fill `buf` completely; `Ok(false)` if the stream ended first
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read one entry starting at `offset`.
///
/// Returns the record and its encoded length, or `None` if the stream ends
/// partway through (a truncated trailing entry is indistinguishable from EOF).
pub(crate) fn read_entry(reader: &mut impl Read, offset: u64) -> Result<Option<(P1BinRecord, u64)>, P1BinError> {
    let mut head = [0u8; 10];
    if !read_full(reader, &mut head)? {
        return Ok(None);
    }

    if head[0] != FILE_ENTRY_HEADER_VERSION {
        return Err(P1BinError::UnsupportedHeaderVersion { version: head[0], offset });
    }
    let seconds = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);
    let fraction_ns = u32::from_le_bytes([head[5], head[6], head[7], head[8]]);

    let pad = match head[9] {
        MESSAGE_HEADER_VERSION_NO_PAD => 0,
        MESSAGE_HEADER_VERSION_PADDED => 1,
        version => return Err(P1BinError::UnsupportedHeaderVersion { version, offset }),
    };

    let mut rest = [0u8; 11];
    let rest = &mut rest[..10 + pad];
    if !read_full(reader, rest)? {
        return Ok(None);
    }
    let rest = &rest[pad..];
    let message_type = P1BinType::from(u16::from_le_bytes([rest[0], rest[1]]));
    let payload_size = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
    let source_identifier = u32::from_le_bytes([rest[6], rest[7], rest[8], rest[9]]);

    // A corrupt size must not trigger a huge up-front allocation.
    let mut contents = Vec::new();
    reader.take(payload_size as u64).read_to_end(&mut contents)?;
    if contents.len() < payload_size {
        return Ok(None);
    }

    let record = P1BinRecord {
        capture_timestamp: f64::from(seconds) + f64::from(fraction_ns) * 1e-9,
        message_type,
        source_identifier,
        contents: Bytes::from(contents),
    };
    let length = (ENTRY_HEADER_LENGTH + pad + payload_size) as u64;
    Ok(Some((record, length)))
}

/// Resolve user type patterns to a set of types.
///
/// Each entry may hold several comma-separated patterns. A pattern is either a
/// number (decimal or `0x` hex) or a case-insensitive name pattern where `*`
/// matches anything. Name patterns first match against the start of each type
/// name, then anywhere within it. A pattern without `*` that matches more than
/// one type is an error; a pattern matching nothing is skipped with a warning.
pub fn find_matching_p1bin_types<S: AsRef<str>>(patterns: &[S]) -> Result<BTreeSet<P1BinType>, P1BinError> {
    let mut result = BTreeSet::new();

    let requested = patterns
        .iter()
        .flat_map(|entry| entry.as_ref().split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty());

    for pattern in requested {
        let numeric = match pattern.strip_prefix("0x").or_else(|| pattern.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16).ok(),
            None => pattern.parse::<u16>().ok(),
        };
        if let Some(value) = numeric {
            result.insert(P1BinType::from(value));
            continue;
        }

        let allow_multiple = pattern.contains('*');
        let body = pattern.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");
        let build = |re: String| {
            RegexBuilder::new(&re)
                .case_insensitive(true)
                .build()
                .map_err(|e| P1BinError::InvalidFilter(e.to_string()))
        };
        let prefix = build(format!("^(?:{body})"))?;
        let anywhere = build(body)?;

        let names = P1BinType::KNOWN.map(|t| (t, t.name()));
        let mut matched: Vec<P1BinType> =
            names.iter().filter(|(_, name)| prefix.is_match(name)).map(|(t, _)| *t).collect();
        if matched.is_empty() {
            matched = names.iter().filter(|(_, name)| anywhere.is_match(name)).map(|(t, _)| *t).collect();
        }

        if matched.is_empty() {
            warn!("No message types matching pattern '{}'.", pattern);
            continue;
        }
        if matched.len() > 1 && !allow_multiple {
            let listing: String = matched.iter().map(|t| format!("\n  {t}")).collect();
            return Err(P1BinError::InvalidFilter(format!(
                "Pattern '{pattern}' matches multiple message types:{listing}\n\nAdd a wildcard ({pattern}*) to display all matching types."
            )));
        }
        result.extend(matched);
    }

    Ok(result)
}
