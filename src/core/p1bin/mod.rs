//! P1Bin record container
//!
//! Provides:
//! - Record types and entry encoding
//! - Filtered, seekable reading with a cached offset index
//! - A continuous byte view over the payloads of one record type
//! - A container writer

mod index;
mod reader;
mod stream;
mod time_range;
mod types;
mod writer;

pub use index::{filter_entries, IndexEntry, RecordIndex, RecordIndexStore, SidecarIndexStore};
pub use reader::{P1BinReader, ReaderOptions, RecordFilter};
pub use stream::P1BinStream;
pub use time_range::TimeRange;
pub use types::{
    find_matching_p1bin_types, P1BinRecord, P1BinType, ReadRecord, API_VERSION, FILE_ENTRY_HEADER_VERSION,
    MESSAGE_HEADER_VERSION_NO_PAD, MESSAGE_HEADER_VERSION_PADDED,
};
pub use writer::P1BinWriter;

use thiserror::Error;

/// P1Bin errors
#[derive(Error, Debug)]
pub enum P1BinError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File starts with an API version this reader cannot parse
    #[error("Unsupported P1Bin api_version: {0}")]
    UnsupportedApiVersion(u8),

    /// Entry or message header version not recognized
    #[error("Unsupported record header version {version} at offset {offset}")]
    UnsupportedHeaderVersion {
        /// Version byte found
        version: u8,
        /// Entry offset
        offset: u64,
    },

    /// Operation needs an index
    #[error("A file index is required to seek by message index")]
    IndexRequired,

    /// Message index out of range
    #[error("Invalid message index {index} (max {max})")]
    InvalidMessageIndex {
        /// Requested index
        index: usize,
        /// Number of messages available
        max: usize,
    },

    /// Operation not allowed while the index is being built
    #[error("Cannot jump to EOF while building an index file")]
    IndexInProgress,

    /// Bad filter or type pattern
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Index file could not be decoded
    #[error("Corrupt index file: {0}")]
    CorruptIndex(String),
}
