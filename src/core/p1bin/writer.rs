//! P1Bin container writer

use super::types::{P1BinRecord, API_VERSION, MESSAGE_HEADER_VERSION_PADDED};
use std::io::{self, Write};

/// Writes the API version byte followed by records
pub struct P1BinWriter<W: Write> {
    inner: W,
    message_header_version: u8,
    records_written: usize,
}

impl<W: Write> P1BinWriter<W> {
    /// Start a new container
    pub fn new(mut inner: W) -> io::Result<Self> {
        inner.write_all(&[API_VERSION])?;
        Ok(Self { inner, message_header_version: MESSAGE_HEADER_VERSION_PADDED, records_written: 0 })
    }

    /// Message header version used for subsequent records
    #[must_use]
    pub fn message_header_version(mut self, version: u8) -> Self {
        self.message_header_version = version;
        self
    }

    /// Append a record, returning its encoded length
    pub fn write_record(&mut self, record: &P1BinRecord) -> io::Result<u64> {
        let encoded = record.encode(self.message_header_version);
        self.inner.write_all(&encoded)?;
        self.records_written += 1;
        Ok(encoded.len() as u64)
    }

    /// Records written so far
    pub fn records_written(&self) -> usize {
        self.records_written
    }

    /// Flush the underlying writer
    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Flush and return the underlying writer
    pub fn into_inner(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
