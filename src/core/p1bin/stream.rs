//! Continuous byte view over the payloads of one record type

use super::reader::{P1BinReader, ReaderOptions};
use super::types::P1BinType;
use super::P1BinError;
use bytes::{Buf, Bytes};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

fn io_error(e: P1BinError) -> io::Error {
    match e {
        P1BinError::Io(e) => e,
        other => io::Error::other(other),
    }
}

/// Payloads of one [`P1BinType`] read as if they were a single file.
///
/// Construction reads the file once to size every payload, which also
/// guarantees an index for seeking.
pub struct P1BinStream {
    reader: P1BinReader,
    message_type: P1BinType,
    /// Stream offset at which each record's payload starts
    payload_offsets: Vec<u64>,
    total_size: u64,
    position: u64,
    current: Bytes,
}

impl P1BinStream {
    /// Open a stream over `message_type` records in `path`
    pub fn open(path: impl AsRef<Path>, message_type: P1BinType, ignore_index: bool) -> Result<Self, P1BinError> {
        let options = ReaderOptions::default().message_types([message_type]).ignore_index(ignore_index);
        let mut reader = P1BinReader::open(path, options)?;

        let mut payload_offsets = Vec::new();
        let mut total_size = 0u64;
        while let Some(read) = reader.read_next()? {
            payload_offsets.push(total_size);
            total_size += read.record.contents.len() as u64;
        }
        reader.rewind()?;

        Ok(Self { reader, message_type, payload_offsets, total_size, position: 0, current: Bytes::new() })
    }

    /// Record type being streamed
    pub fn message_type(&self) -> P1BinType {
        self.message_type
    }

    /// Total payload bytes
    pub fn len(&self) -> u64 {
        self.total_size
    }

    /// No payload bytes
    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }
}

impl Read for P1BinStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.current.is_empty() {
                if self.reader.reached_eof() {
                    break;
                }
                match self.reader.read_next().map_err(io_error)? {
                    Some(read) => self.current = read.record.contents,
                    None => break,
                }
                continue;
            }

            let n = self.current.len().min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&self.current[..n]);
            self.current.advance(n);
            written += n;
            self.position += n as u64;
        }
        Ok(written)
    }
}

impl Seek for P1BinStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.total_size.checked_add_signed(delta),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Seek before start of stream"))?;

        self.current = Bytes::new();
        self.position = target;

        if target >= self.total_size {
            self.reader.seek_to_eof().map_err(io_error)?;
            return Ok(target);
        }

        // Zero-length payloads share a start offset; take the last record starting at or before the target.
        let idx = self.payload_offsets.partition_point(|&offset| offset <= target) - 1;
        self.reader.seek_to_message(idx, true).map_err(io_error)?;
        let extra = (target - self.payload_offsets[idx]) as usize;
        if extra != 0 {
            if let Some(read) = self.reader.read_next().map_err(io_error)? {
                self.current = read.record.contents.slice(extra..);
            }
        }
        Ok(target)
    }
}
