//! Receive-side capture
//!
//! Every transport can mirror the bytes it hands to the caller into an
//! [`RxSink`]. Two sinks are provided:
//! - [`WriterSink`] copies bytes to any [`Write`] implementation
//! - [`CaptureLog`] writes a data file plus an optional `.timestamps` sidecar
//!   mapping wall-clock time to data offsets

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// Suffix appended to the data file name for the timestamp sidecar
pub const TIMESTAMPS_SUFFIX: &str = ".timestamps";

/// Minimum spacing between two timestamp sidecar entries, in milliseconds
const TIMESTAMP_MIN_INTERVAL_MS: i64 = 1;

/// Append-only destination for received bytes
pub trait RxSink: Send {
    /// Record bytes received now
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Record bytes whose reception time is known (e.g. a kernel timestamp)
    fn write_with_timestamp(&mut self, data: &[u8], _timestamp: DateTime<Utc>) -> io::Result<()> {
        self.write(data)
    }

    /// Flush buffered output
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Mirrors received bytes into any writer
pub struct WriterSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    /// Wrap a writer
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Unwrap the writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> RxSink for WriterSink<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// One `{u32 milliseconds since start, u32 data offset}` sidecar entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampEntry {
    /// Milliseconds since the capture started, wrapping at 2^32
    pub elapsed_ms: u32,
    /// Data file offset after the write, wrapping at 2^32
    pub offset: u32,
}

impl TimestampEntry {
    /// Encoded size
    pub const SIZE: usize = 8;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.elapsed_ms.to_le_bytes());
        out[4..].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Parse a complete sidecar file; a trailing partial entry is ignored
    pub fn parse_all(data: &[u8]) -> Vec<Self> {
        data.chunks_exact(Self::SIZE)
            .map(|chunk| Self {
                elapsed_ms: u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                offset: u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            })
            .collect()
    }
}

/// Raw capture file with an optional timestamp sidecar
pub struct CaptureLog {
    path: PathBuf,
    data: BufWriter<File>,
    timestamps: Option<BufWriter<File>>,
    start_time: DateTime<Utc>,
    last_timestamp: DateTime<Utc>,
    bytes_written: u64,
}

impl CaptureLog {
    /// Create (truncate) `path` and, if requested, `<path>.timestamps`
    pub fn create(path: impl AsRef<Path>, log_timestamps: bool) -> io::Result<Self> {
        Self::create_at(path, log_timestamps, Utc::now())
    }

    fn create_at(path: impl AsRef<Path>, log_timestamps: bool, start_time: DateTime<Utc>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening capture file '{}'.", path.display());
        let data = BufWriter::new(File::create(&path)?);

        let timestamps = if log_timestamps {
            let timestamp_path = Self::timestamps_path(&path);
            debug!("Opening timestamp file '{}'.", timestamp_path.display());
            Some(BufWriter::new(File::create(timestamp_path)?))
        } else {
            None
        };

        Ok(Self {
            path,
            data,
            timestamps,
            start_time,
            last_timestamp: start_time,
            bytes_written: 0,
        })
    }

    /// Sidecar path for a data file
    pub fn timestamps_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(TIMESTAMPS_SUFFIX);
        PathBuf::from(name)
    }

    /// Data file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written to the data file so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush both files
    pub fn close(mut self) -> io::Result<()> {
        RxSink::flush(&mut self)?;
        info!("Capture stored in '{}'. [size={} B]", self.path.display(), self.bytes_written);
        Ok(())
    }

    fn record(&mut self, data: &[u8], timestamp: DateTime<Utc>) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        trace!("Writing {} bytes.", data.len());
        self.data.write_all(data)?;
        self.bytes_written += data.len() as u64;

        if let Some(timestamps) = self.timestamps.as_mut() {
            if (timestamp - self.last_timestamp).num_milliseconds() >= TIMESTAMP_MIN_INTERVAL_MS {
                let elapsed = (timestamp - self.start_time).num_milliseconds();
                let entry = TimestampEntry {
                    elapsed_ms: elapsed.rem_euclid(1 << 32) as u32,
                    offset: (self.bytes_written % (1 << 32)) as u32,
                };
                timestamps.write_all(&entry.to_bytes())?;
                self.last_timestamp = timestamp;
            }
        }
        Ok(())
    }
}

impl RxSink for CaptureLog {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.record(data, Utc::now())
    }

    fn write_with_timestamp(&mut self, data: &[u8], timestamp: DateTime<Utc>) -> io::Result<()> {
        self.record(data, timestamp)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.data.flush()?;
        if let Some(timestamps) = self.timestamps.as_mut() {
            timestamps.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_writer_sink() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write(b"abc").unwrap();
        sink.write_with_timestamp(b"def", Utc::now()).unwrap();
        assert_eq!(sink.into_inner(), b"abcdef");
    }

    #[test]
    fn test_capture_log_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.raw");
        let start = Utc::now();

        let mut log = CaptureLog::create_at(&path, true, start).unwrap();
        // Same instant as the start: no sidecar entry.
        log.write_with_timestamp(b"0123", start).unwrap();
        log.write_with_timestamp(b"4567", start + Duration::milliseconds(10)).unwrap();
        // Less than a millisecond after the previous entry.
        log.write_with_timestamp(b"89", start + Duration::microseconds(10_500)).unwrap();
        log.write_with_timestamp(b"ab", start + Duration::milliseconds(25)).unwrap();
        assert_eq!(log.bytes_written(), 12);
        log.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789ab");
        let entries = TimestampEntry::parse_all(&std::fs::read(CaptureLog::timestamps_path(&path)).unwrap());
        assert_eq!(
            entries,
            vec![
                TimestampEntry { elapsed_ms: 10, offset: 8 },
                TimestampEntry { elapsed_ms: 25, offset: 12 },
            ]
        );
    }

    #[test]
    fn test_capture_log_without_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.raw");
        let mut log = CaptureLog::create(&path, false).unwrap();
        log.write(b"data").unwrap();
        log.close().unwrap();
        assert!(!CaptureLog::timestamps_path(&path).exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }
}
