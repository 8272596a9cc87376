//! Record offset index and its sidecar storage
//!
//! Sidecar file (`<stem>.p1i` next to the data file), little-endian:
//!
//! ```text
//! "P1IX" | u8 version | { u16 type | u64 offset | f64 capture time } * N | EOF marker
//! ```
//!
//! The EOF marker is an entry with type `0xFFFF`, the number of data bytes the
//! index covers in the offset field and a NaN time. An index without the
//! marker, or whose covered byte count differs from what the reader is about to
//! read, is stale.

use super::time_range::TimeRange;
use super::{P1BinError, P1BinType};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

const INDEX_MAGIC: &[u8; 4] = b"P1IX";
const INDEX_VERSION: u8 = 1;
const INDEX_EXTENSION: &str = "p1i";
const ENTRY_SIZE: usize = 2 + 8 + 8;
const EOF_MARKER_TYPE: u16 = 0xFFFF;

/// Location of one record in the data file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntry {
    /// Record type
    pub message_type: P1BinType,
    /// File offset of the entry
    pub offset: u64,
    /// Record capture timestamp
    pub capture_time: f64,
    /// Position within the complete (unfiltered) index
    pub message_index: usize,
}

/// Complete index over a data file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordIndex {
    /// Every record, in file order
    pub entries: Vec<IndexEntry>,
    /// Data bytes examined when the index was built
    pub covered_bytes: u64,
}

impl RecordIndex {
    /// Number of records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct record types present
    pub fn types(&self) -> BTreeSet<P1BinType> {
        self.entries.iter().map(|e| e.message_type).collect()
    }

    /// Entries matching the type and time filters
    pub fn filter(&self, types: Option<&BTreeSet<P1BinType>>, time_range: Option<&TimeRange>) -> Vec<IndexEntry> {
        filter_entries(&self.entries, types, time_range)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(INDEX_MAGIC.len() + 1 + (self.entries.len() + 1) * ENTRY_SIZE);
        out.put_slice(INDEX_MAGIC);
        out.put_u8(INDEX_VERSION);
        for entry in &self.entries {
            out.put_u16_le(entry.message_type.into());
            out.put_u64_le(entry.offset);
            out.put_f64_le(entry.capture_time);
        }
        out.put_u16_le(EOF_MARKER_TYPE);
        out.put_u64_le(self.covered_bytes);
        out.put_f64_le(f64::NAN);
        out.to_vec()
    }

    /// Decode a sidecar; `Ok(None)` when the EOF marker is missing
    fn decode(data: &[u8]) -> Result<Option<Self>, P1BinError> {
        let corrupt = |reason: &str| P1BinError::CorruptIndex(reason.to_string());

        let Some(body) = data.strip_prefix(INDEX_MAGIC.as_slice()) else {
            return Err(corrupt("bad magic"));
        };
        let Some((&version, mut body)) = body.split_first() else {
            return Err(corrupt("missing version"));
        };
        if version != INDEX_VERSION {
            return Err(P1BinError::CorruptIndex(format!("unsupported version {version}")));
        }
        if body.len() % ENTRY_SIZE != 0 {
            return Err(corrupt("truncated entry"));
        }

        let mut entries = Vec::with_capacity(body.len() / ENTRY_SIZE);
        while body.has_remaining() {
            let raw_type = body.get_u16_le();
            let offset = body.get_u64_le();
            let capture_time = body.get_f64_le();
            if raw_type == EOF_MARKER_TYPE && capture_time.is_nan() {
                if body.has_remaining() {
                    return Err(corrupt("data after EOF marker"));
                }
                return Ok(Some(Self { entries, covered_bytes: offset }));
            }
            let message_index = entries.len();
            entries.push(IndexEntry { message_type: P1BinType::from(raw_type), offset, capture_time, message_index });
        }
        Ok(None)
    }
}

/// Apply type and time filters to a list of entries
pub fn filter_entries(
    entries: &[IndexEntry],
    types: Option<&BTreeSet<P1BinType>>,
    time_range: Option<&TimeRange>,
) -> Vec<IndexEntry> {
    let typed: Vec<IndexEntry> = match types {
        Some(types) => entries.iter().filter(|e| types.contains(&e.message_type)).copied().collect(),
        None => entries.to_vec(),
    };
    match time_range {
        Some(range) => range.filter_entries(&typed),
        None => typed,
    }
}

/// Persistent storage for record indexes
pub trait RecordIndexStore {
    /// Load the index for `data_path`.
    ///
    /// Returns `Ok(None)` when there is no index or it is stale, i.e. it does
    /// not cover exactly `expected_bytes` of data.
    fn load(&self, data_path: &Path, expected_bytes: u64) -> Result<Option<RecordIndex>, P1BinError>;

    /// Persist an index covering `covered_bytes` of data
    fn save(&self, data_path: &Path, entries: &[IndexEntry], covered_bytes: u64) -> Result<(), P1BinError>;

    /// Delete any stored index
    fn remove(&self, data_path: &Path) -> Result<(), P1BinError>;
}

/// Index stored in a `.p1i` file next to the data file
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarIndexStore;

impl SidecarIndexStore {
    /// Sidecar path for a data file
    pub fn index_path(data_path: &Path) -> PathBuf {
        data_path.with_extension(INDEX_EXTENSION)
    }
}

impl RecordIndexStore for SidecarIndexStore {
    fn load(&self, data_path: &Path, expected_bytes: u64) -> Result<Option<RecordIndex>, P1BinError> {
        let path = Self::index_path(data_path);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No index file found @ '{}'.", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Loading index file '{}'.", path.display());
        match RecordIndex::decode(&data)? {
            None => {
                debug!("Index file has no EOF marker. Treating as stale.");
                Ok(None)
            }
            Some(index) if index.covered_bytes != expected_bytes => {
                debug!(
                    "Index file is stale. [covered={} B, expected={} B]",
                    index.covered_bytes, expected_bytes
                );
                Ok(None)
            }
            Some(index) => Ok(Some(index)),
        }
    }

    fn save(&self, data_path: &Path, entries: &[IndexEntry], covered_bytes: u64) -> Result<(), P1BinError> {
        let path = Self::index_path(data_path);
        let index = RecordIndex { entries: entries.to_vec(), covered_bytes };
        debug!("Saving index file as '{}'. [entries={}]", path.display(), entries.len());
        fs::write(path, index.encode())?;
        Ok(())
    }

    fn remove(&self, data_path: &Path) -> Result<(), P1BinError> {
        match fs::remove_file(Self::index_path(data_path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<IndexEntry> {
        [(P1BinType::Debug, 1, 10.0), (P1BinType::Rtcm3Polaris, 40, 10.5), (P1BinType::Debug, 80, 11.0)]
            .iter()
            .enumerate()
            .map(|(i, &(message_type, offset, capture_time))| IndexEntry {
                message_type,
                offset,
                capture_time,
                message_index: i,
            })
            .collect()
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            SidecarIndexStore::index_path(Path::new("/logs/input.p1bin")),
            PathBuf::from("/logs/input.p1i")
        );
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("input.p1bin");
        let store = SidecarIndexStore;

        assert!(store.load(&data_path, 120).unwrap().is_none());
        store.save(&data_path, &entries(), 120).unwrap();

        let index = store.load(&data_path, 120).unwrap().unwrap();
        assert_eq!(index.entries, entries());
        assert_eq!(index.covered_bytes, 120);

        // Different byte count: stale.
        assert!(store.load(&data_path, 119).unwrap().is_none());

        store.remove(&data_path).unwrap();
        store.remove(&data_path).unwrap();
        assert!(store.load(&data_path, 120).unwrap().is_none());
    }

    #[test]
    fn test_missing_eof_marker_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("input.p1bin");
        let encoded = RecordIndex { entries: entries(), covered_bytes: 120 }.encode();
        fs::write(SidecarIndexStore::index_path(&data_path), &encoded[..encoded.len() - ENTRY_SIZE]).unwrap();
        assert!(SidecarIndexStore.load(&data_path, 120).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_index() {
        assert!(matches!(RecordIndex::decode(b"NOPE\x01"), Err(P1BinError::CorruptIndex(_))));
        assert!(matches!(RecordIndex::decode(b"P1IX\x01\x00"), Err(P1BinError::CorruptIndex(_))));
    }

    #[test]
    fn test_filter() {
        let index = RecordIndex { entries: entries(), covered_bytes: 120 };
        let debug_only: BTreeSet<_> = [P1BinType::Debug].into_iter().collect();
        let offsets: Vec<u64> = index.filter(Some(&debug_only), None).iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 80]);

        let late = TimeRange::new(Some(0.75), None);
        let offsets: Vec<u64> = index.filter(Some(&debug_only), Some(&late)).iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![80]);
        assert_eq!(index.types().len(), 2);
    }
}
