//! Filtered, seekable P1Bin reader
//!
//! Reads entries sequentially from the data file, or through a record index
//! when one is available. Without an index the reader builds one while it
//! reads; at EOF the index is persisted and the reader switches to
//! index-driven mode for the rest of the session.

use super::index::{IndexEntry, RecordIndex, RecordIndexStore, SidecarIndexStore};
use super::time_range::TimeRange;
use super::types::{read_entry, P1BinRecord, P1BinType, ReadRecord, API_VERSION};
use super::P1BinError;
use crate::config::P1BinConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace, warn};

/// Progress is logged each time this many bytes have been processed
const PROGRESS_INTERVAL_BYTES: u64 = 10_000_000;

/// Reader construction options
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderOptions {
    /// Only return these types; `None` returns everything
    pub message_types: Option<BTreeSet<P1BinType>>,
    /// Only return records in this relative window
    pub time_range: Option<TimeRange>,
    /// Build and persist an index if none is available
    pub generate_index: bool,
    /// Never use an existing index
    pub ignore_index: bool,
    /// Stop after this many bytes of the file
    pub max_bytes: Option<u64>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self { message_types: None, time_range: None, generate_index: true, ignore_index: false, max_bytes: None }
    }
}

impl From<&P1BinConfig> for ReaderOptions {
    fn from(config: &P1BinConfig) -> Self {
        Self { generate_index: config.generate_index, ignore_index: config.ignore_index, ..Self::default() }
    }
}

impl ReaderOptions {
    /// Restrict to these types. An empty set means no restriction.
    #[must_use]
    pub fn message_types(mut self, types: impl IntoIterator<Item = P1BinType>) -> Self {
        let types: BTreeSet<P1BinType> = types.into_iter().collect();
        self.message_types = (!types.is_empty()).then_some(types);
        self
    }

    /// Restrict to a relative time window
    #[must_use]
    pub fn time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Set index generation
    #[must_use]
    pub fn generate_index(mut self, generate: bool) -> Self {
        self.generate_index = generate;
        self
    }

    /// Set whether an existing index is ignored
    #[must_use]
    pub fn ignore_index(mut self, ignore: bool) -> Self {
        self.ignore_index = ignore;
        self
    }

    /// Limit the number of bytes read
    #[must_use]
    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

/// Criteria accepted by [`P1BinReader::filter_in_place`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordFilter {
    /// Keep only these types
    Types(BTreeSet<P1BinType>),
    /// Keep records within a relative time window
    TimeRange(TimeRange),
    /// Keep a slice of the current view by position (index mode only)
    MessageRange(Range<usize>),
}

/// Sequential reader over a P1Bin file
pub struct P1BinReader<S: RecordIndexStore = SidecarIndexStore> {
    path: PathBuf,
    file: BufReader<File>,
    store: S,
    file_size: u64,
    max_bytes: u64,

    original_types: Option<BTreeSet<P1BinType>>,
    original_time_range: Option<TimeRange>,
    message_types: Option<BTreeSet<P1BinType>>,
    time_range: Option<TimeRange>,

    full_index: Option<RecordIndex>,
    view: Option<Vec<IndexEntry>>,
    next_index_elem: usize,
    builder: Option<Vec<IndexEntry>>,

    message_counts: BTreeMap<P1BinType, usize>,
    total_bytes_read: u64,
    last_progress_bytes: u64,
    current_message_index: usize,
    eof: bool,
}

impl P1BinReader<SidecarIndexStore> {
    /// Open a file using the sidecar index store
    pub fn open(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self, P1BinError> {
        Self::with_store(path, options, SidecarIndexStore)
    }

    /// Read a file end to end so that its sidecar index exists.
    ///
    /// Returns the number of records in the index.
    pub fn generate_index_file(path: impl AsRef<Path>, ignore_index: bool) -> Result<usize, P1BinError> {
        let mut reader =
            Self::open(path, ReaderOptions::default().generate_index(true).ignore_index(ignore_index))?;
        if !reader.have_index() {
            while reader.read_next()?.is_some() {}
        }
        Ok(reader.index().map_or(0, RecordIndex::len))
    }
}

impl<S: RecordIndexStore> P1BinReader<S> {
    /// Open a file with an explicit index store
    pub fn with_store(path: impl AsRef<Path>, options: ReaderOptions, store: S) -> Result<Self, P1BinError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        let mut generate_index = options.generate_index;
        let max_bytes = match options.max_bytes {
            Some(max_bytes) => {
                if generate_index {
                    debug!("Max bytes specified. Disabling index generation.");
                    generate_index = false;
                }
                max_bytes
            }
            None => u64::MAX,
        };

        let mut full_index = None;
        if options.ignore_index {
            if generate_index {
                debug!("Deleting/regenerating index file for '{}'.", path.display());
                store.remove(&path)?;
            } else {
                debug!("Ignoring index file for '{}'.", path.display());
            }
        } else {
            match store.load(&path, file_size.min(max_bytes)) {
                Ok(index) => full_index = index,
                Err(P1BinError::CorruptIndex(reason)) => {
                    error!("Error loading index file: {}", reason);
                    if generate_index {
                        store.remove(&path)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let view = full_index
            .as_ref()
            .map(|index: &RecordIndex| index.filter(options.message_types.as_ref(), options.time_range.as_ref()));

        let builder = match (&full_index, generate_index) {
            (None, true) => {
                debug!("Generating index file for '{}'.", path.display());
                Some(Vec::new())
            }
            _ => None,
        };

        let mut reader = Self {
            path,
            file: BufReader::new(file),
            store,
            file_size,
            max_bytes,
            message_types: options.message_types.clone(),
            time_range: options.time_range.clone(),
            original_types: options.message_types,
            original_time_range: options.time_range,
            full_index,
            view,
            next_index_elem: 0,
            builder,
            message_counts: BTreeMap::new(),
            total_bytes_read: 0,
            last_progress_bytes: 0,
            current_message_index: 0,
            eof: false,
        };
        reader.rewind()?;
        Ok(reader)
    }

    /// Return to the first record
    pub fn rewind(&mut self) -> Result<(), P1BinError> {
        debug!("Rewinding to the start of the file.");

        if let Some(range) = &mut self.time_range {
            range.restart();
        }
        if let Some(range) = &mut self.original_time_range {
            range.restart();
        }

        self.message_counts.clear();
        self.next_index_elem = 0;
        self.current_message_index = 0;
        self.last_progress_bytes = 0;
        self.eof = false;

        self.file.seek(SeekFrom::Start(0))?;
        if self.file_size > 0 {
            let mut version = [0u8; 1];
            self.file.read_exact(&mut version)?;
            if version[0] != API_VERSION {
                return Err(P1BinError::UnsupportedApiVersion(version[0]));
            }
        }
        self.total_bytes_read = self.file_size.min(1);

        if let Some(builder) = &mut self.builder {
            builder.clear();
        }
        Ok(())
    }

    /// Read the next record matching the current filters; `None` at EOF
    pub fn read_next(&mut self) -> Result<Option<ReadRecord>, P1BinError> {
        if self.view.is_none() && self.eof {
            return Ok(None);
        }

        loop {
            if let Some(view) = &self.view {
                let Some(entry) = view.get(self.next_index_elem).copied() else {
                    debug!("EOF reached.");
                    break;
                };
                self.current_message_index = entry.message_index;
                self.next_index_elem += 1;
                self.file.seek(SeekFrom::Start(entry.offset))?;
                self.total_bytes_read = entry.offset;
            }

            let start = self.total_bytes_read;
            trace!("Reading candidate message @ {} (0x{:x}).", start, start);
            let Some((record, length)) = read_entry(&mut self.file, start)? else {
                debug!("EOF reached.");
                self.eof = true;
                break;
            };
            self.total_bytes_read = start + length;
            self.log_progress(false);

            if self.total_bytes_read > self.max_bytes {
                debug!("Max read length exceeded ({} B).", self.max_bytes);
                self.eof = true;
                break;
            }

            let message_index = self.current_message_index;
            self.current_message_index += 1;
            trace!(
                "Read {} message @ {} (0x{:x}). [length={} B, index={}]",
                record.message_type,
                start,
                start,
                record.contents.len(),
                message_index
            );

            if let Some(builder) = &mut self.builder {
                builder.push(IndexEntry {
                    message_type: record.message_type,
                    offset: start,
                    capture_time: record.capture_timestamp,
                    message_index,
                });
            }

            // With an index the view already reflects the filters.
            if self.view.is_none() {
                if let Some(types) = &self.message_types {
                    if !types.contains(&record.message_type) {
                        trace!("Message type not requested. Skipping.");
                        continue;
                    }
                }
                if let Some(range) = &mut self.time_range {
                    if !range.is_in_range(record.capture_timestamp) {
                        if range.in_range_started() && self.builder.is_none() {
                            debug!("End of time range reached. Finished processing.");
                            // Leave the record unread so a widened filter can still return it.
                            self.file.seek(SeekFrom::Start(start))?;
                            self.total_bytes_read = start;
                            self.current_message_index = message_index;
                            return Ok(None);
                        }
                        trace!("Message not in time range. Skipping.");
                        continue;
                    }
                }
            }

            *self.message_counts.entry(record.message_type).or_default() += 1;
            return Ok(Some(ReadRecord { record, offset: start, message_index }));
        }

        self.finish()?;
        Ok(None)
    }

    /// EOF bookkeeping: persist a freshly built index and switch to it
    fn finish(&mut self) -> Result<(), P1BinError> {
        self.log_progress(true);
        debug!("Read {} bytes total.", self.total_bytes_read);

        let Some(entries) = self.builder.take() else {
            return Ok(());
        };
        if let Err(e) = self.store.save(&self.path, &entries, self.file_size) {
            warn!("Unable to save index file: {}", e);
        }

        let index = RecordIndex { entries, covered_bytes: self.file_size };
        let view = index.filter(self.message_types.as_ref(), self.time_range.as_ref());
        self.next_index_elem = view.len();
        self.view = Some(view);
        self.full_index = Some(index);
        self.message_types = None;
        self.time_range = None;
        Ok(())
    }

    fn log_progress(&mut self, done: bool) {
        let file_size = self.file_size.min(self.max_bytes);
        if done || self.total_bytes_read.saturating_sub(self.last_progress_bytes) > PROGRESS_INTERVAL_BYTES {
            let percent = if file_size == 0 { 100.0 } else { 100.0 * self.total_bytes_read as f64 / file_size as f64 };
            debug!("Processed {}/{} bytes ({:.1}%).", self.total_bytes_read, file_size, percent);
            self.last_progress_bytes = self.total_bytes_read;
        }
    }

    /// Position the cursor at a message index.
    ///
    /// With `is_filtered` the index refers to the current filtered view;
    /// otherwise it refers to the full index and all filters are cleared.
    pub fn seek_to_message(&mut self, message_index: usize, is_filtered: bool) -> Result<(), P1BinError> {
        let (Some(full), Some(view)) = (&self.full_index, &self.view) else {
            return Err(P1BinError::IndexRequired);
        };
        let max = if is_filtered { view.len() } else { full.len() };
        if message_index >= max {
            return Err(P1BinError::InvalidMessageIndex { index: message_index, max });
        }

        if !is_filtered {
            self.clear_filters()?;
        }
        self.next_index_elem = message_index;
        Ok(())
    }

    /// Skip to the end of the file without returning records
    pub fn seek_to_eof(&mut self) -> Result<(), P1BinError> {
        if self.reached_eof() {
            return Ok(());
        }
        if self.generating_index() {
            return Err(P1BinError::IndexInProgress);
        }

        debug!("Forcibly seeking to EOF.");
        match &self.view {
            None => {
                self.file.seek(SeekFrom::Start(self.file_size))?;
                self.total_bytes_read = self.file_size;
                self.eof = true;
            }
            Some(view) => {
                let len = view.len();
                match view.last().copied() {
                    None => self.total_bytes_read = 0,
                    Some(last) => {
                        self.file.seek(SeekFrom::Start(last.offset))?;
                        self.total_bytes_read = match read_entry(&mut self.file, last.offset)? {
                            Some((_, length)) => last.offset + length,
                            None => self.file_size,
                        };
                    }
                }
                self.next_index_elem = len;
            }
        }
        Ok(())
    }

    /// Whether no further records will be returned
    pub fn reached_eof(&self) -> bool {
        match &self.view {
            Some(view) => self.next_index_elem >= view.len(),
            None => self.eof || self.total_bytes_read >= self.file_size,
        }
    }

    /// Remove all filters, restoring the construction filters in direct mode
    pub fn clear_filters(&mut self) -> Result<(), P1BinError> {
        self.filter_in_place(None, true)
    }

    /// Change the filters and continue after the most recently read record.
    ///
    /// In direct mode type filters intersect with the current set and time
    /// ranges intersect with the current range; [`RecordFilter::MessageRange`]
    /// requires an index.
    pub fn filter_in_place(&mut self, filter: Option<RecordFilter>, clear_existing: bool) -> Result<(), P1BinError> {
        let prev_offset = self.view.as_ref().and_then(|view| {
            self.next_index_elem.checked_sub(1).and_then(|i| view.get(i)).map(|entry| entry.offset)
        });

        if clear_existing {
            match &self.full_index {
                Some(full) => self.view = Some(full.entries.clone()),
                None => {
                    self.message_types = self.original_types.clone();
                    self.time_range = self.original_time_range.clone();
                }
            }
        }

        match (filter, &mut self.view) {
            (None, _) => {}
            (Some(filter), Some(view)) => {
                *view = match filter {
                    RecordFilter::Types(types) => {
                        view.iter().filter(|e| types.contains(&e.message_type)).copied().collect()
                    }
                    RecordFilter::TimeRange(range) => range.filter_entries(view),
                    RecordFilter::MessageRange(range) => {
                        let end = range.end.min(view.len());
                        let start = range.start.min(end);
                        view[start..end].to_vec()
                    }
                };
            }
            (Some(RecordFilter::Types(types)), None) => {
                self.message_types = Some(match self.message_types.take() {
                    Some(existing) => existing.intersection(&types).copied().collect(),
                    None => types,
                });
            }
            (Some(RecordFilter::TimeRange(range)), None) => match &mut self.time_range {
                Some(existing) => existing.intersect(&range),
                None => self.time_range = Some(range),
            },
            (Some(RecordFilter::MessageRange(_)), None) => {
                return Err(P1BinError::InvalidFilter(
                    "Index slicing not supported when an index file is not present".to_string(),
                ));
            }
        }

        if let Some(view) = &self.view {
            self.next_index_elem = match prev_offset {
                Some(prev) => view.partition_point(|entry| entry.offset <= prev),
                None => 0,
            };
        }
        Ok(())
    }

    /// Decode the record at an index entry without moving the read cursor
    pub fn parse_entry_at(&mut self, entry: &IndexEntry) -> Result<P1BinRecord, P1BinError> {
        let position = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let result = read_entry(&mut self.file, entry.offset);
        self.file.seek(SeekFrom::Start(position))?;
        match result? {
            Some((record, _)) => Ok(record),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Truncated P1Bin entry").into()),
        }
    }

    /// Records returned per type since the last rewind
    pub fn message_counts(&self) -> &BTreeMap<P1BinType, usize> {
        &self.message_counts
    }

    /// Current byte position in the data file
    pub fn bytes_read(&self) -> u64 {
        self.total_bytes_read
    }

    /// Data file size at open
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Data file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A complete index is available
    pub fn have_index(&self) -> bool {
        self.full_index.is_some()
    }

    /// The complete index, if available
    pub fn index(&self) -> Option<&RecordIndex> {
        self.full_index.as_ref()
    }

    /// The filtered view of the index, if available
    pub fn filtered_index(&self) -> Option<&[IndexEntry]> {
        self.view.as_deref()
    }

    /// An index is being built by the current pass
    pub fn generating_index(&self) -> bool {
        self.builder.is_some()
    }
}

impl<S: RecordIndexStore> Iterator for P1BinReader<S> {
    type Item = Result<ReadRecord, P1BinError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::p1bin::P1BinWriter;
    use bytes::Bytes;
    use std::fs;
    use tempfile::TempDir;

    const TYPES: [P1BinType; 6] = [
        P1BinType::Debug,
        P1BinType::Rtcm3Polaris,
        P1BinType::Debug,
        P1BinType::ExternalUnframedGnss,
        P1BinType::Rtcm3Polaris,
        P1BinType::Debug,
    ];

    fn write_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("input.p1bin");
        let mut writer = P1BinWriter::new(fs::File::create(&path).unwrap()).unwrap();
        for (i, message_type) in TYPES.iter().enumerate() {
            writer
                .write_record(&P1BinRecord {
                    capture_timestamp: 1000.0 + i as f64,
                    message_type: *message_type,
                    source_identifier: 1,
                    contents: Bytes::from(vec![i as u8; i + 1]),
                })
                .unwrap();
        }
        writer.into_inner().unwrap();
        path
    }

    fn indices(reader: &mut P1BinReader) -> Vec<usize> {
        reader.map(|r| r.unwrap().message_index).collect()
    }

    #[test]
    fn test_read_all_and_generate_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);

        let mut reader = P1BinReader::open(&path, ReaderOptions::default()).unwrap();
        assert!(!reader.have_index());
        assert!(reader.generating_index());

        let first = reader.read_next().unwrap().unwrap();
        assert_eq!(first.offset, 1);
        assert_eq!(first.record.contents.as_ref(), &[0]);
        assert_eq!(indices(&mut reader), vec![1, 2, 3, 4, 5]);

        assert!(reader.have_index());
        assert!(!reader.generating_index());
        assert!(reader.reached_eof());
        assert_eq!(reader.bytes_read(), reader.file_size());
        assert!(SidecarIndexStore::index_path(&path).exists());

        // A second reader uses the sidecar.
        let reader = P1BinReader::open(&path, ReaderOptions::default()).unwrap();
        assert!(reader.have_index());
        assert_eq!(reader.index().unwrap().len(), TYPES.len());
    }

    #[test]
    fn test_type_filter_direct_and_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);
        let options = ReaderOptions::default().message_types([P1BinType::Debug]);

        let mut direct = P1BinReader::open(&path, options.clone()).unwrap();
        assert_eq!(indices(&mut direct), vec![0, 2, 5]);
        assert_eq!(direct.message_counts().get(&P1BinType::Debug), Some(&3));

        let mut indexed = P1BinReader::open(&path, options).unwrap();
        assert!(indexed.have_index());
        assert_eq!(indices(&mut indexed), vec![0, 2, 5]);
    }

    #[test]
    fn test_time_range_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);
        let options = ReaderOptions::default().generate_index(false).time_range(TimeRange::new(Some(1.0), Some(3.0)));

        let mut reader = P1BinReader::open(&path, options).unwrap();
        assert_eq!(indices(&mut reader), vec![1, 2]);
        assert!(!reader.reached_eof());
    }

    #[test]
    fn test_filter_continuation_direct() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);
        let mut reader = P1BinReader::open(&path, ReaderOptions::default().generate_index(false)).unwrap();

        assert_eq!(reader.read_next().unwrap().unwrap().message_index, 0);
        assert_eq!(reader.read_next().unwrap().unwrap().message_index, 1);
        reader.filter_in_place(Some(RecordFilter::Types([P1BinType::Debug].into())), false).unwrap();
        assert_eq!(indices(&mut reader), vec![2, 5]);
        assert!(matches!(
            reader.filter_in_place(Some(RecordFilter::MessageRange(0..2)), false),
            Err(P1BinError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_filter_continuation_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);
        P1BinReader::generate_index_file(&path, false).unwrap();

        let mut reader =
            P1BinReader::open(&path, ReaderOptions::default().message_types([P1BinType::Rtcm3Polaris])).unwrap();
        assert_eq!(reader.read_next().unwrap().unwrap().message_index, 1);

        // Widen: the Debug record at index 2 follows the cursor and must not be skipped.
        reader.clear_filters().unwrap();
        assert_eq!(reader.read_next().unwrap().unwrap().message_index, 2);

        reader.filter_in_place(Some(RecordFilter::Types([P1BinType::Rtcm3Polaris].into())), false).unwrap();
        assert_eq!(indices(&mut reader), vec![4]);
    }

    #[test]
    fn test_seek_to_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);

        let mut direct = P1BinReader::open(&path, ReaderOptions::default().generate_index(false)).unwrap();
        assert!(matches!(direct.seek_to_message(0, false), Err(P1BinError::IndexRequired)));

        P1BinReader::generate_index_file(&path, false).unwrap();
        let mut reader =
            P1BinReader::open(&path, ReaderOptions::default().message_types([P1BinType::Debug])).unwrap();

        reader.seek_to_message(1, true).unwrap();
        assert_eq!(reader.read_next().unwrap().unwrap().message_index, 2);

        // Unfiltered seek clears filters.
        reader.seek_to_message(3, false).unwrap();
        assert_eq!(indices(&mut reader), vec![3, 4, 5]);

        assert!(matches!(
            reader.seek_to_message(6, false),
            Err(P1BinError::InvalidMessageIndex { index: 6, max: 6 })
        ));
    }

    #[test]
    fn test_seek_to_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);

        let mut building = P1BinReader::open(&path, ReaderOptions::default()).unwrap();
        assert!(matches!(building.seek_to_eof(), Err(P1BinError::IndexInProgress)));

        let mut direct = P1BinReader::open(&path, ReaderOptions::default().generate_index(false)).unwrap();
        direct.seek_to_eof().unwrap();
        assert!(direct.reached_eof());
        assert!(direct.read_next().unwrap().is_none());

        P1BinReader::generate_index_file(&path, false).unwrap();
        let mut indexed = P1BinReader::open(&path, ReaderOptions::default()).unwrap();
        indexed.seek_to_eof().unwrap();
        assert_eq!(indexed.bytes_read(), indexed.file_size());
        assert!(indexed.read_next().unwrap().is_none());
    }

    #[test]
    fn test_truncated_tail_is_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 2]).unwrap();

        let mut reader = P1BinReader::open(&path, ReaderOptions::default().generate_index(false)).unwrap();
        assert_eq!(indices(&mut reader), vec![0, 1, 2, 3, 4]);
        assert!(reader.reached_eof());
    }

    #[test]
    fn test_unsupported_api_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.p1bin");
        fs::write(&path, [2u8, 0, 0]).unwrap();
        assert!(matches!(
            P1BinReader::open(&path, ReaderOptions::default()),
            Err(P1BinError::UnsupportedApiVersion(2))
        ));
    }

    #[test]
    fn test_max_bytes_rejects_full_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);
        P1BinReader::generate_index_file(&path, false).unwrap();

        let mut reader = P1BinReader::open(&path, ReaderOptions::default().max_bytes(60)).unwrap();
        assert!(!reader.have_index());
        assert!(!reader.generating_index());
        let read = indices(&mut reader);
        assert!(!read.is_empty() && read.len() < TYPES.len());
    }

    #[test]
    fn test_parse_entry_at_keeps_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir);
        P1BinReader::generate_index_file(&path, false).unwrap();

        let mut reader = P1BinReader::open(&path, ReaderOptions::default()).unwrap();
        assert_eq!(reader.read_next().unwrap().unwrap().message_index, 0);
        let last = *reader.index().unwrap().entries.last().unwrap();
        assert_eq!(reader.parse_entry_at(&last).unwrap().contents.len(), 6);
        assert_eq!(reader.read_next().unwrap().unwrap().message_index, 1);
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.p1bin");
        fs::write(&path, []).unwrap();
        let mut reader = P1BinReader::open(&path, ReaderOptions::default()).unwrap();
        assert!(reader.reached_eof());
        assert!(reader.read_next().unwrap().is_none());
    }
}
