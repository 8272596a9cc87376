//! Relative time window over record timestamps
//!
//! P1Bin timestamps are host serialization times with no guaranteed absolute
//! reference, so ranges are expressed as seconds since the first record seen.

use super::index::IndexEntry;
use super::P1BinError;
use std::str::FromStr;

/// `[start, end)` in seconds relative to the first record evaluated
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeRange {
    start: Option<f64>,
    end: Option<f64>,
    reference: Option<f64>,
    in_range_started: bool,
}

impl TimeRange {
    /// Create a range; either bound may be open
    pub fn new(start: Option<f64>, end: Option<f64>) -> Self {
        Self { start, end, reference: None, in_range_started: false }
    }

    /// Lower bound
    pub fn start(&self) -> Option<f64> {
        self.start
    }

    /// Upper bound (exclusive)
    pub fn end(&self) -> Option<f64> {
        self.end
    }

    fn contains_elapsed(&self, elapsed: f64) -> bool {
        self.start.map_or(true, |s| elapsed >= s) && self.end.map_or(true, |e| elapsed < e)
    }

    /// Test a timestamp; the first call fixes the reference time.
    ///
    /// Records without a valid time (NaN) are always in range.
    pub fn is_in_range(&mut self, timestamp: f64) -> bool {
        if timestamp.is_nan() {
            return true;
        }
        let reference = *self.reference.get_or_insert(timestamp);
        let in_range = self.contains_elapsed(timestamp - reference);
        if in_range {
            self.in_range_started = true;
        }
        in_range
    }

    /// Whether any record has been inside the range yet
    pub fn in_range_started(&self) -> bool {
        self.in_range_started
    }

    /// Forget the reference time
    pub fn restart(&mut self) {
        self.reference = None;
        self.in_range_started = false;
    }

    /// Narrow to the overlap with `other`
    pub fn intersect(&mut self, other: &TimeRange) {
        self.start = match (self.start, other.start) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.end = match (self.end, other.end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    /// Entries inside the range, relative to the first entry with a valid time
    pub fn filter_entries(&self, entries: &[IndexEntry]) -> Vec<IndexEntry> {
        let mut range = Self::new(self.start, self.end);
        entries.iter().filter(|entry| range.is_in_range(entry.capture_time)).copied().collect()
    }
}

impl FromStr for TimeRange {
    type Err = P1BinError;

    /// `START:END` in seconds; either side may be empty
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once(':')
            .ok_or_else(|| P1BinError::InvalidFilter(format!("Time range must be START:END, got '{s}'")))?;
        let parse = |v: &str| -> Result<Option<f64>, P1BinError> {
            let v = v.trim();
            if v.is_empty() {
                return Ok(None);
            }
            v.parse::<f64>()
                .map(Some)
                .map_err(|_| P1BinError::InvalidFilter(format!("Invalid time '{v}'")))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::p1bin::P1BinType;

    #[test]
    fn test_relative_window() {
        let mut range = TimeRange::new(Some(1.0), Some(2.0));
        assert!(!range.is_in_range(100.0));
        assert!(!range.in_range_started());
        assert!(range.is_in_range(101.0));
        assert!(range.is_in_range(101.5));
        assert!(!range.is_in_range(102.0));
        assert!(range.in_range_started());

        range.restart();
        assert!(!range.is_in_range(500.0));
        assert!(range.is_in_range(501.0));
    }

    #[test]
    fn test_intersect() {
        let mut range = TimeRange::new(Some(1.0), None);
        range.intersect(&TimeRange::new(Some(0.5), Some(3.0)));
        assert_eq!((range.start(), range.end()), (Some(1.0), Some(3.0)));
    }

    #[test]
    fn test_parse() {
        let range: TimeRange = "2.5:".parse().unwrap();
        assert_eq!((range.start(), range.end()), (Some(2.5), None));
        let range: TimeRange = ":10".parse().unwrap();
        assert_eq!((range.start(), range.end()), (None, Some(10.0)));
        assert!("10".parse::<TimeRange>().is_err());
        assert!("a:b".parse::<TimeRange>().is_err());
    }

    #[test]
    fn test_filter_entries() {
        let entries: Vec<IndexEntry> = [10.0, 10.5, 11.0, 12.0]
            .iter()
            .enumerate()
            .map(|(i, &t)| IndexEntry {
                message_type: P1BinType::Debug,
                offset: i as u64 * 100,
                capture_time: t,
                message_index: i,
            })
            .collect();
        let range = TimeRange::new(Some(0.5), Some(2.0));
        let kept: Vec<usize> = range.filter_entries(&entries).iter().map(|e| e.message_index).collect();
        assert_eq!(kept, vec![1, 2]);
    }
}
