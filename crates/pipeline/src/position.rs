//! Binlog positions and per-second sequence numbering.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Largest sequence value handed out within one coarse timestamp.
pub const SEQUENCE_CAP: u32 = 999_998;

/// Location of an event in the binlog.
///
/// Ordered by segment (numeric suffix of `mysql-bin.000042`), then byte
/// offset, then the sequence number assigned by [`SequenceClock`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub segment: String,
    pub offset: u64,
    #[serde(default)]
    pub sequence: u32,
}

impl Position {
    pub fn new(segment: impl Into<String>, offset: u64) -> Self {
        Self {
            segment: segment.into(),
            offset,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Compare segment and offset only.
    pub fn cmp_location(&self, other: &Self) -> Ordering {
        compare_segments(&self.segment, &other.segment).then(self.offset.cmp(&other.offset))
    }

    /// Whether this event lies at or before `segment:offset`.
    pub fn is_at_or_before(&self, segment: &str, offset: u64) -> bool {
        compare_segments(&self.segment, segment).then(self.offset.cmp(&offset)) != Ordering::Greater
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_location(other)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)?;
        if self.sequence > 0 {
            write!(f, "#{}", self.sequence)?;
        }
        Ok(())
    }
}

/// Order binlog segment names by their numeric suffix.
///
/// Names without a numeric suffix, or with equal suffixes, compare
/// lexically.
pub fn compare_segments(a: &str, b: &str) -> Ordering {
    match (segment_number(a), segment_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn segment_number(segment: &str) -> Option<u64> {
    segment.rsplit_once('.')?.1.parse().ok()
}

/// Assigns a sequence number to events sharing one coarse (second) timestamp.
///
/// The counter restarts at 0 whenever the timestamp advances and wraps with a
/// warning once it passes [`SEQUENCE_CAP`]; ordering inside a wrapped window
/// is best-effort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceClock {
    last_timestamp: i64,
    counter: u32,
}

impl SequenceClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for the next event with `timestamp` (seconds).
    pub fn tick(&mut self, timestamp: i64) -> u32 {
        if timestamp > self.last_timestamp {
            self.last_timestamp = timestamp;
            self.counter = 0;
        } else {
            self.counter += 1;
            if self.counter > SEQUENCE_CAP {
                warn!(
                    timestamp,
                    "sequence counter overflowed, ordering of events within this second is best-effort"
                );
                self.counter = 0;
            }
        }
        self.counter
    }
}

/// Microsecond timestamp derived from a second timestamp and its sequence.
pub fn timestamp_micros(timestamp: i64, sequence: u32) -> i64 {
    timestamp * 1_000_000 + sequence as i64
}
