//! The unit of buffering: a fixed-rate audio block and its store identity.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

const FILE_PREFIX: &str = "block_";
const FILE_EXTENSION: &str = ".wav";

/// Audio converted from one packet, ready for storage and playback.
///
/// Immutable once created: stages move it along, nobody edits the samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    // ---
    /// Monotonic sequence number assigned at creation
    pub sequence: u64,

    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Mono samples, normalized to [-1, 1]
    pub samples: Vec<f32>,

    /// Creation instant
    pub created: DateTime<Utc>,
}

impl Block {
    // ---
    /// Returns the number of samples.
    pub fn len(&self) -> usize {
        // ---
        self.samples.len()
    }

    /// Returns true if the block carries no audio.
    pub fn is_empty(&self) -> bool {
        // ---
        self.samples.is_empty()
    }

    /// Returns the playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        // ---
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Store identity of this block.
    pub fn id(&self) -> EntryId {
        // ---
        EntryId {
            sequence: self.sequence,
            created: self.created,
        }
    }
}

/// Identity of a persisted block, recoverable from its file name alone.
///
/// File names look like `block_0000000042_0001760811781123456.wav`: the
/// zero-padded sequence number followed by the creation time in microseconds
/// since the Unix epoch. Entries order by creation time, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    // ---
    pub sequence: u64,
    pub created: DateTime<Utc>,
}

impl EntryId {
    // ---
    /// File name this entry is published under.
    pub fn file_name(&self) -> String {
        // ---
        format!(
            "{FILE_PREFIX}{:010}_{:019}{FILE_EXTENSION}",
            self.sequence,
            self.created.timestamp_micros()
        )
    }

    /// Parses a published file name. Returns `None` for anything else,
    /// including temporary files of in-flight writes.
    pub fn parse(file_name: &str) -> Option<Self> {
        // ---
        let stem = file_name
            .strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_EXTENSION)?;
        let (sequence, micros) = stem.split_once('_')?;
        let sequence = sequence.parse().ok()?;
        let created = DateTime::<Utc>::from_timestamp_micros(micros.parse().ok()?)?;
        Some(Self { sequence, created })
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        // ---
        self.created
            .cmp(&other.created)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
