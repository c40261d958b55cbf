//! Video asset records and byte-range bookkeeping.
//!
//! A [`VideoAsset`] is the durable record of everything known about one video:
//! download state, which byte ranges are present on disk, and access stats.
//! Assets are the unit of caching and eviction.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Download state of a single asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetStatus {
    /// Nothing fetched yet (or reset for retry).
    NotStarted,
    /// A download slot is dispatched but no bytes are durable yet.
    Downloading,
    /// Some byte ranges are on disk and playable.
    PartiallyCached,
    /// Ranges cover `[0, total_bytes)`.
    FullyCached,
    /// Retries exhausted or a permanent error occurred.
    Failed,
}

impl std::fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetStatus::NotStarted => write!(f, "not-started"),
            AssetStatus::Downloading => write!(f, "downloading"),
            AssetStatus::PartiallyCached => write!(f, "partial"),
            AssetStatus::FullyCached => write!(f, "cached"),
            AssetStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Length of the interval in bytes.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether two ranges overlap or touch (mergeable into one interval).
    fn mergeable(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// One video's cached/download state record.
///
/// Owned exclusively by the asset store; other components read clones from
/// `snapshot()` and mutate only through store methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoAsset {
    /// Caller-supplied video identifier.
    pub id: String,

    /// Origin URL the bytes come from.
    pub source_url: String,

    /// Current download state.
    pub status: AssetStatus,

    /// Sorted, non-overlapping byte ranges present on disk.
    pub ranges: Vec<ByteRange>,

    /// Total size of the remote resource, once a range probe has succeeded.
    pub total_bytes: Option<u64>,

    /// Local payload file, set once any bytes are durably written.
    pub local_path: Option<PathBuf>,

    /// Unix-millis of the last playback/read request.
    pub last_accessed_ms: u64,

    /// Number of playback/read requests.
    pub access_count: u64,

    /// Consecutive transient failures; resets to 0 on success.
    pub retry_count: u32,
}

impl VideoAsset {
    /// Create a fresh record with nothing downloaded.
    pub fn new(id: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            status: AssetStatus::NotStarted,
            ranges: Vec::new(),
            total_bytes: None,
            local_path: None,
            last_accessed_ms: 0,
            access_count: 0,
            retry_count: 0,
        }
    }

    /// Total bytes present on disk for this asset.
    pub fn cached_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Whether the stored ranges cover the whole resource.
    ///
    /// Unknown total size can never be fully covered; a zero-length resource
    /// is covered by definition.
    pub fn covers_fully(&self) -> bool {
        match self.total_bytes {
            Some(0) => true,
            Some(total) => {
                self.ranges.len() == 1
                    && self.ranges[0].start == 0
                    && self.ranges[0].end >= total
            }
            None => false,
        }
    }

    /// Merge a new range into the sorted range list.
    ///
    /// Overlapping or adjacent ranges collapse into one interval. Inverted or
    /// empty ranges, and ranges beyond a known total size, are rejected so a
    /// bad insert cannot corrupt the bookkeeping.
    pub fn insert_range(&mut self, range: ByteRange) -> Result<(), RangeInsertError> {
        if range.is_empty() {
            return Err(RangeInsertError::Empty { range });
        }
        if let Some(total) = self.total_bytes {
            if range.end > total {
                return Err(RangeInsertError::BeyondTotal { range, total });
            }
        }

        let mut merged = range;
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for existing in &self.ranges {
            if existing.mergeable(&merged) {
                merged.start = merged.start.min(existing.start);
                merged.end = merged.end.max(existing.end);
            } else {
                result.push(*existing);
            }
        }
        result.push(merged);
        result.sort_by_key(|r| r.start);
        self.ranges = result;
        Ok(())
    }

    /// First gap in coverage, clamped to `chunk_size` bytes.
    ///
    /// Returns `None` when the asset is fully covered, or when the total size
    /// is still unknown (the caller must probe first).
    pub fn next_missing_range(&self, chunk_size: u64) -> Option<ByteRange> {
        let total = self.total_bytes?;
        let mut cursor = 0u64;
        for range in &self.ranges {
            if range.start > cursor {
                let end = (cursor + chunk_size).min(range.start);
                return Some(ByteRange::new(cursor, end));
            }
            cursor = cursor.max(range.end);
        }
        if cursor < total {
            let end = (cursor + chunk_size).min(total);
            return Some(ByteRange::new(cursor, end));
        }
        None
    }

    /// Record an access, updating timestamp and counter.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_accessed_ms = self.last_accessed_ms.max(now_ms);
        self.access_count += 1;
    }

    /// Recompute `status` from range coverage.
    ///
    /// Keeps the `local_path ⇔ bytes-on-disk` invariant: a record with ranges
    /// is at least partially cached, a record without ranges keeps its
    /// lifecycle status (`NotStarted`/`Downloading`/`Failed`).
    pub fn recompute_status(&mut self) {
        if self.covers_fully() {
            self.status = AssetStatus::FullyCached;
        } else if !self.ranges.is_empty() {
            self.status = AssetStatus::PartiallyCached;
        }
    }

    /// Whether a local playable path exists for this asset.
    pub fn is_playable_locally(&self) -> bool {
        self.local_path.is_some()
            && matches!(
                self.status,
                AssetStatus::PartiallyCached | AssetStatus::FullyCached
            )
    }
}

/// A rejected range insert.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum RangeInsertError {
    #[error("empty or inverted range [{},{})", range.start, range.end)]
    Empty { range: ByteRange },

    #[error("range [{},{}) extends beyond total size {total}", range.start, range.end)]
    BeyondTotal { range: ByteRange, total: u64 },
}
