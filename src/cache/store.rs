//! Durable asset store: the single writer for all [`VideoAsset`] records.
//!
//! Metadata is persisted synchronously as a flat JSON index next to the
//! payload files, so a crash between calls never loses more than the
//! in-flight write. Payload bytes live one file per asset and are written at
//! range offsets as chunks arrive.

use std::collections::HashMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::asset::{AssetStatus, ByteRange, RangeInsertError, VideoAsset};

const INDEX_FILE: &str = "assets.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("rejected range insert for {id}: {source}")]
    InvalidRange {
        id: String,
        #[source]
        source: RangeInsertError,
    },
}

/// Store-level accounting, mirrored into diagnostics.
#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub total_chunk_writes: u64,
    pub total_bytes_written: u64,
    pub total_removals: u64,
    pub total_bytes_removed: u64,
}

struct StoreInner {
    root: PathBuf,
    assets: HashMap<String, VideoAsset>,
    retry_limit: u32,
    stats: StoreStats,
}

/// Cheaply cloneable handle to the asset store.
///
/// All mutation is serialized through the internal lock; readers get
/// point-in-time clones and never observe a torn write.
#[derive(Clone)]
pub struct AssetStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl AssetStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Reloads the persisted index wholesale; any record whose payload file
    /// no longer exists on disk is purged and will start over as
    /// `NotStarted` on its next request.
    pub fn open(root: impl Into<PathBuf>, retry_limit: u32) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let index_path = root.join(INDEX_FILE);
        let mut assets: HashMap<String, VideoAsset> = HashMap::new();
        if index_path.exists() {
            let data = std::fs::read_to_string(&index_path)?;
            let records: Vec<VideoAsset> = serde_json::from_str(&data)?;
            let total = records.len();
            for record in records {
                let payload_ok = record
                    .local_path
                    .as_ref()
                    .map(|p| p.exists())
                    .unwrap_or(false);
                if payload_ok {
                    assets.insert(record.id.clone(), record);
                } else {
                    debug!(id = %record.id, "Purging stale record with missing payload");
                }
            }
            debug!(
                loaded = assets.len(),
                purged = total - assets.len(),
                "Asset index reloaded"
            );
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                root,
                assets,
                retry_limit,
                stats: StoreStats::default(),
            })),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a single asset.
    pub fn get(&self, id: &str) -> Option<VideoAsset> {
        self.lock().assets.get(id).cloned()
    }

    /// Point-in-time view of every record.
    pub fn snapshot(&self) -> Vec<VideoAsset> {
        self.lock().assets.values().cloned().collect()
    }

    /// Sum of cached payload bytes across all assets.
    pub fn total_cached_bytes(&self) -> u64 {
        self.lock().assets.values().map(|a| a.cached_bytes()).sum()
    }

    /// Store accounting counters.
    pub fn stats(&self) -> StoreStats {
        self.lock().stats.clone()
    }

    /// Payload file path for an asset id.
    pub fn payload_path(&self, id: &str) -> PathBuf {
        let inner = self.lock();
        payload_path(&inner.root, id)
    }

    /// Write one chunk of payload at `offset` and merge the covered range.
    ///
    /// The byte write and the metadata update are a single store call so the
    /// range list can never claim bytes that were not durably written.
    pub fn write_chunk(
        &self,
        id: &str,
        url: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<VideoAsset, StoreError> {
        let mut inner = self.lock();
        let path = payload_path(&inner.root, id);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;

        inner.stats.total_chunk_writes += 1;
        inner.stats.total_bytes_written += data.len() as u64;

        let range = ByteRange::new(offset, offset + data.len() as u64);
        inner.upsert_range_inner(id, url, range, Some(path))
    }

    /// Merge a byte range into an asset's record and recompute its status.
    ///
    /// Used directly when the bytes were written out-of-band (tests, import);
    /// the regular download path goes through [`AssetStore::write_chunk`].
    pub fn upsert_range(
        &self,
        id: &str,
        url: &str,
        range: ByteRange,
    ) -> Result<VideoAsset, StoreError> {
        let mut inner = self.lock();
        let path = payload_path(&inner.root, id);
        inner.upsert_range_inner(id, url, range, Some(path))
    }

    /// Record the total size learned from a range probe.
    pub fn set_total_bytes(&self, id: &str, url: &str, total: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let asset = inner.entry(id, url);
        asset.total_bytes = Some(total);
        asset.recompute_status();
        inner.persist()
    }

    /// Mark an asset as having a dispatched download.
    ///
    /// Assets that already hold bytes keep their cached status; the
    /// `Downloading` state is only meaningful before the first chunk lands.
    pub fn mark_downloading(&self, id: &str, url: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let asset = inner.entry(id, url);
        if asset.ranges.is_empty() {
            asset.status = AssetStatus::Downloading;
        }
        inner.persist()
    }

    /// Update access stats with an explicit clock (unix millis).
    ///
    /// Creates the record on first access: every playback request counts,
    /// even for assets nothing has downloaded yet, so a freshly watched
    /// asset never looks cold to the evictor.
    pub fn touch_at(&self, id: &str, url: &str, now_ms: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let asset = inner.entry(id, url);
        asset.touch(now_ms);
        inner.persist()
    }

    /// Update access stats using the wall clock.
    pub fn touch(&self, id: &str, url: &str) -> Result<(), StoreError> {
        self.touch_at(id, url, now_unix_ms())
    }

    /// Record a download failure.
    ///
    /// Transient failures bump `retry_count` and leave the asset eligible for
    /// retry; once the configured limit is exceeded (or `permanent` is set)
    /// the asset transitions to `Failed`. Returns the resulting status.
    pub fn mark_failed(
        &self,
        id: &str,
        url: &str,
        reason: &str,
        permanent: bool,
    ) -> Result<AssetStatus, StoreError> {
        let mut inner = self.lock();
        let retry_limit = inner.retry_limit;
        let asset = inner.entry(id, url);
        asset.retry_count += 1;

        let status = if permanent || asset.retry_count > retry_limit {
            AssetStatus::Failed
        } else if asset.ranges.is_empty() {
            AssetStatus::NotStarted
        } else {
            // Partial bytes stay playable and the next attempt resumes.
            AssetStatus::PartiallyCached
        };
        asset.status = status;

        warn!(
            id,
            reason,
            retries = asset.retry_count,
            status = %status,
            "Download failure recorded"
        );

        inner.persist()?;
        Ok(status)
    }

    /// Delete an asset's payload file and record.
    ///
    /// A payload file that is already gone is logged, not an error. Returns
    /// the number of cached bytes freed.
    pub fn remove(&self, id: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let Some(asset) = inner.assets.remove(id) else {
            return Ok(0);
        };
        let freed = asset.cached_bytes();

        if let Some(path) = &asset.local_path {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(id, path = %path.display(), "Deleted payload file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(id, path = %path.display(), "Payload file already gone")
                }
                Err(e) => {
                    // Record is gone either way; orphaned bytes are reclaimed
                    // on the next open's purge pass.
                    warn!(id, error = %e, "Failed to delete payload file");
                }
            }
        }

        inner.stats.total_removals += 1;
        inner.stats.total_bytes_removed += freed;
        inner.persist()?;
        Ok(freed)
    }
}

impl StoreInner {
    fn entry(&mut self, id: &str, url: &str) -> &mut VideoAsset {
        self.assets
            .entry(id.to_string())
            .or_insert_with(|| VideoAsset::new(id, url))
    }

    fn upsert_range_inner(
        &mut self,
        id: &str,
        url: &str,
        range: ByteRange,
        path: Option<PathBuf>,
    ) -> Result<VideoAsset, StoreError> {
        let asset = self.entry(id, url);
        asset
            .insert_range(range)
            .map_err(|source| StoreError::InvalidRange {
                id: id.to_string(),
                source,
            })?;
        if asset.local_path.is_none() {
            asset.local_path = path;
        }
        asset.retry_count = 0;
        asset.recompute_status();
        let snapshot = asset.clone();
        self.persist()?;
        Ok(snapshot)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let records: Vec<&VideoAsset> = self.assets.values().collect();
        let data = serde_json::to_vec(&records)?;
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, self.root.join(INDEX_FILE))?;
        Ok(())
    }
}

fn payload_path(root: &Path, id: &str) -> PathBuf {
    // Ids come from the feed backend; keep filenames tame.
    let sanitized: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    root.join(format!("{sanitized}.bin"))
}

/// Current wall-clock time as unix milliseconds.
pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
