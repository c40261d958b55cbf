//! Chunked progressive downloader for a single asset.
//!
//! The downloader is a leaf: it owns no scheduling state beyond its own
//! transfer. It probes for range support, then pulls fixed-size chunks into
//! the store so partial progress is immediately playable, honoring a
//! between-chunk cancellation token and bounded linear-backoff retries.
//! Concurrency limits are the scheduler's job.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::asset::{AssetStatus, ByteRange};
use crate::cache::store::{AssetStore, StoreError};
use crate::config::DownloadConfig;
use crate::fetch::client::{FetchError, MediaFetcher, ProbeResult};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Disk-full and friends: never retried, and the caller should run an
    /// eviction pass to free space.
    #[error("storage failed: {0}")]
    Storage(#[from] StoreError),

    #[error("download superseded")]
    Cancelled,
}

/// Downloads one asset in fixed-size chunks, reporting progress through the
/// asset store as it goes.
pub struct ChunkDownloader {
    fetcher: Arc<dyn MediaFetcher>,
    store: AssetStore,
    config: DownloadConfig,
}

impl ChunkDownloader {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, store: AssetStore, config: DownloadConfig) -> Self {
        Self {
            fetcher,
            store,
            config,
        }
    }

    /// Download all missing bytes of `id`.
    ///
    /// Returns the final asset status on success. `cancel` is observed
    /// between chunks only: an in-flight chunk always completes (or fails at
    /// the network level), so the range list never sees a torn chunk.
    pub async fn download(
        &self,
        id: &str,
        url: &str,
        cancel: CancellationToken,
    ) -> Result<AssetStatus, DownloadError> {
        if let Some(asset) = self.store.get(id) {
            if asset.status == AssetStatus::FullyCached {
                return Ok(AssetStatus::FullyCached);
            }
        }

        self.store.mark_downloading(id, url)?;

        let probe = match self
            .with_retries(id, url, || self.probe_with_deadline(url))
            .await
        {
            Ok(probe) => probe,
            Err(e) => return Err(self.record_fetch_failure(id, url, e).await),
        };

        match probe.total_bytes {
            Some(total) if probe.accepts_ranges => self.download_ranged(id, url, total, cancel).await,
            _ => {
                debug!(id, url, "No range support, falling back to whole-file download");
                self.download_whole(id, url, cancel).await
            }
        }
    }

    /// Range mode: walk the coverage gaps chunk by chunk.
    async fn download_ranged(
        &self,
        id: &str,
        url: &str,
        total: u64,
        cancel: CancellationToken,
    ) -> Result<AssetStatus, DownloadError> {
        self.store.set_total_bytes(id, url, total)?;

        loop {
            if cancel.is_cancelled() {
                debug!(id, "Download cancelled between chunks");
                return Err(DownloadError::Cancelled);
            }

            // The record can vanish mid-download if an aggressive shrink ran;
            // treat that like a superseded request.
            let asset = self.store.get(id).ok_or(DownloadError::Cancelled)?;
            let Some(chunk) = asset.next_missing_range(self.config.chunk_size_bytes) else {
                return Ok(AssetStatus::FullyCached);
            };

            let bytes = match self
                .with_retries(id, url, || self.fetch_chunk(url, chunk))
                .await
            {
                Ok(bytes) => bytes,
                // A server that advertised ranges but rejects them mid-way
                // gets the whole-file treatment from here on.
                Err(FetchError::RangeUnsupported) => {
                    warn!(id, url, "Range request rejected mid-download, switching to whole-file mode");
                    return self.download_whole(id, url, cancel).await;
                }
                Err(e) => return Err(self.record_fetch_failure(id, url, e).await),
            };

            let written = ByteRange::new(chunk.start, chunk.start + bytes.len() as u64);
            let updated = self.store.write_chunk(id, url, chunk.start, &bytes)?;
            debug!(
                id,
                start = written.start,
                end = written.end,
                cached = updated.cached_bytes(),
                total,
                "Chunk written"
            );

            if updated.status == AssetStatus::FullyCached {
                return Ok(AssetStatus::FullyCached);
            }
        }
    }

    /// Fallback mode: single streamed download, written sequentially.
    async fn download_whole(
        &self,
        id: &str,
        url: &str,
        cancel: CancellationToken,
    ) -> Result<AssetStatus, DownloadError> {
        let open = || async {
            let deadline = Duration::from_millis(self.config.chunk_timeout_ms);
            match timeout(deadline, self.fetcher.fetch_whole(url)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            }
        };
        let mut stream = match self.with_retries(id, url, open).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.record_fetch_failure(id, url, e).await),
        };

        // Whole-file responses restart from byte zero regardless of prior
        // partial state; overwrite from the top.
        let mut cursor: u64 = 0;

        let chunk_timeout = Duration::from_millis(self.config.chunk_timeout_ms);
        loop {
            if cancel.is_cancelled() {
                debug!(id, "Streamed download cancelled");
                return Err(DownloadError::Cancelled);
            }

            let item = match timeout(chunk_timeout, stream.next()).await {
                Ok(item) => item,
                Err(_) => {
                    return Err(self
                        .record_fetch_failure(id, url, FetchError::Timeout)
                        .await)
                }
            };

            match item {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    self.store.write_chunk(id, url, cursor, &bytes)?;
                    cursor += bytes.len() as u64;
                }
                Some(Err(e)) => return Err(self.record_fetch_failure(id, url, e).await),
                None => break,
            }
        }

        // Stream end defines the total size.
        self.store.set_total_bytes(id, url, cursor)?;
        Ok(self
            .store
            .get(id)
            .map(|a| a.status)
            .unwrap_or(AssetStatus::Failed))
    }

    /// Probe under the configured deadline.
    ///
    /// A hung origin must not hold a download slot past the chunk timeout.
    async fn probe_with_deadline(&self, url: &str) -> Result<ProbeResult, FetchError> {
        let deadline = Duration::from_millis(self.config.chunk_timeout_ms);
        match timeout(deadline, self.fetcher.probe(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }

    /// One chunk fetch under the configured deadline.
    async fn fetch_chunk(&self, url: &str, chunk: ByteRange) -> Result<bytes::Bytes, FetchError> {
        let deadline = Duration::from_millis(self.config.chunk_timeout_ms);
        match timeout(deadline, self.fetcher.fetch_range(url, chunk)).await {
            // A 206 with no body would loop forever on the same gap; treat it
            // as a transient server fault.
            Ok(Ok(bytes)) if bytes.is_empty() => Err(FetchError::EmptyBody),
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }

    /// Run `op` with linear backoff until it succeeds, a permanent error
    /// occurs, or the retry budget is exhausted.
    async fn with_retries<T, F, Fut>(&self, id: &str, url: &str, op: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.retry_limit => {
                    attempt += 1;
                    let delay = Duration::from_millis(self.config.retry_backoff_ms * attempt as u64);
                    warn!(
                        id,
                        url,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Transient fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record a terminal fetch failure in the store and convert it.
    async fn record_fetch_failure(&self, id: &str, url: &str, e: FetchError) -> DownloadError {
        let permanent = !e.is_retryable();
        if let Err(store_err) = self.store.mark_failed(id, url, &e.to_string(), permanent) {
            return DownloadError::Storage(store_err);
        }
        DownloadError::Fetch(e)
    }
}
