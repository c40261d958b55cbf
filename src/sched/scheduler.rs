//! The prefetch scheduler: turns feed context and live signals into a
//! bounded, priority-ordered stream of downloads.
//!
//! Per-id lifecycle: unqueued → queued → downloading → {cached, failed}.
//! A queued id can fall back to unqueued when a context update supersedes
//! it; a downloading id is cancelled between chunks when it scrolls out of
//! the window. `resolve` is the UI's single entry point and is infallible:
//! it always hands back a playable URI, local when cached, origin otherwise.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::asset::AssetStatus;
use crate::cache::evictor::CacheEvictor;
use crate::cache::store::{now_unix_ms, AssetStore};
use crate::config::{CacheBudget, Config};
use crate::fetch::client::MediaFetcher;
use crate::fetch::downloader::{ChunkDownloader, DownloadError};
use crate::sched::queue::{PrefetchRequest, Priority, RequestQueue};
use crate::signal::backpressure::{AdaptiveBackpressureMonitor, BackpressureSignal};
use crate::signal::scroll::{ScrollRegime, ScrollVelocityTracker};

/// One feed entry the UI knows about.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub index: i64,
    pub id: String,
    pub url: String,
}

/// The UI's view of the feed at one moment.
#[derive(Debug, Clone, Default)]
pub struct FeedContext {
    /// Index of the item the user is watching.
    pub current_index: i64,

    /// Indices currently on screen (fully or partially).
    pub visible_indices: Vec<i64>,

    /// Prefetch distance: items within this many slots of the focus are
    /// candidates.
    pub window: i64,

    /// Feed entries covering at least the window around the current index.
    pub items: Vec<FeedItem>,
}

/// A playable source. Callers treat both variants as equally valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// Bytes are (at least partially) on disk.
    Local(PathBuf),
    /// Stream from origin while the cache catches up.
    Remote(String),
}

impl ResolvedSource {
    pub fn uri(&self) -> String {
        match self {
            ResolvedSource::Local(path) => path.display().to_string(),
            ResolvedSource::Remote(url) => url.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ResolvedSource::Local(_))
    }
}

/// Cache-state-changed notifications for the UI (buffering indicators etc).
#[derive(Debug, Clone)]
pub enum CacheEvent {
    StatusChanged { id: String, status: AssetStatus },
    Degrade(BackpressureSignal),
}

/// Scheduler accounting.
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

struct InFlight {
    cancel: CancellationToken,
    priority: Priority,
}

struct SchedState {
    queue: RequestQueue,
    in_flight: HashMap<String, InFlight>,
    tracker: ScrollVelocityTracker,
    monitor: AdaptiveBackpressureMonitor,
    current_id: Option<String>,
    /// Ids eviction must never touch: current/visible/High+ and in-flight.
    protected: HashSet<String>,
    /// Set by PreemptiveFlush/CacheClear; cleared by the next context update.
    prefetch_paused: bool,
    stats: SchedulerStats,
}

struct Inner {
    store: AssetStore,
    downloader: ChunkDownloader,
    evictor: CacheEvictor,
    budget: CacheBudget,
    active: AtomicUsize,
    events: broadcast::Sender<CacheEvent>,
    state: Mutex<SchedState>,
}

/// The orchestrator. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct PrefetchScheduler {
    inner: Arc<Inner>,
}

impl PrefetchScheduler {
    pub fn new(store: AssetStore, fetcher: Arc<dyn MediaFetcher>, config: Config) -> Self {
        let downloader =
            ChunkDownloader::new(fetcher, store.clone(), config.download.clone());
        let evictor = CacheEvictor::new(config.budget.clone());
        let (events, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                store,
                downloader,
                evictor,
                budget: config.budget.clone(),
                active: AtomicUsize::new(0),
                events,
                state: Mutex::new(SchedState {
                    queue: RequestQueue::new(),
                    in_flight: HashMap::new(),
                    tracker: ScrollVelocityTracker::new(config.scroll.clone()),
                    monitor: AdaptiveBackpressureMonitor::new(config.backpressure.clone()),
                    current_id: None,
                    protected: HashSet::new(),
                    prefetch_paused: false,
                    stats: SchedulerStats::default(),
                }),
            }),
        }
    }

    /// Subscribe to cache-state-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// The store backing this scheduler.
    pub fn store(&self) -> &AssetStore {
        &self.inner.store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- inbound UI signals ----

    /// Feed a raw scroll-position sample.
    pub fn sample(&self, position: f64, timestamp_ms: u64) {
        self.lock().tracker.sample(position, timestamp_ms);
    }

    /// Feed one render-tick frame interval.
    pub fn record_frame_interval(&self, interval_ms: f64) {
        let signal = self.lock().monitor.record_frame_interval(interval_ms);
        if let Some(signal) = signal {
            self.apply_signal(signal);
        }
    }

    /// Recompute priorities for the new feed context (wall clock).
    pub fn update_context(&self, ctx: &FeedContext) {
        self.update_context_at(ctx, now_unix_ms());
    }

    /// Recompute priorities for the new feed context at an explicit time.
    pub fn update_context_at(&self, ctx: &FeedContext, now_ms: u64) {
        {
            let mut st = self.lock();
            let st = &mut *st;
            let scroll = st.tracker.state(now_ms);

            // During a confident fling, prefetch around where the scroll will
            // land rather than where the finger currently is.
            let center = if scroll.regime == ScrollRegime::Fast && scroll.confidence >= 0.5 {
                scroll.predicted_settle_index
            } else {
                ctx.current_index
            };

            // A fresh context decision resumes prefetch after a flush.
            st.prefetch_paused = false;

            let visible: HashSet<i64> = ctx.visible_indices.iter().copied().collect();
            let mut wanted: HashMap<String, (String, Priority, i64)> = HashMap::new();

            for item in &ctx.items {
                let dist_current = (item.index - ctx.current_index).abs();
                let dist_center = (item.index - center).abs();
                if dist_current > ctx.window && dist_center > ctx.window {
                    continue;
                }

                let priority = if item.index == ctx.current_index {
                    Priority::Critical
                } else if dist_current <= 1 && visible.contains(&item.index) {
                    Priority::High
                } else if !visible.contains(&item.index) {
                    Priority::Medium
                } else {
                    Priority::Low
                };

                // Scrolling too fast to benefit from warm-cache extras.
                if scroll.regime == ScrollRegime::Fast && priority == Priority::Low {
                    continue;
                }

                wanted.insert(item.id.clone(), (item.url.clone(), priority, item.index));
            }

            // Supersede queued ids that fell out of the window. The cache
            // keeps their bytes; only the pending work is dropped.
            for id in st.queue.queued_ids() {
                if !wanted.contains_key(&id) {
                    st.queue.remove(&id);
                    debug!(id, "Queued request superseded by context update");
                }
            }

            // In-flight ids that scrolled far away finish their current chunk
            // and stop.
            for (id, inflight) in &st.in_flight {
                if !wanted.contains_key(id) && !inflight.cancel.is_cancelled() {
                    inflight.cancel.cancel();
                    st.stats.cancelled += 1;
                    debug!(id = %id, "In-flight download cancelled by context update");
                }
            }

            st.current_id = ctx
                .items
                .iter()
                .find(|i| i.index == ctx.current_index)
                .map(|i| i.id.clone());

            let mut protected: HashSet<String> = st.in_flight.keys().cloned().collect();
            for item in &ctx.items {
                if visible.contains(&item.index) || item.index == ctx.current_index {
                    protected.insert(item.id.clone());
                }
            }

            for (id, (url, priority, index)) in &wanted {
                if *priority >= Priority::High {
                    protected.insert(id.clone());
                }
                if st.in_flight.contains_key(id) {
                    continue;
                }
                match self.inner.store.get(id).map(|a| a.status) {
                    Some(AssetStatus::FullyCached) => continue,
                    // Failed assets retry only when the user comes back to them.
                    Some(AssetStatus::Failed) if *priority < Priority::High => continue,
                    _ => {}
                }
                st.queue.enqueue(id, url, *priority, *index);
            }

            st.protected = protected;
        }
        self.dispatch();
    }

    /// Resolve a playable source for `id`. Never blocks on the network and
    /// never fails: a cache miss streams from origin while a background
    /// download is enqueued.
    pub fn resolve(&self, id: &str, url: &str) -> ResolvedSource {
        if let Err(e) = self.inner.store.touch(id, url) {
            warn!(id, error = %e, "Failed to record access");
        }

        if let Some(asset) = self.inner.store.get(id) {
            if asset.is_playable_locally() {
                if let Some(path) = asset.local_path {
                    return ResolvedSource::Local(path);
                }
            }
        }

        {
            let mut st = self.lock();
            let priority = if st.current_id.as_deref() == Some(id) {
                Priority::Critical
            } else {
                Priority::High
            };
            st.protected.insert(id.to_string());
            if !st.in_flight.contains_key(id) {
                st.queue.enqueue(id, url, priority, 0);
            }
        }
        self.dispatch();

        ResolvedSource::Remote(url.to_string())
    }

    // ---- dispatch loop ----

    /// Fill free download slots from the queue.
    fn dispatch(&self) {
        let max = self.inner.budget.max_concurrent_downloads;
        let mut to_spawn: Vec<(PrefetchRequest, CancellationToken)> = Vec::new();

        {
            let mut st = self.lock();
            while self.inner.active.load(Ordering::SeqCst) < max {
                let req = if st.prefetch_paused {
                    st.queue.pop_at_least(Priority::High)
                } else {
                    st.queue.pop()
                };
                let Some(req) = req else { break };

                if st.in_flight.contains_key(&req.video_id) {
                    continue;
                }
                if let Some(asset) = self.inner.store.get(&req.video_id) {
                    if asset.status == AssetStatus::FullyCached {
                        continue;
                    }
                }

                let cancel = CancellationToken::new();
                st.in_flight.insert(
                    req.video_id.clone(),
                    InFlight {
                        cancel: cancel.clone(),
                        priority: req.priority,
                    },
                );
                st.stats.dispatched += 1;
                // Reserve the slot while still under the lock so concurrent
                // dispatchers cannot overshoot the bound.
                self.inner.active.fetch_add(1, Ordering::SeqCst);
                to_spawn.push((req, cancel));
            }
        }

        for (req, cancel) in to_spawn {
            self.spawn_download(req, cancel);
        }
    }

    fn spawn_download(&self, req: PrefetchRequest, cancel: CancellationToken) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime: put the work back rather than losing it.
            warn!(id = %req.video_id, "Dispatch outside a tokio runtime, requeueing");
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            let mut st = self.lock();
            st.in_flight.remove(&req.video_id);
            st.stats.dispatched -= 1;
            st.queue
                .enqueue(&req.video_id, &req.url, req.priority, req.origin_index);
            return;
        };

        debug!(
            id = %req.video_id,
            priority = %req.priority,
            "Dispatching download"
        );
        self.emit(CacheEvent::StatusChanged {
            id: req.video_id.clone(),
            status: AssetStatus::Downloading,
        });

        let scheduler = self.clone();
        handle.spawn(async move {
            let result = scheduler
                .inner
                .downloader
                .download(&req.video_id, &req.url, cancel)
                .await;
            scheduler.finish_download(&req, result);
        });
    }

    /// Completion handler: accounting, events, eviction, slot refill.
    fn finish_download(&self, req: &PrefetchRequest, result: Result<AssetStatus, DownloadError>) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);

        let protected = {
            let mut st = self.lock();
            st.in_flight.remove(&req.video_id);
            match &result {
                Ok(_) => st.stats.completed += 1,
                Err(DownloadError::Cancelled) => {}
                Err(_) => st.stats.failed += 1,
            }
            st.protected.clone()
        };

        match &result {
            Ok(status) => {
                info!(id = %req.video_id, status = %status, "Download complete");
                self.emit(CacheEvent::StatusChanged {
                    id: req.video_id.clone(),
                    status: *status,
                });
            }
            Err(DownloadError::Cancelled) => {
                debug!(id = %req.video_id, "Download superseded mid-flight");
            }
            Err(DownloadError::Storage(e)) => {
                // Disk trouble: mark the asset failed and free space right
                // away so the next attempt can land.
                warn!(id = %req.video_id, error = %e, "Storage failure during download");
                if let Err(e) =
                    self.inner
                        .store
                        .mark_failed(&req.video_id, &req.url, &e.to_string(), true)
                {
                    warn!(id = %req.video_id, error = %e, "Failed to record storage failure");
                }
                self.emit_status_of(&req.video_id);
                if let Err(e) = self.inner.evictor.shrink_to(
                    &self.inner.store,
                    &protected,
                    self.inner.budget.target_after_cleanup,
                ) {
                    warn!(error = %e, "Emergency eviction failed");
                }
            }
            Err(DownloadError::Fetch(e)) => {
                warn!(id = %req.video_id, error = %e, "Download failed");
                self.emit_status_of(&req.video_id);
            }
        }

        // Cancelled and failed downloads may still have written chunks, so
        // the budget check runs on every outcome (the storage path just ran
        // its own, more aggressive pass).
        if !matches!(result, Err(DownloadError::Storage(_))) {
            if let Err(e) = self.inner.evictor.maybe_evict(&self.inner.store, &protected) {
                warn!(error = %e, "Eviction pass failed");
            }
        }

        self.dispatch();
    }

    // ---- backpressure ----

    fn apply_signal(&self, signal: BackpressureSignal) {
        info!(signal = %signal, "Applying backpressure signal");
        match signal {
            BackpressureSignal::PreemptiveFlush => {
                let mut st = self.lock();
                let dropped = st.queue.drop_below(Priority::Medium);
                st.prefetch_paused = true;
                debug!(dropped, "Preemptive flush: low-priority queue cleared");
            }
            BackpressureSignal::DegradeQuality => {
                self.emit(CacheEvent::Degrade(signal));
            }
            BackpressureSignal::CacheClear => {
                let protected = {
                    let mut st = self.lock();
                    let st = &mut *st;
                    let dropped = st.queue.drop_below(Priority::High);
                    st.prefetch_paused = true;
                    for (id, inflight) in &st.in_flight {
                        if inflight.priority < Priority::High && !inflight.cancel.is_cancelled() {
                            inflight.cancel.cancel();
                            st.stats.cancelled += 1;
                            debug!(id = %id, "Cancelled non-critical download for cache clear");
                        }
                    }
                    debug!(dropped, "Cache clear: medium and low queue cleared");
                    st.protected.clone()
                };
                if let Err(e) = self.inner.evictor.shrink_to(
                    &self.inner.store,
                    &protected,
                    self.inner.budget.target_after_cleanup,
                ) {
                    warn!(error = %e, "Cache-clear eviction failed");
                }
                self.emit(CacheEvent::Degrade(signal));
            }
        }
    }

    // ---- diagnostics ----

    pub fn stats(&self) -> SchedulerStats {
        self.lock().stats.clone()
    }

    pub fn queued_count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn active_downloads(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn emit(&self, event: CacheEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    fn emit_status_of(&self, id: &str) {
        if let Some(asset) = self.inner.store.get(id) {
            self.emit(CacheEvent::StatusChanged {
                id: id.to_string(),
                status: asset.status,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_priority(&self, id: &str) -> Option<Priority> {
        self.lock().queue.current_priority(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::asset::ByteRange;
    use crate::fetch::client::{FetchError, ProbeResult};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Serves `size` bytes per asset; tracks peak concurrent range fetches.
    struct FakeFetcher {
        size: u64,
        delay: Duration,
        probe_error: Option<FetchError>,
        concurrent: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(size: u64) -> Self {
            Self {
                size,
                delay: Duration::from_millis(0),
                probe_error: None,
                concurrent: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn with_probe_error(mut self, error: FetchError) -> Self {
            self.probe_error = Some(error);
            self
        }
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn probe(&self, _url: &str) -> Result<ProbeResult, FetchError> {
            if let Some(error) = &self.probe_error {
                return Err(error.clone());
            }
            Ok(ProbeResult {
                total_bytes: Some(self.size),
                accepts_ranges: true,
            })
        }

        async fn fetch_range(&self, _url: &str, range: ByteRange) -> Result<Bytes, FetchError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            let len = range.len().min(self.size.saturating_sub(range.start));
            Ok(Bytes::from(vec![0u8; len as usize]))
        }

        async fn fetch_whole(
            &self,
            _url: &str,
        ) -> Result<BoxStream<'static, Result<Bytes, FetchError>>, FetchError> {
            let data = vec![0u8; self.size as usize];
            Ok(futures::stream::iter(vec![Ok(Bytes::from(data))]).boxed())
        }
    }

    fn test_config(max_concurrent: usize) -> Config {
        let mut config = Config::default();
        config.budget.max_concurrent_downloads = max_concurrent;
        config.budget.max_bytes = 10_000_000;
        config.download.chunk_size_bytes = 64;
        config.download.retry_backoff_ms = 1;
        config
    }

    fn scheduler_with(
        tmp: &TempDir,
        fetcher: Arc<FakeFetcher>,
        max_concurrent: usize,
    ) -> PrefetchScheduler {
        let config = test_config(max_concurrent);
        let store = AssetStore::open(tmp.path(), config.download.retry_limit).unwrap();
        PrefetchScheduler::new(store, fetcher, config)
    }

    fn item(index: i64, id: &str) -> FeedItem {
        FeedItem {
            index,
            id: id.to_string(),
            url: format!("http://o/{id}.mp4"),
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_resolve_miss_returns_origin_then_local() {
        let tmp = TempDir::new().unwrap();
        let sched = scheduler_with(&tmp, Arc::new(FakeFetcher::new(256)), 2);

        let source = sched.resolve("v1", "http://o/v1.mp4");
        assert_eq!(source, ResolvedSource::Remote("http://o/v1.mp4".into()));

        wait_until(|| {
            sched
                .store()
                .get("v1")
                .map(|a| a.status == AssetStatus::FullyCached)
                .unwrap_or(false)
        })
        .await;

        let source = sched.resolve("v1", "http://o/v1.mp4");
        assert!(source.is_local());
        // Idempotent: resolving again returns the same path, enqueues nothing.
        let again = sched.resolve("v1", "http://o/v1.mp4");
        assert_eq!(source, again);
        assert_eq!(sched.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_bound_holds() {
        let tmp = TempDir::new().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(128).with_delay(Duration::from_millis(10)));
        let sched = scheduler_with(&tmp, fetcher.clone(), 2);

        let ctx = FeedContext {
            current_index: 0,
            visible_indices: vec![0, 1],
            window: 5,
            items: (0..6).map(|i| item(i, &format!("v{i}"))).collect(),
        };
        sched.update_context_at(&ctx, 0);

        wait_until(|| sched.stats().completed >= 6).await;

        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(sched.active_downloads(), 0);
    }

    #[tokio::test]
    async fn test_context_derives_priorities() {
        let tmp = TempDir::new().unwrap();
        // Zero slots: nothing dispatches, the queue stays inspectable.
        let sched = scheduler_with(&tmp, Arc::new(FakeFetcher::new(128)), 0);

        let ctx = FeedContext {
            current_index: 2,
            visible_indices: vec![2, 3],
            window: 3,
            items: (0..8).map(|i| item(i, &format!("v{i}"))).collect(),
        };
        sched.update_context_at(&ctx, 0);

        assert_eq!(sched.queued_priority("v2"), Some(Priority::Critical));
        assert_eq!(sched.queued_priority("v3"), Some(Priority::High));
        // Within the window but off-screen.
        assert_eq!(sched.queued_priority("v1"), Some(Priority::Medium));
        assert_eq!(sched.queued_priority("v4"), Some(Priority::Medium));
        assert_eq!(sched.queued_priority("v5"), Some(Priority::Medium));
        // Outside the window entirely.
        assert_eq!(sched.queued_priority("v6"), None);
        assert_eq!(sched.queued_priority("v7"), None);
    }

    #[tokio::test]
    async fn test_context_update_supersedes_stale_ids() {
        let tmp = TempDir::new().unwrap();
        let sched = scheduler_with(&tmp, Arc::new(FakeFetcher::new(128)), 0);

        let ctx = FeedContext {
            current_index: 0,
            visible_indices: vec![0],
            window: 2,
            items: (0..3).map(|i| item(i, &format!("v{i}"))).collect(),
        };
        sched.update_context_at(&ctx, 0);
        assert!(sched.queued_priority("v1").is_some());

        // User jumped far ahead; old ids leave the queue.
        let ctx = FeedContext {
            current_index: 20,
            visible_indices: vec![20],
            window: 2,
            items: (19..23).map(|i| item(i, &format!("v{i}"))).collect(),
        };
        sched.update_context_at(&ctx, 100);
        assert_eq!(sched.queued_priority("v1"), None);
        assert!(sched.queued_priority("v20").is_some());
    }

    #[tokio::test]
    async fn test_fast_scroll_recenters_on_settle_index() {
        let tmp = TempDir::new().unwrap();
        let sched = scheduler_with(&tmp, Arc::new(FakeFetcher::new(128)), 0);

        // Hard fling forward from item 0: settle far ahead.
        let mut ts = 0u64;
        let mut pos = 0.0;
        for _ in 0..8 {
            sched.sample(pos, ts);
            ts += 16;
            pos += 60.0 * 16.0;
        }

        let ctx = FeedContext {
            current_index: 7,
            visible_indices: vec![7],
            window: 2,
            items: (0..40).map(|i| item(i, &format!("v{i}"))).collect(),
        };
        sched.update_context_at(&ctx, ts);

        // Items near the predicted settle point are queued even though they
        // are far from the current index.
        let settled_nearby = (20..32).any(|i| sched.queued_priority(&format!("v{i}")).is_some());
        assert!(settled_nearby);
    }

    #[tokio::test]
    async fn test_cache_clear_drops_noncritical_queue() {
        let tmp = TempDir::new().unwrap();
        let sched = scheduler_with(&tmp, Arc::new(FakeFetcher::new(128)), 0);
        let mut events = sched.subscribe();

        let ctx = FeedContext {
            current_index: 0,
            visible_indices: vec![0, 1],
            window: 4,
            items: (0..5).map(|i| item(i, &format!("v{i}"))).collect(),
        };
        sched.update_context_at(&ctx, 0);
        assert!(sched.queued_count() >= 4);

        // Eight dropped frames within a second.
        for _ in 0..8 {
            sched.record_frame_interval(30.0);
        }

        // Critical/High work survives, Medium/Low is gone.
        assert_eq!(sched.queued_priority("v0"), Some(Priority::Critical));
        assert_eq!(sched.queued_priority("v1"), Some(Priority::High));
        assert_eq!(sched.queued_priority("v2"), None);
        assert_eq!(sched.queued_priority("v3"), None);

        let mut saw_clear = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CacheEvent::Degrade(BackpressureSignal::CacheClear)) {
                saw_clear = true;
            }
        }
        assert!(saw_clear);
    }

    #[tokio::test]
    async fn test_failed_asset_retries_only_when_hot() {
        let tmp = TempDir::new().unwrap();
        let sched = scheduler_with(&tmp, Arc::new(FakeFetcher::new(128)), 0);
        sched
            .store()
            .mark_failed("v1", "http://o/v1.mp4", "gone", true)
            .unwrap();

        // Medium-band context: the failed asset is not requeued.
        let ctx = FeedContext {
            current_index: 3,
            visible_indices: vec![3],
            window: 3,
            items: (0..5).map(|i| item(i, &format!("v{i}"))).collect(),
        };
        sched.update_context_at(&ctx, 0);
        assert_eq!(sched.queued_priority("v1"), None);

        // User scrolls back to it: High band, retry allowed.
        let ctx = FeedContext {
            current_index: 1,
            visible_indices: vec![1, 2],
            window: 3,
            items: (0..5).map(|i| item(i, &format!("v{i}"))).collect(),
        };
        sched.update_context_at(&ctx, 100);
        assert_eq!(sched.queued_priority("v1"), Some(Priority::Critical));
    }

    #[tokio::test]
    async fn test_status_events_reach_subscribers() {
        let tmp = TempDir::new().unwrap();
        let sched = scheduler_with(&tmp, Arc::new(FakeFetcher::new(64)), 1);
        let mut events = sched.subscribe();

        sched.resolve("v1", "http://o/v1.mp4");
        wait_until(|| sched.stats().completed >= 1).await;

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CacheEvent::StatusChanged { id, status } = event {
                assert_eq!(id, "v1");
                statuses.push(status);
            }
        }
        assert_eq!(statuses.first(), Some(&AssetStatus::Downloading));
        assert_eq!(statuses.last(), Some(&AssetStatus::FullyCached));
    }

    #[tokio::test]
    async fn test_eviction_runs_after_failed_download() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(1);
        config.budget.max_bytes = 100;
        config.budget.cleanup_threshold = 0.5;
        config.budget.target_after_cleanup = 0.2;

        let fetcher = Arc::new(FakeFetcher::new(128).with_probe_error(FetchError::NotFound));
        let store = AssetStore::open(tmp.path(), config.download.retry_limit).unwrap();
        let sched = PrefetchScheduler::new(store, fetcher, config);

        // Over the cleanup trigger before any download runs.
        sched
            .store()
            .write_chunk("stale", "http://o/stale.mp4", 0, &[0u8; 64])
            .unwrap();

        let ctx = FeedContext {
            current_index: 0,
            visible_indices: vec![0],
            window: 1,
            items: vec![item(0, "v0")],
        };
        sched.update_context_at(&ctx, 0);

        // The download dies at the probe; the budget pass must still run.
        wait_until(|| sched.stats().failed >= 1).await;
        wait_until(|| sched.store().total_cached_bytes() <= 20).await;
        assert!(sched.store().get("stale").is_none());
    }

    #[tokio::test]
    async fn test_resolve_records_access_on_cold_asset() {
        let tmp = TempDir::new().unwrap();
        // Zero slots: the asset stays cold, only the access stats move.
        let sched = scheduler_with(&tmp, Arc::new(FakeFetcher::new(128)), 0);

        sched.resolve("v1", "http://o/v1.mp4");

        let asset = sched.store().get("v1").expect("record created on resolve");
        assert_eq!(asset.access_count, 1);
        assert!(asset.last_accessed_ms > 0);

        sched.resolve("v1", "http://o/v1.mp4");
        assert_eq!(sched.store().get("v1").unwrap().access_count, 2);
    }
}
