//! Scenario tests driving the full engine: scheduler, downloader, store,
//! evictor, and signals together, with a scripted in-memory origin.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tempfile::TempDir;

use feed_video_cache::cache::asset::{AssetStatus, ByteRange};
use feed_video_cache::cache::store::AssetStore;
use feed_video_cache::config::Config;
use feed_video_cache::fetch::client::{FetchError, MediaFetcher, ProbeResult};
use feed_video_cache::sched::scheduler::{
    CacheEvent, FeedContext, FeedItem, PrefetchScheduler,
};

/// Origin that serves `size` zero bytes per asset and records the order in
/// which assets were first fetched.
struct ScriptedOrigin {
    size: u64,
    delay: Duration,
    fetch_order: Mutex<Vec<String>>,
    concurrent: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedOrigin {
    fn new(size: u64) -> Self {
        Self {
            size,
            delay: Duration::from_millis(0),
            fetch_order: Mutex::new(Vec::new()),
            concurrent: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn id_from_url(url: &str) -> String {
        url.rsplit('/')
            .next()
            .unwrap_or(url)
            .trim_end_matches(".mp4")
            .to_string()
    }

    fn fetched_ids(&self) -> Vec<String> {
        self.fetch_order.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaFetcher for ScriptedOrigin {
    async fn probe(&self, _url: &str) -> Result<ProbeResult, FetchError> {
        Ok(ProbeResult {
            total_bytes: Some(self.size),
            accepts_ranges: true,
        })
    }

    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, FetchError> {
        if range.start == 0 {
            self.fetch_order.lock().unwrap().push(Self::id_from_url(url));
        }
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

fn config(max_bytes: u64, max_concurrent: usize) -> Config {
    let mut config = Config::default();
    config.budget.max_bytes = max_bytes;
    config.budget.max_concurrent_downloads = max_concurrent;
    config.budget.cleanup_threshold = 0.9;
    config.budget.target_after_cleanup = 0.7;
    config.download.chunk_size_bytes = 128;
    config.download.retry_backoff_ms = 1;
    config
}

/// Scenario failures are easier to read with the engine's own logs; run with
/// `RUST_LOG=feed_video_cache=debug` to see them.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build(
    tmp: &TempDir,
    origin: Arc<ScriptedOrigin>,
    config: Config,
) -> PrefetchScheduler {
    init_logging();
    let store = AssetStore::open(tmp.path(), config.download.retry_limit).unwrap();
    PrefetchScheduler::new(store, origin, config)
}

fn item(index: i64, id: &str) -> FeedItem {
    FeedItem {
        index,
        id: id.to_string(),
        url: format!("http://origin.example/{id}.mp4"),
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_cold_start_warms_the_window() {
    let tmp = TempDir::new().unwrap();
    let origin = Arc::new(ScriptedOrigin::new(256));
    let sched = build(&tmp, origin, config(1_000_000, 2));

    // Cold cache: the current item resolves to origin immediately.
    let source = sched.resolve("v0", "http://origin.example/v0.mp4");
    assert!(!source.is_local());

    let ctx = FeedContext {
        current_index: 0,
        visible_indices: vec![0, 1],
        window: 3,
        items: (0..5).map(|i| item(i, &format!("v{i}"))).collect(),
    };
    sched.update_context_at(&ctx, 0);

    wait_until(|| {
        (0..4).all(|i| {
            sched
                .store()
                .get(&format!("v{i}"))
                .map(|a| a.status == AssetStatus::FullyCached)
                .unwrap_or(false)
        })
    })
    .await;

    // A re-resolve now serves from disk.
    let source = sched.resolve("v0", "http://origin.example/v0.mp4");
    assert!(source.is_local());
    assert!(std::path::Path::new(&source.uri()).exists());
}

#[tokio::test]
async fn test_dispatch_order_follows_priority() {
    let tmp = TempDir::new().unwrap();
    let origin = Arc::new(ScriptedOrigin::new(128).with_delay(Duration::from_millis(5)));
    let sched = build(&tmp, origin.clone(), config(1_000_000, 1));

    let ctx = FeedContext {
        current_index: 2,
        visible_indices: vec![2, 3],
        window: 2,
        items: (0..5).map(|i| item(i, &format!("v{i}"))).collect(),
    };
    sched.update_context_at(&ctx, 0);

    wait_until(|| sched.stats().completed >= 5).await;

    let order = origin.fetched_ids();
    // Current item first, then the visible neighbor, then the rest.
    assert_eq!(&order[..2], &["v2".to_string(), "v3".to_string()]);
    assert_eq!(order.len(), 5);
}

#[tokio::test]
async fn test_concurrency_stays_bounded_under_load() {
    let tmp = TempDir::new().unwrap();
    let origin = Arc::new(ScriptedOrigin::new(256).with_delay(Duration::from_millis(5)));
    let sched = build(&tmp, origin.clone(), config(10_000_000, 2));

    let ctx = FeedContext {
        current_index: 0,
        visible_indices: vec![0],
        window: 9,
        items: (0..10).map(|i| item(i, &format!("v{i}"))).collect(),
    };
    sched.update_context_at(&ctx, 0);

    wait_until(|| sched.stats().completed >= 10).await;
    assert!(origin.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_budget_holds_across_a_long_scroll() {
    let tmp = TempDir::new().unwrap();
    let origin = Arc::new(ScriptedOrigin::new(300));
    let max_bytes = 1_000;
    let sched = build(&tmp, origin, config(max_bytes, 1));

    let items: Vec<FeedItem> = (0..8).map(|i| item(i, &format!("v{i}"))).collect();

    // Scroll through the feed one item at a time.
    for current in 0..8i64 {
        let ctx = FeedContext {
            current_index: current,
            visible_indices: vec![current],
            window: 1,
            items: items.clone(),
        };
        sched.update_context_at(&ctx, current as u64 * 500);
        wait_until(|| {
            sched
                .store()
                .get(&format!("v{current}"))
                .map(|a| a.status == AssetStatus::FullyCached)
                .unwrap_or(false)
        })
        .await;
    }

    wait_until(|| sched.active_downloads() == 0).await;
    assert!(sched.store().total_cached_bytes() <= max_bytes);
    // The item the user ended on is still cached.
    assert!(sched.store().get("v7").is_some());
}

#[tokio::test]
async fn test_backpressure_cascade_shrinks_cache() {
    let tmp = TempDir::new().unwrap();
    let origin = Arc::new(ScriptedOrigin::new(200));
    let mut cfg = config(2_000, 2);
    cfg.budget.target_after_cleanup = 0.5;
    let sched = build(&tmp, origin, cfg);
    let mut events = sched.subscribe();

    // Warm several assets first.
    let ctx = FeedContext {
        current_index: 0,
        visible_indices: vec![0],
        window: 5,
        items: (0..6).map(|i| item(i, &format!("v{i}"))).collect(),
    };
    sched.update_context_at(&ctx, 0);
    wait_until(|| sched.stats().completed >= 6).await;
    assert_eq!(sched.store().total_cached_bytes(), 1_200);

    // Sustained dropped frames escalate all the way to a cache clear.
    for _ in 0..8 {
        sched.record_frame_interval(40.0);
    }

    let mut saw_clear = false;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            CacheEvent::Degrade(feed_video_cache::BackpressureSignal::CacheClear)
        ) {
            saw_clear = true;
        }
    }
    assert!(saw_clear);

    // Shrunk to at most half the budget; the current item survives.
    assert!(sched.store().total_cached_bytes() <= 1_000);
    assert!(sched.store().get("v0").is_some());
}
