//! Adaptive video cache and prefetch engine for a vertically scrolling
//! short-video feed.
//!
//! The engine sits between the feed UI and the network. The UI reports
//! scroll samples, frame timings, and feed context; the engine keeps a
//! budget-bounded on-disk cache of video payloads warm around the user's
//! position and hands back a playable source per video id without ever
//! blocking playback on the network.
//!
//! Layout:
//! - [`cache`]: persistent asset store, range bookkeeping, LRU-style evictor
//! - [`fetch`]: HTTP range probing and resumable chunked downloads
//! - [`signal`]: scroll velocity classification and render backpressure
//! - [`sched`]: the priority queue and the orchestrating scheduler
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use feed_video_cache::config::Config;
//! use feed_video_cache::cache::store::AssetStore;
//! use feed_video_cache::fetch::client::HttpFetcher;
//! use feed_video_cache::sched::scheduler::PrefetchScheduler;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load(std::path::Path::new("cache.json"))?;
//! let store = AssetStore::open("/var/cache/feed", config.download.retry_limit)?;
//! let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(10))?);
//! let scheduler = PrefetchScheduler::new(store, fetcher, config);
//!
//! let source = scheduler.resolve("vid-123", "https://cdn.example/vid-123.mp4");
//! println!("play from {}", source.uri());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod fetch;
pub mod sched;
pub mod signal;

pub use cache::asset::{AssetStatus, VideoAsset};
pub use cache::store::AssetStore;
pub use config::Config;
pub use sched::queue::Priority;
pub use sched::scheduler::{
    CacheEvent, FeedContext, FeedItem, PrefetchScheduler, ResolvedSource,
};
pub use signal::backpressure::BackpressureSignal;
pub use signal::scroll::{ScrollRegime, ScrollState};
