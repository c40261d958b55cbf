//! Runtime configuration for feed-video-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All budget/threshold knobs (byte budget, concurrency, scroll thresholds,
//! frame-drop tiers) live here.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cache byte budget and eviction watermarks.
    pub budget: CacheBudget,

    /// Chunked download tuning.
    pub download: DownloadConfig,

    /// Scroll velocity classification.
    pub scroll: ScrollConfig,

    /// Frame-drop backpressure tiers.
    pub backpressure: BackpressureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            budget: CacheBudget::default(),
            download: DownloadConfig::default(),
            scroll: ScrollConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

/// Cache byte budget and eviction watermarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheBudget {
    /// Maximum bytes of cached video payload on disk.
    pub max_bytes: u64,

    /// Maximum simultaneously dispatched downloads.
    pub max_concurrent_downloads: usize,

    /// Fraction of `max_bytes` that triggers an eviction pass.
    pub cleanup_threshold: f64,

    /// Fraction of `max_bytes` eviction shrinks down to.
    pub target_after_cleanup: f64,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            max_bytes: 500 * 1024 * 1024, // 500 MB
            max_concurrent_downloads: 2,
            cleanup_threshold: 0.90,
            target_after_cleanup: 0.70,
        }
    }
}

impl CacheBudget {
    /// Byte total above which an eviction pass should run.
    pub fn cleanup_trigger_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.cleanup_threshold) as u64
    }

    /// Byte total eviction shrinks to.
    pub fn cleanup_target_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.target_after_cleanup) as u64
    }
}

/// Chunked download tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Bytes per range request.
    pub chunk_size_bytes: u64,

    /// Per-chunk fetch timeout in milliseconds.
    pub chunk_timeout_ms: u64,

    /// Transient failures tolerated per asset before it is marked failed.
    pub retry_limit: u32,

    /// Linear backoff unit between retries, in milliseconds.
    /// Attempt `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 512 * 1024, // 512 KB
            chunk_timeout_ms: 4_000,
            retry_limit: 3,
            retry_backoff_ms: 250,
        }
    }
}

/// Scroll velocity classification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrollConfig {
    /// |velocity| below this (units/ms) classifies as Idle.
    pub idle_velocity_threshold: f64,

    /// |velocity| above this (units/ms) classifies as Fast.
    pub fast_velocity_threshold: f64,

    /// Samples older than this are dropped from the window, in milliseconds.
    pub sample_window_ms: u64,

    /// Maximum samples retained in the window.
    pub max_samples: usize,

    /// No samples for this long decays the regime to Idle (scroll-end detector).
    pub quiet_period_ms: u64,

    /// Per-frame exponential velocity decay used by the settle predictor.
    pub settle_decay: f64,

    /// Predictor stops projecting once |velocity| falls below this (units/ms).
    pub settle_stop_velocity: f64,

    /// Feed item extent in scroll units, used to map settle position to an index.
    pub item_extent: f64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            idle_velocity_threshold: 5.0,
            fast_velocity_threshold: 40.0,
            sample_window_ms: 1_000,
            max_samples: 8,
            quiet_period_ms: 150,
            settle_decay: 0.95,
            settle_stop_velocity: 0.5,
            item_extent: 1_000.0,
        }
    }
}

/// Frame-drop backpressure tiers.
///
/// A frame interval longer than `frame_budget_ms * drop_factor` counts as a
/// dropped frame; drop counts are evaluated over a trailing one-second window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Target frame interval in milliseconds (16.6 for 60 fps).
    pub frame_budget_ms: f64,

    /// Multiplier over the frame budget that counts as a drop.
    pub drop_factor: f64,

    /// Drops per second that trigger a preemptive flush.
    pub flush_threshold: u32,

    /// Drops per second that trigger a quality degrade request.
    pub degrade_threshold: u32,

    /// Drops per second that trigger a cache clear.
    pub clear_threshold: u32,

    /// Minimum virtual time between repeated emissions of the same signal, ms.
    pub signal_cooldown_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            frame_budget_ms: 16.6,
            drop_factor: 1.5,
            flush_threshold: 3,
            degrade_threshold: 5,
            clear_threshold: 8,
            signal_cooldown_ms: 1_000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for a missing file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

}
