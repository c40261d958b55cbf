//! Render-loop health monitoring and degrade signals.
//!
//! The monitor consumes one frame interval per render tick and counts
//! dropped frames (intervals well over the frame budget) in a trailing
//! one-second window. Sustained drops emit escalating [`BackpressureSignal`]s.
//! The monitor never touches the cache itself — the scheduler subscribes to
//! the signals and applies policy.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BackpressureConfig;

/// Degrade instruction, in escalating severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackpressureSignal {
    /// Pause non-critical prefetch and drop Low-priority queued work.
    PreemptiveFlush,
    /// Ask the UI layer to request a lower-bitrate source.
    DegradeQuality,
    /// Cancel non-critical work and aggressively shrink the cache.
    CacheClear,
}

impl std::fmt::Display for BackpressureSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackpressureSignal::PreemptiveFlush => write!(f, "preemptive-flush"),
            BackpressureSignal::DegradeQuality => write!(f, "degrade-quality"),
            BackpressureSignal::CacheClear => write!(f, "cache-clear"),
        }
    }
}

const WINDOW_MS: f64 = 1_000.0;

/// Watches frame timing and emits degrade signals on sustained drops.
///
/// Time is virtual: the sum of reported intervals. No wall clock is read, so
/// behavior is fully deterministic under test.
pub struct AdaptiveBackpressureMonitor {
    config: BackpressureConfig,

    /// Virtual now: cumulative reported frame time, ms.
    now_ms: f64,

    /// Virtual timestamps of recent dropped frames.
    drops: VecDeque<f64>,

    /// Virtual time each signal tier last fired, for cooldown.
    last_fired: [Option<f64>; 3],
}

impl AdaptiveBackpressureMonitor {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            now_ms: 0.0,
            drops: VecDeque::new(),
            last_fired: [None; 3],
        }
    }

    /// Record one render-tick interval; returns the highest newly triggered
    /// signal, if any.
    pub fn record_frame_interval(&mut self, interval_ms: f64) -> Option<BackpressureSignal> {
        self.now_ms += interval_ms;

        let drop_cutoff = self.config.frame_budget_ms * self.config.drop_factor;
        if interval_ms > drop_cutoff {
            self.drops.push_back(self.now_ms);
        }

        let window_start = self.now_ms - WINDOW_MS;
        while let Some(&front) = self.drops.front() {
            if front < window_start {
                self.drops.pop_front();
            } else {
                break;
            }
        }

        let drops = self.drops.len() as u32;
        let candidate = if drops >= self.config.clear_threshold {
            Some(BackpressureSignal::CacheClear)
        } else if drops >= self.config.degrade_threshold {
            Some(BackpressureSignal::DegradeQuality)
        } else if drops >= self.config.flush_threshold {
            Some(BackpressureSignal::PreemptiveFlush)
        } else {
            None
        };

        let signal = candidate?;
        let slot = signal as usize;
        let cooled_down = self.last_fired[slot]
            .map(|t| self.now_ms - t >= self.config.signal_cooldown_ms as f64)
            .unwrap_or(true);
        if !cooled_down {
            return None;
        }

        self.last_fired[slot] = Some(self.now_ms);
        debug!(drops, signal = %signal, "Backpressure signal");
        Some(signal)
    }

    /// Dropped-frame count inside the current window.
    pub fn recent_drops(&self) -> usize {
        self.drops.len()
    }
}
