//! Scroll velocity tracking and regime classification.
//!
//! Raw scroll-position samples go in; a [`ScrollState`] comes out: signed
//! velocity, an Idle/Slow/Fast regime bucket, and a predicted settle index
//! from a simple exponential-deceleration model. All clocks are explicit
//! caller-supplied timestamps so the tracker stays deterministic under test.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::ScrollConfig;

/// Classified scroll speed bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrollRegime {
    Idle,
    Slow,
    Fast,
}

impl std::fmt::Display for ScrollRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScrollRegime::Idle => write!(f, "idle"),
            ScrollRegime::Slow => write!(f, "slow"),
            ScrollRegime::Fast => write!(f, "fast"),
        }
    }
}

/// Point-in-time view of scroll kinematics.
#[derive(Debug, Clone, Copy)]
pub struct ScrollState {
    /// Signed velocity in scroll units per millisecond.
    pub velocity: f64,

    /// Speed bucket derived from |velocity|.
    pub regime: ScrollRegime,

    /// Feed index the scroll is predicted to settle on.
    pub predicted_settle_index: i64,

    /// Prediction confidence in `[0, 1]`; scales with window fill and
    /// direction consistency.
    pub confidence: f64,
}

impl ScrollState {
    fn idle_at(index: i64) -> Self {
        Self {
            velocity: 0.0,
            regime: ScrollRegime::Idle,
            predicted_settle_index: index,
            confidence: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    position: f64,
    timestamp_ms: u64,
}

/// Consumes raw scroll samples and classifies the current regime.
pub struct ScrollVelocityTracker {
    config: ScrollConfig,
    samples: VecDeque<Sample>,
}

impl ScrollVelocityTracker {
    pub fn new(config: ScrollConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
        }
    }

    /// Append a scroll-position sample.
    ///
    /// Samples older than the rolling window (or beyond the window capacity)
    /// are discarded. Out-of-order timestamps are ignored.
    pub fn sample(&mut self, position: f64, timestamp_ms: u64) {
        if let Some(last) = self.samples.back() {
            if timestamp_ms < last.timestamp_ms {
                return;
            }
        }
        self.samples.push_back(Sample {
            position,
            timestamp_ms,
        });

        let cutoff = timestamp_ms.saturating_sub(self.config.sample_window_ms);
        while let Some(front) = self.samples.front() {
            if front.timestamp_ms < cutoff || self.samples.len() > self.config.max_samples {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current state, evaluated at `now_ms`.
    ///
    /// A quiet period with no samples decays the regime to `Idle` — this is
    /// the scroll-end detector.
    pub fn state(&self, now_ms: u64) -> ScrollState {
        let Some(last) = self.samples.back() else {
            return ScrollState::idle_at(0);
        };
        let current_index = self.index_for(last.position);

        if now_ms.saturating_sub(last.timestamp_ms) >= self.config.quiet_period_ms {
            return ScrollState::idle_at(current_index);
        }

        let velocity = self.weighted_velocity();
        let regime = if velocity.abs() < self.config.idle_velocity_threshold {
            ScrollRegime::Idle
        } else if velocity.abs() > self.config.fast_velocity_threshold {
            ScrollRegime::Fast
        } else {
            ScrollRegime::Slow
        };

        if regime == ScrollRegime::Idle {
            return ScrollState::idle_at(current_index);
        }

        ScrollState {
            velocity,
            regime,
            predicted_settle_index: self.project_settle_index(last.position, velocity),
            confidence: self.confidence(velocity),
        }
    }

    /// Recency-weighted average of per-sample velocity deltas.
    fn weighted_velocity(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (i, pair) in self.samples.iter().zip(self.samples.iter().skip(1)).enumerate() {
            let (a, b) = pair;
            let dt = (b.timestamp_ms - a.timestamp_ms) as f64;
            if dt <= 0.0 {
                continue;
            }
            let v = (b.position - a.position) / dt;
            let weight = (i + 1) as f64;
            weighted_sum += v * weight;
            weight_total += weight;
        }
        if weight_total > 0.0 {
            weighted_sum / weight_total
        } else {
            0.0
        }
    }

    /// Project the settle position assuming exponential velocity decay.
    ///
    /// Velocity decays by `settle_decay` each 16ms frame until it falls below
    /// the stop threshold; the geometric series gives the total displacement
    /// in closed form, capped at the frame where decay crosses the stop
    /// threshold.
    fn project_settle_index(&self, position: f64, velocity: f64) -> i64 {
        const FRAME_MS: f64 = 16.0;
        let decay = self.config.settle_decay.clamp(0.0, 0.999);
        let stop = self.config.settle_stop_velocity.max(1e-6);

        let mut pos = position;
        let mut v = velocity;
        // Bounded: 0.95^300 of even extreme velocities is under any stop threshold.
        for _ in 0..300 {
            if v.abs() < stop {
                break;
            }
            pos += v * FRAME_MS;
            v *= decay;
        }
        self.index_for(pos)
    }

    fn index_for(&self, position: f64) -> i64 {
        (position / self.config.item_extent).round() as i64
    }

    fn confidence(&self, velocity: f64) -> f64 {
        let fill = self.samples.len() as f64 / self.config.max_samples as f64;

        let mut consistent = 0usize;
        let mut total = 0usize;
        for (a, b) in self.samples.iter().zip(self.samples.iter().skip(1)) {
            let delta = b.position - a.position;
            if delta != 0.0 {
                total += 1;
                if delta.signum() == velocity.signum() {
                    consistent += 1;
                }
            }
        }
        let consistency = if total > 0 {
            consistent as f64 / total as f64
        } else {
            0.0
        };
        (fill * consistency).clamp(0.0, 1.0)
    }
}
