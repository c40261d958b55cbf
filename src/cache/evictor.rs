//! Eviction policy: enforces the cache byte budget.
//!
//! Candidates are scored classic LRU + frequency: fewest accesses first,
//! ties broken by oldest last access. Assets that are mid-download or in the
//! scheduler's protected set (currently visible / Critical / High) are never
//! touched, even if that leaves the budget exceeded for a while.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::cache::asset::{AssetStatus, VideoAsset};
use crate::cache::store::{AssetStore, StoreError};
use crate::config::CacheBudget;

/// An eviction candidate with its ordering key.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub id: String,
    pub access_count: u64,
    pub last_accessed_ms: u64,
    pub bytes: u64,
}

impl EvictionCandidate {
    fn score_key(&self) -> (u64, u64) {
        (self.access_count, self.last_accessed_ms)
    }
}

/// Result of one eviction pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvictionOutcome {
    pub evicted: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// The eviction policy engine.
pub struct CacheEvictor {
    budget: CacheBudget,
}

impl CacheEvictor {
    pub fn new(budget: CacheBudget) -> Self {
        Self { budget }
    }

    /// Run eviction if total cached bytes exceed the cleanup threshold.
    ///
    /// Called after every successful chunk write; cheap when under budget.
    pub fn maybe_evict(
        &self,
        store: &AssetStore,
        protected: &HashSet<String>,
    ) -> Result<EvictionOutcome, StoreError> {
        let total = store.total_cached_bytes();
        if total <= self.budget.cleanup_trigger_bytes() {
            return Ok(EvictionOutcome {
                remaining_bytes: total,
                ..Default::default()
            });
        }
        self.evict_down_to(store, protected, self.budget.cleanup_target_bytes())
    }

    /// Aggressive variant: shrink to an explicit fraction of the budget.
    ///
    /// Used by the backpressure `CacheClear` path.
    pub fn shrink_to(
        &self,
        store: &AssetStore,
        protected: &HashSet<String>,
        fraction: f64,
    ) -> Result<EvictionOutcome, StoreError> {
        let target = (self.budget.max_bytes as f64 * fraction) as u64;
        self.evict_down_to(store, protected, target)
    }

    fn evict_down_to(
        &self,
        store: &AssetStore,
        protected: &HashSet<String>,
        target_bytes: u64,
    ) -> Result<EvictionOutcome, StoreError> {
        let snapshot = store.snapshot();
        let mut candidates = Self::rank_candidates(&snapshot, protected);

        let mut remaining: u64 = snapshot.iter().map(|a| a.cached_bytes()).sum();
        let mut outcome = EvictionOutcome::default();

        while remaining > target_bytes {
            let Some(victim) = candidates.pop() else {
                // Only protected/in-flight assets left; budget stays exceeded.
                debug!(
                    remaining,
                    target_bytes, "Eviction exhausted unprotected candidates"
                );
                break;
            };
            let freed = store.remove(&victim.id)?;
            remaining = remaining.saturating_sub(freed);
            outcome.evicted += 1;
            outcome.freed_bytes += freed;
            debug!(
                id = %victim.id,
                freed,
                access_count = victim.access_count,
                "Evicted asset"
            );
        }

        outcome.remaining_bytes = remaining;
        if outcome.evicted > 0 {
            info!(
                evicted = outcome.evicted,
                freed = outcome.freed_bytes,
                remaining,
                "Eviction pass complete"
            );
        }
        Ok(outcome)
    }

    /// Rank evictable assets; the best victim ends up last (pop order).
    fn rank_candidates(
        snapshot: &[VideoAsset],
        protected: &HashSet<String>,
    ) -> Vec<EvictionCandidate> {
        let mut candidates: Vec<EvictionCandidate> = snapshot
            .iter()
            .filter(|a| a.status != AssetStatus::Downloading)
            .filter(|a| !protected.contains(&a.id))
            .filter(|a| a.cached_bytes() > 0)
            .map(|a| EvictionCandidate {
                id: a.id.clone(),
                access_count: a.access_count,
                last_accessed_ms: a.last_accessed_ms,
                bytes: a.cached_bytes(),
            })
            .collect();

        // Descending so that pop() yields lowest access count / oldest first.
        candidates.sort_by(|a, b| b.score_key().cmp(&a.score_key()));
        candidates
    }
}
