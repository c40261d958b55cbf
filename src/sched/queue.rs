//! Priority queue of prefetch requests.
//!
//! Strict priority across tiers (Critical > High > Medium > Low), FIFO by
//! enqueue sequence within a tier. Reprioritization and supersession use
//! lazy deletion: the id map holds the live sequence number and stale heap
//! entries are skipped on pop.

use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};

/// Dispatch priority, derived from visibility and feed distance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    /// Warm-cache candidates kept around opportunistically.
    Low,
    /// Within prefetch distance but not visible.
    Medium,
    /// Within one slot of the current index and visible.
    High,
    /// The item the user is actively watching.
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// One scheduling decision, alive until dispatched or superseded.
#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    pub video_id: String,
    pub url: String,
    pub priority: Priority,
    /// Position in the feed this request originated from.
    pub origin_index: i64,
    /// Monotonic enqueue sequence; the FIFO tie-break within a tier.
    pub seq: u64,
}

#[derive(Debug)]
struct Entry {
    request: PrefetchRequest,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.request.priority == other.request.priority && self.request.seq == other.request.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins, then the earlier sequence.
        self.request
            .priority
            .cmp(&other.request.priority)
            .then(other.request.seq.cmp(&self.request.seq))
    }
}

/// Queue accounting.
#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_dispatched: u64,
    pub total_superseded: u64,
}

/// Strict-priority FIFO queue keyed by video id.
#[derive(Default)]
pub struct RequestQueue {
    heap: BinaryHeap<Entry>,
    /// Live sequence number per queued id; heap entries that disagree are stale.
    live: HashMap<String, u64>,
    next_seq: u64,
    stats: QueueStats,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue (or requeue) a request for `id`.
    ///
    /// An id that is already queued at the same priority keeps its place;
    /// a different priority re-enqueues it at the back of the new tier.
    pub fn enqueue(&mut self, id: &str, url: &str, priority: Priority, origin_index: i64) {
        if let Some(existing) = self.current_priority(id) {
            if existing == priority {
                return;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(id.to_string(), seq);
        self.heap.push(Entry {
            request: PrefetchRequest {
                video_id: id.to_string(),
                url: url.to_string(),
                priority,
                origin_index,
                seq,
            },
        });
        self.stats.total_enqueued += 1;
    }

    /// Pop the highest-priority live request.
    pub fn pop(&mut self) -> Option<PrefetchRequest> {
        while let Some(entry) = self.heap.pop() {
            let id = &entry.request.video_id;
            if self.live.get(id) == Some(&entry.request.seq) {
                self.live.remove(id);
                self.stats.total_dispatched += 1;
                return Some(entry.request);
            }
            // Stale entry from a reprioritization or removal; skip.
        }
        None
    }

    /// Like [`RequestQueue::pop`], but only yields requests at or above `min`.
    ///
    /// Used while prefetch is paused: critical work still flows.
    pub fn pop_at_least(&mut self, min: Priority) -> Option<PrefetchRequest> {
        if self.peek_priority()? < min {
            return None;
        }
        self.pop()
    }

    /// Priority of the next live request without removing it.
    pub fn peek_priority(&mut self) -> Option<Priority> {
        while let Some(entry) = self.heap.peek() {
            if self.live.get(&entry.request.video_id) == Some(&entry.request.seq) {
                return Some(entry.request.priority);
            }
            self.heap.pop();
        }
        None
    }

    /// Drop a queued request with no side effects (context supersession).
    pub fn remove(&mut self, id: &str) -> bool {
        if self.live.remove(id).is_some() {
            self.stats.total_superseded += 1;
            true
        } else {
            false
        }
    }

    /// Drop every queued request below `min`. Returns how many were dropped.
    pub fn drop_below(&mut self, min: Priority) -> usize {
        let mut dropped = 0;
        let stale: Vec<String> = self
            .heap
            .iter()
            .filter(|e| {
                e.request.priority < min
                    && self.live.get(&e.request.video_id) == Some(&e.request.seq)
            })
            .map(|e| e.request.video_id.clone())
            .collect();
        for id in stale {
            if self.remove(&id) {
                dropped += 1;
            }
        }
        dropped
    }

    /// Current priority of a queued id.
    pub fn current_priority(&self, id: &str) -> Option<Priority> {
        let live_seq = self.live.get(id)?;
        self.heap
            .iter()
            .find(|e| e.request.video_id == id && e.request.seq == *live_seq)
            .map(|e| e.request.priority)
    }

    /// Whether `id` is queued.
    pub fn contains(&self, id: &str) -> bool {
        self.live.contains_key(id)
    }

    /// Ids of all live queued requests.
    pub fn queued_ids(&self) -> Vec<String> {
        self.live.keys().cloned().collect()
    }

    /// Number of live queued requests.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}
