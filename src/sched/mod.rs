//! Prefetch scheduling: the orchestrator over cache, fetch, and signals.
//!
//! - [`queue`]: strict-priority FIFO request queue
//! - [`scheduler`]: context-driven dispatch, resolve, and backpressure policy

pub mod queue;
pub mod scheduler;
