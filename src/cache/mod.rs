//! Durable video cache: records, storage, and eviction.
//!
//! - [`asset`]: VideoAsset records and byte-range bookkeeping
//! - [`store`]: single-writer durable store for records + payload files
//! - [`evictor`]: LRU+frequency eviction under the byte budget

pub mod asset;
pub mod evictor;
pub mod store;
