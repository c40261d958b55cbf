//! Progressive range-based downloading.
//!
//! - [`client`]: the `MediaFetcher` boundary and its reqwest implementation
//! - [`downloader`]: chunked download loop with retries and cancellation

pub mod client;
pub mod downloader;
