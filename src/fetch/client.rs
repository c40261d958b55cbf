//! HTTP boundary for media downloads.
//!
//! [`MediaFetcher`] is the seam between the download engine and the network:
//! production uses the reqwest-backed [`HttpFetcher`]; tests script an
//! in-memory fake. The probe path prefers a HEAD request and falls back to a
//! minimal `Range: bytes=0-0` GET, taking the total length from
//! `Content-Range` when present.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tracing::debug;

use crate::cache::asset::ByteRange;

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connect(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("resource not found")]
    NotFound,

    #[error("server does not support byte ranges")]
    RangeUnsupported,

    #[error("empty response body")]
    EmptyBody,

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Whether a retry with backoff is worthwhile.
    ///
    /// Timeouts, connection resets and 5xx are transient; 404 and range
    /// violations are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Connect(_) | FetchError::EmptyBody => true,
            FetchError::Status(code) => *code >= 500,
            FetchError::NotFound
            | FetchError::RangeUnsupported
            | FetchError::MalformedResponse(_) => false,
        }
    }
}

/// What a range probe learned about a resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeResult {
    /// Total resource size, when the server reported one.
    pub total_bytes: Option<u64>,

    /// Whether the server honors byte-range requests.
    pub accepts_ranges: bool,
}

/// Network boundary for probing and fetching media bytes.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Learn the total size and range support of a resource.
    async fn probe(&self, url: &str) -> Result<ProbeResult, FetchError>;

    /// Fetch one byte range `[range.start, range.end)`.
    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, FetchError>;

    /// Stream the whole resource, for servers without range support.
    async fn fetch_whole(
        &self,
        url: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, FetchError>>, FetchError>;
}

/// reqwest-backed fetcher sharing one pooled client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher with a bounded connect timeout.
    ///
    /// Per-transfer deadlines live in the downloader; the client-level bound
    /// only keeps a dead origin from pinning a connection attempt.
    pub fn new(connect_timeout: std::time::Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(Self::map_error)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn map_error(e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_connect() {
            FetchError::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Connect(e.to_string())
        }
    }

    fn check_status(status: reqwest::StatusCode) -> Result<(), FetchError> {
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(FetchError::NotFound)
        } else if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            Err(FetchError::MalformedResponse(
                "range not satisfiable".to_string(),
            ))
        } else if !status.is_success() {
            Err(FetchError::Status(status.as_u16()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn probe(&self, url: &str) -> Result<ProbeResult, FetchError> {
        // HEAD first: cheapest when the server cooperates.
        if let Ok(resp) = self.client.head(url).send().await {
            if resp.status().is_success() {
                let accepts_ranges = resp
                    .headers()
                    .get(reqwest::header::ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.eq_ignore_ascii_case("bytes"))
                    .unwrap_or(false);
                let total_bytes = resp.content_length();
                if total_bytes.is_some() {
                    debug!(url, ?total_bytes, accepts_ranges, "HEAD probe succeeded");
                    return Ok(ProbeResult {
                        total_bytes,
                        accepts_ranges,
                    });
                }
            }
        }

        // Fallback: minimal range request, total from Content-Range.
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check_status(resp.status())?;

        if resp.status() == reqwest::StatusCode::PARTIAL_CONTENT {
            let total = resp
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            debug!(url, ?total, "Range probe succeeded");
            Ok(ProbeResult {
                total_bytes: total,
                accepts_ranges: true,
            })
        } else {
            // Plain 200: server ignored the range header.
            Ok(ProbeResult {
                total_bytes: resp.content_length(),
                accepts_ranges: false,
            })
        }
    }

    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Bytes, FetchError> {
        // HTTP ranges are inclusive; ours are half-open.
        let header = format!("bytes={}-{}", range.start, range.end.saturating_sub(1));
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, header)
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check_status(resp.status())?;

        if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::RangeUnsupported);
        }

        let body = resp.bytes().await.map_err(Self::map_error)?;
        if body.len() as u64 > range.len() {
            return Err(FetchError::MalformedResponse(format!(
                "asked for {} bytes, got {}",
                range.len(),
                body.len()
            )));
        }
        Ok(body)
    }

    async fn fetch_whole(
        &self,
        url: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, FetchError>>, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check_status(resp.status())?;

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(Self::map_error))
            .boxed())
    }
}

/// Extract the total length from a `Content-Range: bytes 0-0/12345` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 100-200/5000"), Some(5000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::Connect("reset".into()).is_retryable());
        assert!(FetchError::Status(503).is_retryable());
        assert!(FetchError::EmptyBody.is_retryable());
        assert!(!FetchError::Status(403).is_retryable());
        assert!(!FetchError::NotFound.is_retryable());
        assert!(!FetchError::RangeUnsupported.is_retryable());
    }
}
