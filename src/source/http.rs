//! HTTP Range Source
//!
//! Byte-range access to a remote object over `HEAD` and ranged `GET`.
//!
//! # Protocol
//!
//! - `HEAD` once for length, `Last-Modified` and `ETag` (memoized, shared by
//!   concurrent callers)
//! - `GET` with `Range: bytes=A-B`, plus `If-Unmodified-Since` / `If-Match`
//!   when validation is on, so a mutated object fails with 412 instead of
//!   returning bytes from a different version
//! - `GET` with `Range: bytes=-N` to read the tail and learn the length from
//!   `Content-Range` in one round trip, before any `HEAD` has been made

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{
    HeaderMap, HeaderName, CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_MATCH, IF_UNMODIFIED_SINCE,
    LAST_MODIFIED, RANGE,
};
use reqwest::{Client, StatusCode, Url};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use super::retry::RetryPolicy;
use super::{check_range, ByteRangeSource};
use crate::backend::CachedByteRangeBackend;
use crate::cache::{BlockAnchor, BlockCache, SourceIdentity};
use crate::error::{Error, Result};

/// HTTP source configuration
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Object URL
    pub url: String,
    /// Send conditional headers and include the ETag in the source identity
    pub validate: bool,
    /// Deadline for each individual attempt
    pub timeout: Duration,
    /// Backoff for retryable failures
    pub retry: RetryPolicy,
    /// User-Agent header value
    pub user_agent: String,
}

impl HttpSourceConfig {
    /// Default configuration for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            validate: true,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            user_agent: format!("rangecache/{}", crate::VERSION),
        }
    }
}

/// Object metadata from `HEAD` (or a tail read)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub size: u64,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

struct RangeResponse {
    status: StatusCode,
    content_range: Option<String>,
    last_modified: Option<String>,
    etag: Option<String>,
    body: Bytes,
}

/// Byte source over HTTP range requests
pub struct HttpRangeSource {
    config: HttpSourceConfig,
    client: Client,
    /// Swapped for a fresh cell on `close()`
    metadata: Mutex<Arc<OnceCell<RemoteMetadata>>>,
}

impl HttpRangeSource {
    /// Create a source with its own HTTP client
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Self::with_client(config, client)
    }

    /// Create a source sharing an existing HTTP client
    pub fn with_client(config: HttpSourceConfig, client: Client) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("invalid URL '{}': {}", config.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "unsupported URL scheme '{}'",
                url.scheme()
            )));
        }

        Ok(Self {
            config,
            client,
            metadata: Mutex::new(Arc::new(OnceCell::new())),
        })
    }

    pub fn config(&self) -> &HttpSourceConfig {
        &self.config
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Object metadata, fetched on first use
    ///
    /// Concurrent callers share one `HEAD`. A failed fetch is not memoized.
    pub async fn metadata(&self) -> Result<RemoteMetadata> {
        let cell = self.metadata.lock().clone();
        cell.get_or_try_init(|| self.fetch_metadata())
            .await
            .cloned()
    }

    /// Metadata if it has already been fetched
    pub fn cached_metadata(&self) -> Option<RemoteMetadata> {
        self.metadata.lock().get().cloned()
    }

    /// Identity of the current object version, fetching metadata if needed
    pub async fn identity(&self) -> Result<SourceIdentity> {
        let meta = self.metadata().await?;
        Ok(self.identity_for(&meta))
    }

    /// Identity from already-fetched metadata, without I/O
    pub fn source_identity(&self) -> Option<SourceIdentity> {
        self.cached_metadata().map(|meta| self.identity_for(&meta))
    }

    fn identity_for(&self, meta: &RemoteMetadata) -> SourceIdentity {
        let etag = if self.config.validate {
            meta.etag.as_deref()
        } else {
            None
        };
        SourceIdentity::new(&self.config.url, meta.last_modified.as_deref(), etag)
    }

    /// Wrap this source in a block cache keyed by its current identity
    pub async fn into_cached(
        self: Arc<Self>,
        cache: Arc<dyn BlockCache>,
        anchor: BlockAnchor,
    ) -> Result<CachedByteRangeBackend> {
        let identity = self.identity().await?;
        Ok(CachedByteRangeBackend::new(self, cache, identity, anchor))
    }

    #[instrument(skip(self), fields(url = %self.config.url))]
    async fn fetch_metadata(&self) -> Result<RemoteMetadata> {
        let meta = self
            .config
            .retry
            .run(self.config.timeout, move |_| async move {
                let response = self.client.head(&self.config.url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(Error::from_status(status.as_u16(), self.config.url.as_str()));
                }

                let headers = response.headers();
                let size = header_str(headers, CONTENT_LENGTH)
                    .ok_or_else(|| Error::Protocol("Content-Length header missing".into()))?
                    .parse::<u64>()
                    .map_err(|e| Error::Protocol(format!("invalid Content-Length: {}", e)))?;

                Ok(RemoteMetadata {
                    size,
                    last_modified: header_str(headers, LAST_MODIFIED),
                    etag: header_str(headers, ETAG),
                })
            })
            .await?;

        debug!(
            size = meta.size,
            etag = meta.etag.as_deref(),
            last_modified = meta.last_modified.as_deref(),
            "fetched object metadata"
        );
        Ok(meta)
    }

    #[instrument(skip(self, meta), fields(url = %self.config.url))]
    async fn ranged_get(
        &self,
        range: &str,
        meta: Option<&RemoteMetadata>,
    ) -> Result<RangeResponse> {
        let validators = meta.filter(|_| self.config.validate);

        self.config
            .retry
            .run(self.config.timeout, move |_| async move {
                let mut request = self.client.get(&self.config.url).header(RANGE, range);
                if let Some(meta) = validators {
                    if let Some(last_modified) = &meta.last_modified {
                        request = request.header(IF_UNMODIFIED_SINCE, last_modified.as_str());
                    }
                    if let Some(etag) = &meta.etag {
                        request = request.header(IF_MATCH, etag.as_str());
                    }
                }

                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(Error::from_status(status.as_u16(), self.config.url.as_str()));
                }
                if status != StatusCode::PARTIAL_CONTENT {
                    debug!(status = status.as_u16(), "origin answered a range request without 206");
                }

                let headers = response.headers();
                let content_range = header_str(headers, CONTENT_RANGE);
                let last_modified = header_str(headers, LAST_MODIFIED);
                let etag = header_str(headers, ETAG);
                let body = response.bytes().await?;

                Ok(RangeResponse {
                    status,
                    content_range,
                    last_modified,
                    etag,
                    body,
                })
            })
            .await
    }

    /// Trailing `size` bytes of an object of known length `len`
    async fn tail_of(&self, len: u64, size: u64) -> Result<(Bytes, u64)> {
        let size = size.min(len);
        if size == 0 {
            return Ok((Bytes::new(), len));
        }
        Ok((self.get_bytes(len - size, size).await?, len))
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(&name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Parse `Content-Range: bytes A-B/TOTAL` into `(A, B, TOTAL)`
pub fn parse_content_range(value: &str) -> Result<(u64, u64, u64)> {
    let malformed = || Error::Protocol(format!("malformed Content-Range '{}'", value));

    let spec = value.trim().strip_prefix("bytes ").ok_or_else(malformed)?;
    let (range, total) = spec.split_once('/').ok_or_else(malformed)?;
    let (start, end) = range.split_once('-').ok_or_else(malformed)?;

    let start: u64 = start.trim().parse().map_err(|_| malformed())?;
    let end: u64 = end.trim().parse().map_err(|_| malformed())?;
    let total: u64 = total.trim().parse().map_err(|_| malformed())?;
    if start > end || end >= total {
        return Err(malformed());
    }
    Ok((start, end, total))
}

#[async_trait]
impl ByteRangeSource for HttpRangeSource {
    async fn get_bytes(&self, offset: u64, size: u64) -> Result<Bytes> {
        if size == 0 {
            return Err(Error::invalid_argument("size must be positive"));
        }
        let meta = self.metadata().await?;
        check_range(offset, size, meta.size)?;

        let range = format!("bytes={}-{}", offset, offset + size - 1);
        let response = self.ranged_get(&range, Some(&meta)).await?;

        if response.body.len() as u64 != size {
            return Err(Error::Integrity {
                expected: size,
                actual: response.body.len() as u64,
            });
        }
        Ok(response.body)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.metadata().await?.size)
    }

    async fn close(&self) -> Result<()> {
        *self.metadata.lock() = Arc::new(OnceCell::new());
        Ok(())
    }

    async fn get_bytes_from_end(&self, size: u64) -> Result<(Bytes, u64)> {
        if size == 0 {
            return Err(Error::invalid_argument("size must be positive"));
        }

        let cell = self.metadata.lock().clone();
        if let Some(meta) = cell.get() {
            return self.tail_of(meta.size, size).await;
        }

        let range = format!("bytes=-{}", size);
        let response = match self.ranged_get(&range, None).await {
            Ok(response) => response,
            // Without validators this can only be 416; a HEAD settles the length
            Err(Error::PreconditionFailed { .. }) => {
                let len = self.metadata().await?.size;
                debug!(len, "suffix range not satisfiable");
                return self.tail_of(len, size).await;
            }
            Err(err) => return Err(err),
        };

        let (data, total) = if response.status == StatusCode::PARTIAL_CONTENT {
            let content_range = response
                .content_range
                .as_deref()
                .ok_or_else(|| Error::Protocol("Content-Range header missing".into()))?;
            let (_, _, total) = parse_content_range(content_range)?;
            (response.body, total)
        } else {
            // Range ignored: the body is the whole object
            let total = response.body.len() as u64;
            let keep = size.min(total) as usize;
            (response.body.slice(response.body.len() - keep..), total)
        };

        let expected = size.min(total);
        if data.len() as u64 != expected {
            return Err(Error::Integrity {
                expected,
                actual: data.len() as u64,
            });
        }

        // Losing a race with a concurrent HEAD is harmless; both saw the same object
        let _ = cell.set(RemoteMetadata {
            size: total,
            last_modified: response.last_modified,
            etag: response.etag,
        });
        Ok((data, total))
    }
}

// =============================================================================
// Tests
// =============================================================================
