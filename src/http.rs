//! HTTP access to track files.
//!
//! This module provides the [`Fetch`] seam the prefetcher downloads
//! through, and [`Client`], its `reqwest` implementation. The client adds:
//! * Request rate limiting, so a burst of prefetches does not hammer the host
//! * Consistent timeouts and `User-Agent`
//! * Streaming bodies, yielding control at every chunk
//!
//! # Example
//!
//! ```rust
//! use futures_util::TryStreamExt;
//! use tapedeck::http::{Client, Fetch};
//!
//! let client = Client::new(&config)?;
//! let mut download = client.fetch(url).await?;
//! while let Some(chunk) = download.chunks.try_next().await? {
//!     println!("{} of {:?} bytes", chunk.len(), download.content_length);
//! }
//! ```

use std::{fmt, time::Duration};

use bytes::Bytes;
use futures_util::{future::BoxFuture, stream::BoxStream, FutureExt, StreamExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::Url;

use crate::{
    config::Config,
    error::{Error, Result},
};

/// A response body in flight.
pub struct Download {
    /// Total size announced by the server, if any.
    pub content_length: Option<u64>,

    /// Body chunks in arrival order.
    pub chunks: BoxStream<'static, Result<Bytes>>,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Something that can stream the bytes behind a URL.
pub trait Fetch: Send + Sync {
    /// Starts a GET request for `url`. Resolves once the response headers
    /// are in; the body is streamed through [`Download::chunks`].
    fn fetch(&self, url: Url) -> BoxFuture<'_, Result<Download>>;
}

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Unlimited request client, shared with the streaming engine.
    pub unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Duration to keep idle connections alive.
    ///
    /// Prevents frequent reconnection overhead for subsequent requests.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a new client from the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let mut http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .user_agent(&config.user_agent);

        if let Some(timeout) = config.read_timeout {
            http_client = http_client.read_timeout(timeout);
        }

        // Allow a burst of one second's worth of requests, then throttle.
        let quota = Quota::per_second(config.requests_per_second);

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }
}

impl Fetch for Client {
    fn fetch(&self, url: Url) -> BoxFuture<'_, Result<Download>> {
        let throttle = self.rate_limiter.until_ready();
        throttle
            .then(move |()| {
                trace!("GET {url}");
                self.unlimited.get(url).send().map_err(Error::from)
            })
            .map(|response| {
                let response = response?.error_for_status()?;
                let content_length = response.content_length();
                let chunks = response.bytes_stream().map(|chunk| chunk.map_err(Error::from));

                Ok(Download {
                    content_length,
                    chunks: chunks.boxed(),
                })
            })
            .boxed()
    }
}
