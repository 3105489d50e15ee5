//! Subtitle download client
//!
//! Features:
//! - Fastest-mirror selection: HEAD-probe every candidate concurrently and
//!   download the body only from the first mirror that answers
//! - HTTP/2 multiplexing, Brotli/Gzip compression (auto-negotiated)
//! - `file://` candidates for offline replay of saved catalogs
//! - In-memory fetcher for replay and tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{select_ok, BoxFuture};
use futures::FutureExt;
use reqwest::Client;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

/// Something that can turn a set of mirror URLs into a subtitle body.
#[async_trait]
pub trait SubtitleFetcher: Send + Sync {
    /// Fetch the body from whichever candidate responds first.
    async fn fetch_first(&self, urls: &[String]) -> Result<Bytes>;
}

/// reqwest-backed fetcher with fastest-mirror probing.
pub struct HttpFetcher {
    client: Client,
    probe_timeout: Duration,
}

impl HttpFetcher {
    /// Create a new fetcher
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            // Keep mirror connections alive for the body request after probing
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .brotli(true)
            .gzip(true)
            .deflate(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self {
            client,
            probe_timeout: Duration::from_secs(5),
        })
    }

    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<&'a str>> {
        async move {
            if let Some(path) = url.strip_prefix("file://") {
                tokio::fs::metadata(path).await?;
                return Ok(url);
            }
            let response = self
                .client
                .head(url)
                .timeout(self.probe_timeout)
                .send()
                .await?;
            if response.status().is_success() {
                Ok(url)
            } else {
                Err(Error::Status {
                    url: url.to_string(),
                    status: response.status().as_u16(),
                })
            }
        }
        .boxed()
    }

    /// Race existence probes against every candidate and return the winner.
    #[instrument(skip(self, urls), fields(candidates = urls.len()))]
    pub async fn fastest_mirror<'a>(&'a self, urls: &'a [String]) -> Result<&'a str> {
        if urls.is_empty() {
            return Err(Error::NoCandidates);
        }
        let probes = urls.iter().map(|url| self.probe(url));
        match select_ok(probes).await {
            Ok((url, _pending)) => {
                debug!(url, "Mirror won probe race");
                Ok(url)
            }
            Err(e) => {
                debug!(error = %e, "Every mirror probe failed");
                Err(Error::AllMirrorsFailed(urls.len()))
            }
        }
    }

    /// Get the underlying reqwest client
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl SubtitleFetcher for HttpFetcher {
    async fn fetch_first(&self, urls: &[String]) -> Result<Bytes> {
        let url = self.fastest_mirror(urls).await?;

        if let Some(path) = url.strip_prefix("file://") {
            return Ok(Bytes::from(tokio::fs::read(path).await?));
        }

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;

        info!(
            url,
            status = %status,
            bytes = body.len(),
            "Subtitle downloaded"
        );
        Ok(body)
    }
}

/// Serves preloaded bodies keyed by URL.
///
/// Used to replay captured catalogs offline and as the network stand-in in
/// tests. Counts every `fetch_first` call.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    bodies: HashMap<String, Bytes>,
    delay: Option<Duration>,
    requests: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_body(mut self, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.bodies.insert(url.into(), body.into());
        self
    }

    /// Simulate network latency on every fetch.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `fetch_first` calls served so far (successful or not).
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubtitleFetcher for MemoryFetcher {
    async fn fetch_first(&self, urls: &[String]) -> Result<Bytes> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if urls.is_empty() {
            return Err(Error::NoCandidates);
        }
        urls.iter()
            .find_map(|url| self.bodies.get(url).cloned())
            .ok_or(Error::AllMirrorsFailed(urls.len()))
    }
}
