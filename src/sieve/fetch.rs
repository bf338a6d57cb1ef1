//! Subscription source fetching.
//!
//! The pipeline only sees the [`SourceFetcher`] trait. [`HttpFetcher`] is the
//! reqwest-backed implementation the CLI uses.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default fetch timeout per source.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect timeout for source fetches.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = "clash-verge/v2.0";

/// Retrieves the raw body of one source location.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &str) -> Result<String>;
}

/// Plain HTTP(S) fetcher.
///
/// Uses a direct (no-proxy) client: sources are expected to be reachable
/// without going through any of the nodes being collected.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build source HTTP client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &str) -> Result<String> {
        let resp = self.client.get(source).send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("source fetch timed out: {source}")
            } else if e.is_connect() {
                anyhow::anyhow!("failed to connect to source: {source}: {e}")
            } else {
                anyhow::anyhow!("source fetch failed: {source}: {e}")
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            anyhow::bail!("source returned 403 Forbidden: {source}");
        }
        if !status.is_success() {
            anyhow::bail!("source returned HTTP {status}: {source}");
        }

        resp.text()
            .await
            .map_err(|e| anyhow::anyhow!("failed to read source body: {source}: {e}"))
    }
}

/// Fetch one source, giving up at `deadline` or when `cancel` fires.
pub async fn fetch_bounded(
    fetcher: &dyn SourceFetcher,
    source: &str,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<String> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => anyhow::bail!("source fetch cancelled: {source}"),
        r = tokio::time::timeout_at(deadline, fetcher.fetch(source)) => match r {
            Ok(body) => body,
            Err(_) => anyhow::bail!("source fetch cut off by the run deadline: {source}"),
        },
    }
}

/// Merge configured sources with those listed by the aggregate source.
///
/// The aggregate body lists one location per line; blank lines and `#`
/// comments are ignored. The result keeps first-seen order without
/// duplicates. A failing or unfinished aggregate fetch is logged and leaves
/// the configured list as is.
pub async fn resolve_sources(
    fetcher: &dyn SourceFetcher,
    configured: &[String],
    aggregate: Option<&str>,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Vec<String> {
    let mut listed = Vec::new();
    if let Some(aggregate) = aggregate {
        match fetch_bounded(fetcher, aggregate, deadline, cancel).await {
            Ok(body) => {
                listed = body
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect();
                tracing::info!("aggregate source listed {} sources", listed.len());
            }
            Err(e) => tracing::warn!("aggregate source fetch failed: {e:#}"),
        }
    }

    let mut seen = HashSet::new();
    configured
        .iter()
        .map(|s| s.trim().to_string())
        .chain(listed)
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

/// Fetch every source with at most `concurrency` requests in flight.
///
/// Results come back in source order so that parsing, and therefore the
/// first-seen `raw` of every node, does not depend on network timing.
/// Sources still pending at `deadline` or on cancel come back as errors;
/// bodies that already arrived are kept.
pub async fn fetch_all(
    fetcher: &dyn SourceFetcher,
    sources: &[String],
    concurrency: usize,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Vec<(String, Result<String>)> {
    stream::iter(sources)
        .map(|source| async move {
            let body = fetch_bounded(fetcher, source, deadline, cancel).await;
            match &body {
                Ok(text) => tracing::debug!("fetched {} bytes from {source}", text.len()),
                Err(e) => tracing::warn!("source fetch failed: {e:#}"),
            }
            (source.clone(), body)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}
