use crate::config::FeedConfig;
use crate::error::FetchError;
use crate::state::{DataManager, RealtimeKind};
use gtfs_realtime::FeedMessage;
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum accepted protobuf response size (50 MB)
const MAX_PROTOBUF_SIZE: usize = 50 * 1024 * 1024;

/// Upper bound on a single fetch, however long the refresh interval.
const MAX_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one polling cycle across a feed's sub-feeds.
#[derive(Debug, Default, PartialEq)]
pub struct CycleReport {
    pub merged: Vec<RealtimeKind>,
    pub failed: Vec<RealtimeKind>,
}

/// Polls one configured realtime feed on its own schedule.
pub struct FeedPoller {
    config: Arc<FeedConfig>,
    client: reqwest::Client,
    manager: Arc<DataManager>,
    fetch_timeout: Duration,
}

impl FeedPoller {
    pub fn new(config: Arc<FeedConfig>, client: reqwest::Client, manager: Arc<DataManager>) -> Self {
        let fetch_timeout = config.refresh_interval().min(MAX_FETCH_TIMEOUT);
        Self {
            config,
            client,
            manager,
            fetch_timeout,
        }
    }

    pub fn feed_id(&self) -> &str {
        &self.config.id
    }

    /// Polls immediately, then every refresh interval, until `cancel` fires.
    /// Cycles never overlap: the next sleep starts after the previous cycle.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            feed = self.feed_id(),
            interval_secs = self.config.refresh_interval().as_secs(),
            "realtime poller starting"
        );
        while !cancel.is_cancelled() {
            let report = self.poll_once(&cancel).await;
            debug!(feed = self.feed_id(), ?report, "realtime cycle complete");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.refresh_interval()) => {}
            }
        }
        info!(feed = self.feed_id(), "realtime poller stopped");
    }

    /// Fetches every configured sub-feed once. A failing sub-feed is logged
    /// and leaves its previous overlay in place; the others still run.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();
        for kind in RealtimeKind::ALL {
            let Some(url) = self.config.url(kind) else {
                continue;
            };
            match self.fetch(url, cancel).await {
                Ok(message) => {
                    debug!(
                        feed = self.feed_id(),
                        kind = %kind,
                        entities = message.entity.len(),
                        "merged realtime data"
                    );
                    self.manager.merge_realtime(self.feed_id(), kind, message);
                    report.merged.push(kind);
                }
                Err(FetchError::Cancelled) => break,
                Err(e) => {
                    warn!(feed = self.feed_id(), kind = %kind, error = %e, "realtime fetch failed");
                    report.failed.push(kind);
                }
            }
        }
        report
    }

    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<FeedMessage, FetchError> {
        let timeout = self.fetch_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            res = tokio::time::timeout(timeout, fetch_feed(&self.client, url, self.config.auth_header())) => {
                res.map_err(|_| FetchError::Timeout(timeout))?
            }
        }
    }
}

/// Fetch and decode one GTFS-RT protobuf payload.
pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
    auth: Option<(&str, &str)>,
) -> Result<FeedMessage, FetchError> {
    let mut request = client.get(url);
    if let Some((name, value)) = auth {
        request = request.header(name, value);
    }
    let response = request.send().await?;

    if !response.status().is_success() {
        return Err(FetchError::Status(response.status()));
    }

    let bytes = read_capped(response, MAX_PROTOBUF_SIZE).await?;
    Ok(FeedMessage::decode(bytes.as_ref())?)
}

/// Buffers the body, refusing it from Content-Length when declared too
/// large and otherwise as soon as the running total passes `max`.
async fn read_capped(mut response: reqwest::Response, max: usize) -> Result<Vec<u8>, FetchError> {
    if let Some(declared) = response.content_length() {
        if declared > max as u64 {
            return Err(FetchError::TooLarge {
                size: declared as usize,
                max,
            });
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > max {
            return Err(FetchError::TooLarge {
                size: body.len() + chunk.len(),
                max,
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Spawns one independent poller per feed.
pub fn spawn_pollers(
    feeds: &[Arc<FeedConfig>],
    client: reqwest::Client,
    manager: Arc<DataManager>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    feeds
        .iter()
        .map(|feed| {
            let poller = FeedPoller::new(feed.clone(), client.clone(), manager.clone());
            tokio::spawn(poller.run(cancel.child_token()))
        })
        .collect()
}
