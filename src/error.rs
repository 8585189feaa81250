use thiserror::Error;

/// Invalid or conflicting settings. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the -f flag is mutually exclusive with other configuration flags (except --dump-config)")]
    ExclusiveConfigFile,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid port {0}")]
    InvalidPort(u16),

    #[error("static GTFS url must not be empty")]
    MissingStaticUrl,

    #[error("realtime feed at index {0} has an empty id")]
    EmptyFeedId(usize),

    #[error("duplicate realtime feed id {0:?}")]
    DuplicateFeedId(String),

    #[error("feed {feed:?}: refresh interval must be positive, got {interval}")]
    InvalidRefreshInterval { feed: String, interval: i64 },

    #[error("{context}: auth header name and value must be set together")]
    HalfConfiguredAuth { context: String },

    #[error("{context}: invalid url {url:?}")]
    InvalidUrl { context: String, url: String },

    #[error("static refresh interval must be positive, got {0}")]
    InvalidStaticRefreshInterval(i64),

    #[error("rate limit must be positive, got {0}")]
    InvalidRateLimit(i64),

    #[error("at least one API key or exempt API key is required")]
    NoApiKeys,
}

/// Failure of one static refresh attempt. The previously installed snapshot
/// stays live when this is returned.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to download static feed: {0}")]
    Download(String),

    #[error("failed to parse static feed: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("bulk insert into {table} failed at batch {batch_index}: {source}")]
    Batch {
        table: &'static str,
        batch_index: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("static feed too large: {size} bytes (max {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("static load task failed: {0}")]
    Task(String),

    #[error("static refresh cancelled by shutdown")]
    Cancelled,
}

/// Failure of a single realtime sub-feed fetch. Never fatal.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error("response too large: {size} bytes (max {max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("malformed GTFS-RT payload: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("fetch exceeded deadline of {0:?}")]
    Timeout(std::time::Duration),

    #[error("fetch cancelled by shutdown")]
    Cancelled,
}
