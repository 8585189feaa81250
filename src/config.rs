use crate::error::ConfigError;
use crate::state::RealtimeKind;
use crate::store::batch::DbConfig;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_GTFS_URL: &str = "https://www.soundtransit.org/GTFS-rail/40_gtfs.zip";
const DEFAULT_TRIP_UPDATES_URL: &str = "https://api.pugetsound.onebusaway.org/api/gtfs_realtime/trip-updates-for-agency/40.pb?key=org.onebusaway.iphone";
const DEFAULT_VEHICLE_POSITIONS_URL: &str = "https://api.pugetsound.onebusaway.org/api/gtfs_realtime/vehicle-positions-for-agency/40.pb?key=org.onebusaway.iphone";
const DEFAULT_DATA_PATH: &str = "./gtfs.db";
const DEFAULT_REFRESH_INTERVAL: i64 = 30;
const DEFAULT_CACHE_MAX_AGE: i64 = 30;
const DEFAULT_STATIC_REFRESH_INTERVAL: i64 = 3600;
const DEFAULT_API_KEYS: &str = "test";
const DEFAULT_EXEMPT_API_KEYS: &str = "org.onebusaway.iphone";
const DEFAULT_RATE_LIMIT: i64 = 100;
const CLI_FEED_ID: &str = "feed-0";
const REDACTED: &str = "<redacted>";

/// Splits a comma separated key list, dropping blanks.
pub fn parse_api_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn redact(value: &mut String) {
    if !value.is_empty() {
        *value = REDACTED.to_string();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StaticFeedConfig {
    pub url: String,
    #[serde(default)]
    pub auth_header_name: String,
    #[serde(default)]
    pub auth_header_value: String,
}

impl StaticFeedConfig {
    pub fn auth_header(&self) -> Option<(&str, &str)> {
        auth_pair(&self.auth_header_name, &self.auth_header_value)
    }
}

/// One realtime source. Empty sub-feed URLs are not polled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeedConfig {
    pub id: String,
    #[serde(default)]
    pub trip_updates_url: String,
    #[serde(default)]
    pub vehicle_positions_url: String,
    #[serde(default)]
    pub service_alerts_url: String,
    #[serde(default, rename = "realtime-auth-header-name")]
    pub auth_header_name: String,
    #[serde(default, rename = "realtime-auth-header-value")]
    pub auth_header_value: String,
    #[serde(default = "default_refresh_interval", rename = "refresh-interval")]
    pub refresh_interval_seconds: i64,
}

fn default_refresh_interval() -> i64 {
    DEFAULT_REFRESH_INTERVAL
}

impl FeedConfig {
    pub fn url(&self, kind: RealtimeKind) -> Option<&str> {
        let url = match kind {
            RealtimeKind::TripUpdates => &self.trip_updates_url,
            RealtimeKind::VehiclePositions => &self.vehicle_positions_url,
            RealtimeKind::ServiceAlerts => &self.service_alerts_url,
        };
        (!url.is_empty()).then_some(url.as_str())
    }

    pub fn auth_header(&self) -> Option<(&str, &str)> {
        auth_pair(&self.auth_header_name, &self.auth_header_value)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds.max(1) as u64)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_seconds <= 0 {
            return Err(ConfigError::InvalidRefreshInterval {
                feed: self.id.clone(),
                interval: self.refresh_interval_seconds,
            });
        }
        let context = format!("realtime feed {:?}", self.id);
        check_auth(&context, &self.auth_header_name, &self.auth_header_value)?;
        for kind in RealtimeKind::ALL {
            if let Some(url) = self.url(kind) {
                check_http_url(&format!("{context} {kind}"), url)?;
            }
        }
        Ok(())
    }
}

fn auth_pair<'a>(name: &'a str, value: &'a str) -> Option<(&'a str, &'a str)> {
    (!name.is_empty() && !value.is_empty()).then_some((name, value))
}

fn check_auth(context: &str, name: &str, value: &str) -> Result<(), ConfigError> {
    if name.is_empty() != value.is_empty() {
        return Err(ConfigError::HalfConfiguredAuth {
            context: context.to_string(),
        });
    }
    Ok(())
}

fn check_http_url(context: &str, url: &str) -> Result<(), ConfigError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            context: context.to_string(),
            url: url.to_string(),
        }),
    }
}

/// The structured configuration document accepted by `-f`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JsonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub env: Environment,
    pub gtfs_static_feed: StaticFeedConfig,
    #[serde(default)]
    pub gtfs_rt_feeds: Vec<FeedConfig>,
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default = "default_cache_max_age")]
    pub cache_max_age: i64,
    #[serde(default = "default_static_refresh_interval")]
    pub static_refresh_interval: i64,
    #[serde(default)]
    pub bulk_insert_batch_size: Option<usize>,
    #[serde(default = "default_api_keys")]
    pub api_keys: Vec<String>,
    #[serde(default = "default_exempt_api_keys")]
    pub exempt_api_keys: Vec<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: i64,
}

fn default_api_keys() -> Vec<String> {
    parse_api_keys(DEFAULT_API_KEYS)
}

fn default_exempt_api_keys() -> Vec<String> {
    parse_api_keys(DEFAULT_EXEMPT_API_KEYS)
}

fn default_rate_limit() -> i64 {
    DEFAULT_RATE_LIMIT
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

fn default_cache_max_age() -> i64 {
    DEFAULT_CACHE_MAX_AGE
}

fn default_static_refresh_interval() -> i64 {
    DEFAULT_STATIC_REFRESH_INTERVAL
}

impl JsonConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        let feed = &self.gtfs_static_feed;
        if feed.url.trim().is_empty() {
            return Err(ConfigError::MissingStaticUrl);
        }
        if feed.url.starts_with("http://") || feed.url.starts_with("https://") {
            check_http_url("static feed", &feed.url)?;
        }
        check_auth("static feed", &feed.auth_header_name, &feed.auth_header_value)?;

        if self.static_refresh_interval <= 0 {
            return Err(ConfigError::InvalidStaticRefreshInterval(
                self.static_refresh_interval,
            ));
        }

        if self.rate_limit <= 0 {
            return Err(ConfigError::InvalidRateLimit(self.rate_limit));
        }
        let has_key = |keys: &[String]| keys.iter().any(|k| !k.trim().is_empty());
        if !has_key(&self.api_keys) && !has_key(&self.exempt_api_keys) {
            return Err(ConfigError::NoApiKeys);
        }

        let mut seen = HashSet::new();
        for (i, rt) in self.gtfs_rt_feeds.iter().enumerate() {
            if rt.id.trim().is_empty() {
                return Err(ConfigError::EmptyFeedId(i));
            }
            if !seen.insert(rt.id.as_str()) {
                return Err(ConfigError::DuplicateFeedId(rt.id.clone()));
            }
            rt.validate()?;
        }
        Ok(())
    }

    pub fn into_app_config(self) -> AppConfig {
        let mut db = DbConfig::new(self.data_path);
        if let Some(size) = self.bulk_insert_batch_size {
            db.bulk_insert_batch_size = size;
        }
        AppConfig {
            port: self.port,
            env: self.env,
            static_feed: self.gtfs_static_feed,
            realtime_feeds: self.gtfs_rt_feeds,
            db,
            cache_max_age: self.cache_max_age,
            static_refresh_interval: self.static_refresh_interval,
            api_keys: self.api_keys,
            exempt_api_keys: self.exempt_api_keys,
            rate_limit: self.rate_limit,
        }
    }

    /// Copy with auth header values and API keys masked, for display.
    pub fn redacted(mut self) -> Self {
        redact(&mut self.gtfs_static_feed.auth_header_value);
        for feed in &mut self.gtfs_rt_feeds {
            redact(&mut feed.auth_header_value);
        }
        for key in self.api_keys.iter_mut().chain(self.exempt_api_keys.iter_mut()) {
            redact(key);
        }
        self
    }
}

/// Validated, immutable runtime configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub port: u16,
    pub env: Environment,
    pub static_feed: StaticFeedConfig,
    pub realtime_feeds: Vec<FeedConfig>,
    pub db: DbConfig,
    pub cache_max_age: i64,
    pub static_refresh_interval: i64,
    pub api_keys: Vec<String>,
    pub exempt_api_keys: Vec<String>,
    /// Requests per second per API key.
    pub rate_limit: i64,
}

impl AppConfig {
    /// The document form accepted by `-f`, as printed by `--dump-config`.
    pub fn to_json_config(&self) -> JsonConfig {
        JsonConfig {
            port: self.port,
            env: self.env,
            gtfs_static_feed: self.static_feed.clone(),
            gtfs_rt_feeds: self.realtime_feeds.clone(),
            data_path: self.db.path.clone(),
            cache_max_age: self.cache_max_age,
            static_refresh_interval: self.static_refresh_interval,
            bulk_insert_batch_size: Some(self.db.bulk_insert_batch_size),
            api_keys: self.api_keys.clone(),
            exempt_api_keys: self.exempt_api_keys.clone(),
            rate_limit: self.rate_limit,
        }
    }

    pub fn static_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.static_refresh_interval.max(1) as u64)
    }

    /// Directory that holds the database and persisted realtime state.
    pub fn data_dir(&self) -> PathBuf {
        Path::new(&self.db.path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "gtfs-live-server", about = "Serves static GTFS data overlaid with GTFS-RT feeds")]
pub struct Cli {
    /// Path to JSON configuration file (mutually exclusive with other flags)
    #[arg(short = 'f')]
    pub config_file: Option<PathBuf>,

    /// Dump current configuration as JSON and exit
    #[arg(long)]
    pub dump_config: bool,

    /// API server port [default: 4000]
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, value_enum)]
    pub env: Option<Environment>,

    /// Comma separated API keys [default: test]
    #[arg(long)]
    pub api_keys: Option<String>,

    /// Comma separated API keys exempt from rate limiting [default: org.onebusaway.iphone]
    #[arg(long)]
    pub exempt_api_keys: Option<String>,

    /// Requests per second per API key [default: 100]
    #[arg(long)]
    pub rate_limit: Option<i64>,

    /// URL or local path of a static GTFS zip file
    #[arg(long)]
    pub gtfs_url: Option<String>,

    #[arg(long = "gtfs-static-auth-header-name")]
    pub static_auth_header_name: Option<String>,

    #[arg(long = "gtfs-static-auth-header-value")]
    pub static_auth_header_value: Option<String>,

    #[arg(long)]
    pub trip_updates_url: Option<String>,

    #[arg(long)]
    pub vehicle_positions_url: Option<String>,

    #[arg(long)]
    pub service_alerts_url: Option<String>,

    #[arg(long = "realtime-auth-header-name")]
    pub realtime_auth_header_name: Option<String>,

    #[arg(long = "realtime-auth-header-value")]
    pub realtime_auth_header_value: Option<String>,

    /// Path to the SQLite database holding GTFS data [default: ./gtfs.db]
    #[arg(long)]
    pub data_path: Option<String>,

    /// Cache-Control max-age in seconds; 0 disables caching [default: 30]
    #[arg(long)]
    pub cache_max_age: Option<i64>,

    /// Seconds between static GTFS reloads [default: 3600]
    #[arg(long)]
    pub static_refresh_interval: Option<i64>,
}

impl Cli {
    fn has_config_flags(&self) -> bool {
        self.port.is_some()
            || self.env.is_some()
            || self.api_keys.is_some()
            || self.exempt_api_keys.is_some()
            || self.rate_limit.is_some()
            || self.gtfs_url.is_some()
            || self.static_auth_header_name.is_some()
            || self.static_auth_header_value.is_some()
            || self.trip_updates_url.is_some()
            || self.vehicle_positions_url.is_some()
            || self.service_alerts_url.is_some()
            || self.realtime_auth_header_name.is_some()
            || self.realtime_auth_header_value.is_some()
            || self.data_path.is_some()
            || self.cache_max_age.is_some()
            || self.static_refresh_interval.is_some()
    }

    /// Packs the single-feed flags into the document form so both paths
    /// share one validation.
    fn into_json_config(self) -> JsonConfig {
        JsonConfig {
            port: self.port.unwrap_or(DEFAULT_PORT),
            env: self.env.unwrap_or_default(),
            gtfs_static_feed: StaticFeedConfig {
                url: self.gtfs_url.unwrap_or_else(|| DEFAULT_GTFS_URL.to_string()),
                auth_header_name: self.static_auth_header_name.unwrap_or_default(),
                auth_header_value: self.static_auth_header_value.unwrap_or_default(),
            },
            gtfs_rt_feeds: vec![FeedConfig {
                id: CLI_FEED_ID.to_string(),
                trip_updates_url: self
                    .trip_updates_url
                    .unwrap_or_else(|| DEFAULT_TRIP_UPDATES_URL.to_string()),
                vehicle_positions_url: self
                    .vehicle_positions_url
                    .unwrap_or_else(|| DEFAULT_VEHICLE_POSITIONS_URL.to_string()),
                service_alerts_url: self.service_alerts_url.unwrap_or_default(),
                auth_header_name: self.realtime_auth_header_name.unwrap_or_default(),
                auth_header_value: self.realtime_auth_header_value.unwrap_or_default(),
                refresh_interval_seconds: DEFAULT_REFRESH_INTERVAL,
            }],
            data_path: self.data_path.unwrap_or_else(default_data_path),
            cache_max_age: self.cache_max_age.unwrap_or(DEFAULT_CACHE_MAX_AGE),
            static_refresh_interval: self
                .static_refresh_interval
                .unwrap_or(DEFAULT_STATIC_REFRESH_INTERVAL),
            bulk_insert_batch_size: None,
            api_keys: parse_api_keys(self.api_keys.as_deref().unwrap_or(DEFAULT_API_KEYS)),
            exempt_api_keys: parse_api_keys(
                self.exempt_api_keys
                    .as_deref()
                    .unwrap_or(DEFAULT_EXEMPT_API_KEYS),
            ),
            rate_limit: self.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT),
        }
    }

    pub fn resolve(self) -> Result<AppConfig, ConfigError> {
        let config = match &self.config_file {
            Some(path) => {
                if self.has_config_flags() {
                    return Err(ConfigError::ExclusiveConfigFile);
                }
                JsonConfig::load_from_file(path)?
            }
            None => self.into_json_config(),
        };
        config.validate()?;
        Ok(config.into_app_config())
    }
}
