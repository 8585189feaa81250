use crate::config::StaticFeedConfig;
use crate::error::LoadError;
use crate::state::{DataManager, StaticSnapshot};
use crate::store::batch::DbConfig;
use crate::store::schema::{LoadReport, replace_all};
use gtfs_structures::Gtfs;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum accepted static archive size (500 MB)
const MAX_DOWNLOAD_SIZE: u64 = 500 * 1024 * 1024;

/// A static archive ready to parse. A downloaded copy lives as long as this
/// value does.
enum Archive {
    Local(PathBuf),
    Downloaded(NamedTempFile),
}

impl Archive {
    fn path(&self) -> &Path {
        match self {
            Archive::Local(path) => path,
            Archive::Downloaded(file) => file.path(),
        }
    }
}

/// Builds static snapshots from the configured feed. Holds no dataset state
/// of its own; results are handed to the `DataManager`.
pub struct StaticLoader {
    feed: StaticFeedConfig,
    db: DbConfig,
    client: reqwest::Client,
}

impl StaticLoader {
    pub fn new(feed: StaticFeedConfig, db: DbConfig) -> Self {
        Self {
            feed,
            db,
            client: reqwest::Client::new(),
        }
    }

    /// Blocking: parse the archive at `path`, write it to storage and build
    /// the snapshot. Nothing is published here.
    pub fn load_from(&self, path: &Path) -> Result<(StaticSnapshot, LoadReport), LoadError> {
        let started = Instant::now();
        let gtfs = parse_path(path)?;
        info!(
            stops = gtfs.stops.len(),
            trips = gtfs.trips.len(),
            shapes = gtfs.shapes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "parsed static GTFS"
        );

        let report = self.persist(&gtfs)?;
        let snapshot = StaticSnapshot::new(gtfs, self.feed.url.clone());
        Ok((snapshot, report))
    }

    /// Fetches, loads and publishes one new snapshot. The download stops as
    /// soon as `cancel` fires; parse and storage run on the blocking pool and
    /// do not publish once cancelled. On error the installed snapshot is
    /// untouched.
    pub async fn refresh(
        self: Arc<Self>,
        manager: Arc<DataManager>,
        cancel: &CancellationToken,
    ) -> Result<u64, LoadError> {
        let archive = self.fetch_archive(cancel).await?;

        let token = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            let (snapshot, report) = self.load_from(archive.path())?;
            if token.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            let version = manager.refresh(snapshot);
            info!(
                version,
                stop_times = report.rows("stop_times"),
                shapes = report.rows("shapes"),
                "static refresh complete"
            );
            Ok(version)
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(LoadError::Cancelled),
            res = task => res.map_err(|e| LoadError::Task(e.to_string()))?,
        }
    }

    /// Reloads every `interval` until `cancel` fires. Failed attempts keep
    /// the last good snapshot.
    pub fn start_updater(
        self: Arc<Self>,
        manager: Arc<DataManager>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                info!("updating static GTFS data");
                match self.clone().refresh(manager.clone(), &cancel).await {
                    Ok(version) => info!(version, "static GTFS data updated"),
                    Err(LoadError::Cancelled) => break,
                    Err(e) => error!(error = %e, "static GTFS update failed, keeping previous snapshot"),
                }
            }
            info!("static updater stopped");
        })
    }

    async fn fetch_archive(&self, cancel: &CancellationToken) -> Result<Archive, LoadError> {
        let url = self.feed.url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Ok(Archive::Local(PathBuf::from(url)));
        }

        let file = tempfile::Builder::new()
            .suffix(".zip")
            .tempfile()
            .map_err(|e| LoadError::Download(e.to_string()))?;
        let mut dest = file
            .reopen()
            .map(tokio::fs::File::from_std)
            .map_err(|e| LoadError::Download(e.to_string()))?;

        let fetch = download(
            &self.client,
            url,
            self.feed.auth_header(),
            MAX_DOWNLOAD_SIZE,
            &mut dest,
        );
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(LoadError::Cancelled),
            res = tokio::time::timeout(DOWNLOAD_TIMEOUT, fetch) => res
                .map_err(|_| LoadError::Download(format!("timed out after {DOWNLOAD_TIMEOUT:?}")))??,
        };
        info!(url, bytes, "downloaded static GTFS");
        Ok(Archive::Downloaded(file))
    }

    fn persist(&self, gtfs: &Gtfs) -> Result<LoadReport, LoadError> {
        if let Some(parent) = Path::new(&self.db.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| LoadError::Task(e.to_string()))?;
            }
        }
        let mut conn = Connection::open(&self.db.path)?;
        replace_all(&mut conn, gtfs)
    }
}

fn parse_path(path: &Path) -> Result<Gtfs, LoadError> {
    Gtfs::from_path(path).map_err(|e| LoadError::Parse(format!("{}: {}", path.display(), e)))
}

/// Streams the archive body into `dest`, attaching the auth header when
/// configured. Returns the byte count; bodies over `max_size` are rejected
/// from Content-Length up front, or as soon as the running total passes it.
pub async fn download(
    client: &reqwest::Client,
    url: &str,
    auth: Option<(&str, &str)>,
    max_size: u64,
    dest: &mut tokio::fs::File,
) -> Result<u64, LoadError> {
    let mut request = client.get(url);
    if let Some((name, value)) = auth {
        request = request.header(name, value);
    }
    let mut response = request
        .send()
        .await
        .map_err(|e| LoadError::Download(e.to_string()))?;
    if !response.status().is_success() {
        return Err(LoadError::Download(format!("HTTP {} from {}", response.status(), url)));
    }

    if let Some(size) = response.content_length() {
        if size > max_size {
            return Err(LoadError::TooLarge { size, max: max_size });
        }
    }

    let mut total: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| LoadError::Download(e.to_string()))?
    {
        total += chunk.len() as u64;
        if total > max_size {
            return Err(LoadError::TooLarge { size: total, max: max_size });
        }
        dest.write_all(&chunk)
            .await
            .map_err(|e| LoadError::Download(e.to_string()))?;
    }
    dest.flush()
        .await
        .map_err(|e| LoadError::Download(e.to_string()))?;
    Ok(total)
}
