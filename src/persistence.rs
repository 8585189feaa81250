use crate::state::{DataManager, RealtimeKind};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gtfs_realtime::FeedMessage;
use prost::Message;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const REALTIME_DIR: &str = "realtime";

fn overlay_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(REALTIME_DIR)
}

fn file_name(feed_id: &str, kind: RealtimeKind) -> String {
    format!("{}-{}.pb", feed_id, kind.as_str())
}

/// Splits `<feed>-<kind>.pb`. Feed ids may contain '-', so the kind is
/// matched as a suffix.
fn parse_file_name(name: &str) -> Option<(&str, RealtimeKind)> {
    let stem = name.strip_suffix(".pb")?;
    RealtimeKind::ALL.into_iter().find_map(|kind| {
        let feed = stem.strip_suffix(kind.as_str())?.strip_suffix('-')?;
        (!feed.is_empty()).then_some((feed, kind))
    })
}

/// Writes every held realtime payload to `<data_dir>/realtime/`. Each file
/// is replaced atomically so a crash mid-save leaves the previous copy.
pub fn save_overlay(manager: &DataManager, data_dir: &Path) -> Result<usize> {
    let dir = overlay_dir(data_dir);
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut written = 0;
    for feed_id in manager.feed_ids() {
        if feed_id.contains(['/', '\\']) {
            warn!(feed = %feed_id, "feed id is not a valid file name, not persisting");
            continue;
        }
        let Some(overlay) = manager.overlay(&feed_id) else {
            continue;
        };
        for kind in RealtimeKind::ALL {
            let Some(data) = overlay.get(kind) else {
                continue;
            };
            let buf = data.message.encode_to_vec();
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&buf)?;
            let path = dir.join(file_name(&feed_id, kind));
            tmp.persist(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            written += 1;
        }
    }
    Ok(written)
}

/// Restores payloads written by `save_overlay`. Unreadable or corrupt
/// files are skipped.
pub fn load_overlay(manager: &DataManager, data_dir: &Path) -> Result<usize> {
    let dir = overlay_dir(data_dir);
    if !dir.exists() {
        return Ok(0);
    }

    let mut loaded = 0;
    for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some((feed_id, kind)) = name.to_str().and_then(parse_file_name) else {
            continue;
        };

        let path = entry.path();
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable realtime file");
                continue;
            }
        };
        let message = match FeedMessage::decode(buf.as_slice()) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping corrupt realtime file");
                continue;
            }
        };
        let fetched_at = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        manager.merge_realtime_at(feed_id, kind, message, fetched_at);
        loaded += 1;
    }

    info!(files = loaded, "restored realtime overlay from disk");
    Ok(loaded)
}
