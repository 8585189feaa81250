use crate::bounds::{RegionBounds, region_bounds_for};
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use dashmap::DashMap;
use gtfs_realtime::FeedMessage;
use gtfs_structures::Gtfs;
use parking_lot::{RwLock, RwLockReadGuard};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// One fully built version of the static dataset. Never mutated after
/// construction; a refresh builds a new one.
pub struct StaticSnapshot {
    gtfs: Gtfs,
    bounds: Option<RegionBounds>,
    source: String,
    loaded_at: DateTime<Utc>,
}

impl StaticSnapshot {
    pub fn new(gtfs: Gtfs, source: impl Into<String>) -> Self {
        let bounds = region_bounds_for(&gtfs);
        Self::from_parts(gtfs, bounds, source)
    }

    pub fn from_parts(gtfs: Gtfs, bounds: Option<RegionBounds>, source: impl Into<String>) -> Self {
        Self {
            gtfs,
            bounds,
            source: source.into(),
            loaded_at: Utc::now(),
        }
    }

    pub fn gtfs(&self) -> &Gtfs {
        &self.gtfs
    }

    pub fn region_bounds(&self) -> Option<RegionBounds> {
        self.bounds
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

impl fmt::Debug for StaticSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSnapshot")
            .field("source", &self.source)
            .field("stops", &self.gtfs.stops.len())
            .field("trips", &self.gtfs.trips.len())
            .field("bounds", &self.bounds)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RealtimeKind {
    TripUpdates,
    VehiclePositions,
    ServiceAlerts,
}

impl RealtimeKind {
    pub const ALL: [RealtimeKind; 3] = [
        RealtimeKind::TripUpdates,
        RealtimeKind::VehiclePositions,
        RealtimeKind::ServiceAlerts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RealtimeKind::TripUpdates => "trip-updates",
            RealtimeKind::VehiclePositions => "vehicle-positions",
            RealtimeKind::ServiceAlerts => "alerts",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl FromStr for RealtimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown realtime kind {s:?}"))
    }
}

impl fmt::Display for RealtimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct RealtimeData {
    pub message: Arc<FeedMessage>,
    pub fetched_at: DateTime<Utc>,
}

/// Last successfully fetched payload of each sub-feed of one realtime feed.
#[derive(Clone, Debug, Default)]
pub struct FeedOverlay {
    pub trip_updates: Option<RealtimeData>,
    pub vehicle_positions: Option<RealtimeData>,
    pub service_alerts: Option<RealtimeData>,
}

impl FeedOverlay {
    pub fn get(&self, kind: RealtimeKind) -> Option<&RealtimeData> {
        match kind {
            RealtimeKind::TripUpdates => self.trip_updates.as_ref(),
            RealtimeKind::VehiclePositions => self.vehicle_positions.as_ref(),
            RealtimeKind::ServiceAlerts => self.service_alerts.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: RealtimeKind) -> &mut Option<RealtimeData> {
        match kind {
            RealtimeKind::TripUpdates => &mut self.trip_updates,
            RealtimeKind::VehiclePositions => &mut self.vehicle_positions,
            RealtimeKind::ServiceAlerts => &mut self.service_alerts,
        }
    }
}

#[derive(Default)]
struct Slot {
    snapshot: Option<Arc<StaticSnapshot>>,
    version: u64,
}

/// Owns the live static snapshot and the realtime overlay.
///
/// The snapshot slot sits behind a fair reader/writer lock: any number of
/// readers share it, a refresh takes it exclusively for a pointer swap
/// only. Realtime merges go through a concurrent map and never touch the
/// snapshot lock.
pub struct DataManager {
    slot: RwLock<Slot>,

    // Map FeedID -> Overlay
    overlays: DashMap<CompactString, FeedOverlay>,

    realtime_generation: AtomicU64,

    // Process start, so ETags differ across restarts.
    epoch: u64,
}

/// Shared access to one snapshot. Every read through the same guard sees
/// the same version.
pub struct SnapshotGuard<'a> {
    slot: RwLockReadGuard<'a, Slot>,
}

impl SnapshotGuard<'_> {
    pub fn snapshot(&self) -> Option<&StaticSnapshot> {
        self.slot.snapshot.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.slot.snapshot.is_some()
    }

    pub fn version(&self) -> u64 {
        self.slot.version
    }

    /// Installed bounds, or all zeros when nothing is loaded or the dataset
    /// has no geometry.
    pub fn region_bounds(&self) -> RegionBounds {
        self.snapshot()
            .and_then(StaticSnapshot::region_bounds)
            .unwrap_or_default()
    }
}

impl DataManager {
    pub fn new() -> Self {
        Self::with_epoch(Utc::now().timestamp().max(0) as u64)
    }

    pub fn with_epoch(epoch: u64) -> Self {
        Self {
            slot: RwLock::new(Slot::default()),
            overlays: DashMap::new(),
            realtime_generation: AtomicU64::new(0),
            epoch,
        }
    }

    pub fn read(&self) -> SnapshotGuard<'_> {
        SnapshotGuard {
            slot: self.slot.read(),
        }
    }

    /// Current snapshot for callers that need it beyond a single guard, e.g.
    /// across an await point.
    pub fn current(&self) -> Option<Arc<StaticSnapshot>> {
        self.slot.read().snapshot.clone()
    }

    /// Publishes `snapshot` and returns its version. The snapshot must be
    /// fully built before this call; only the swap happens under the lock.
    pub fn refresh(&self, snapshot: StaticSnapshot) -> u64 {
        let snapshot = Arc::new(snapshot);
        let (version, previous) = {
            let mut slot = self.slot.write();
            slot.version += 1;
            let previous = slot.snapshot.replace(snapshot.clone());
            (slot.version, previous)
        };
        // The old snapshot is released outside the lock; in-flight holders
        // of an Arc keep it alive until they finish.
        drop(previous);
        info!(
            version,
            source = snapshot.source(),
            stops = snapshot.gtfs().stops.len(),
            trips = snapshot.gtfs().trips.len(),
            "static snapshot published"
        );
        version
    }

    /// Opaque token for conditional requests, `None` until a snapshot or
    /// realtime data exists.
    pub fn current_etag(&self) -> Option<String> {
        let version = self.slot.read().version;
        let generation = self.realtime_generation.load(Ordering::Acquire);
        if version == 0 && generation == 0 {
            return None;
        }
        Some(format!("\"{:x}-{:x}-{:x}\"", self.epoch, version, generation))
    }

    /// Replaces one sub-feed of `feed_id`'s overlay and advances the ETag.
    pub fn merge_realtime(&self, feed_id: &str, kind: RealtimeKind, message: FeedMessage) {
        self.merge_realtime_at(feed_id, kind, message, Utc::now());
    }

    pub fn merge_realtime_at(
        &self,
        feed_id: &str,
        kind: RealtimeKind,
        message: FeedMessage,
        fetched_at: DateTime<Utc>,
    ) {
        {
            let mut overlay = self
                .overlays
                .entry(CompactString::from(feed_id))
                .or_default();
            *overlay.slot_mut(kind) = Some(RealtimeData {
                message: Arc::new(message),
                fetched_at,
            });
        }
        self.realtime_generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn overlay(&self, feed_id: &str) -> Option<FeedOverlay> {
        self.overlays.get(feed_id).map(|r| r.value().clone())
    }

    pub fn realtime(&self, feed_id: &str, kind: RealtimeKind) -> Option<RealtimeData> {
        self.overlays
            .get(feed_id)
            .and_then(|r| r.value().get(kind).cloned())
    }

    pub fn feed_ids(&self) -> Vec<CompactString> {
        let mut ids: Vec<_> = self.overlays.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl Default for DataManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn snapshot(label: &str, lat: f64) -> StaticSnapshot {
        let bounds = RegionBounds {
            center_latitude: lat,
            center_longitude: -lat,
            lat_span: lat,
            lon_span: lat,
        };
        StaticSnapshot::from_parts(Gtfs::default(), Some(bounds), label)
    }

    #[test]
    fn test_empty_manager() {
        let manager = DataManager::with_epoch(1);
        let guard = manager.read();

        assert!(!guard.is_ready());
        assert_eq!(guard.version(), 0);
        assert_eq!(guard.region_bounds().as_tuple(), (0.0, 0.0, 0.0, 0.0));
        drop(guard);
        assert_eq!(manager.current_etag(), None);
        assert!(manager.current().is_none());
    }

    #[test]
    fn test_refresh_publishes_new_version() {
        let manager = DataManager::with_epoch(0xabc);

        assert_eq!(manager.refresh(snapshot("v1", 1.0)), 1);
        let etag_v1 = manager.current_etag().unwrap();
        assert_eq!(etag_v1, "\"abc-1-0\"");
        // Idempotent without an intervening change.
        assert_eq!(manager.current_etag().unwrap(), etag_v1);

        assert_eq!(manager.refresh(snapshot("v2", 2.0)), 2);
        let guard = manager.read();
        assert_eq!(guard.snapshot().unwrap().source(), "v2");
        assert_eq!(guard.region_bounds().center_latitude, 2.0);
        drop(guard);
        assert_ne!(manager.current_etag().unwrap(), etag_v1);
    }

    #[test]
    fn test_snapshot_without_geometry_reads_zero_bounds() {
        let manager = DataManager::with_epoch(1);
        manager.refresh(StaticSnapshot::new(Gtfs::default(), "empty"));

        let guard = manager.read();
        assert!(guard.is_ready());
        assert_eq!(guard.region_bounds(), RegionBounds::default());
    }

    #[test]
    fn test_held_arc_survives_refresh() {
        let manager = DataManager::with_epoch(1);
        manager.refresh(snapshot("v1", 1.0));
        let held = manager.current().unwrap();

        manager.refresh(snapshot("v2", 2.0));

        assert_eq!(held.source(), "v1");
        assert_eq!(manager.current().unwrap().source(), "v2");
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_snapshot() {
        let manager = Arc::new(DataManager::with_epoch(1));
        manager.refresh(snapshot("v1", 1.0));

        let writer = {
            let manager = manager.clone();
            thread::spawn(move || {
                for i in 2..=200u64 {
                    manager.refresh(snapshot(&format!("v{i}"), i as f64));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || {
                    let mut last_seen = 0;
                    for _ in 0..2000 {
                        let guard = manager.read();
                        let version = guard.version();
                        let snap = guard.snapshot().unwrap();
                        assert_eq!(snap.source(), format!("v{version}"));
                        assert_eq!(guard.region_bounds().center_latitude, version as f64);
                        // Versions observed by one reader never go backwards.
                        assert!(version >= last_seen);
                        last_seen = version;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        // A reader starting after the last refresh sees it.
        assert_eq!(manager.read().version(), 200);
    }

    #[test]
    fn test_merge_realtime_advances_etag_and_keeps_other_kinds() {
        let manager = DataManager::with_epoch(1);
        assert_eq!(manager.current_etag(), None);

        let mut trips = FeedMessage::default();
        trips.header.gtfs_realtime_version = "2.0".to_string();
        manager.merge_realtime("feed-0", RealtimeKind::TripUpdates, trips);
        let first = manager.current_etag().unwrap();
        assert_eq!(first, "\"1-0-1\"");

        manager.merge_realtime("feed-0", RealtimeKind::VehiclePositions, FeedMessage::default());
        assert_ne!(manager.current_etag().unwrap(), first);

        let overlay = manager.overlay("feed-0").unwrap();
        assert!(overlay.trip_updates.is_some());
        assert!(overlay.vehicle_positions.is_some());
        assert!(overlay.service_alerts.is_none());
        assert!(manager.realtime("feed-1", RealtimeKind::TripUpdates).is_none());
    }

    #[test]
    fn test_feeds_are_keyed_independently() {
        let manager = DataManager::with_epoch(1);
        manager.merge_realtime("b", RealtimeKind::ServiceAlerts, FeedMessage::default());
        manager.merge_realtime("a", RealtimeKind::TripUpdates, FeedMessage::default());

        let ids: Vec<String> = manager.feed_ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(manager.overlay("a").unwrap().service_alerts.is_none());
    }

    #[test]
    fn test_realtime_kind_round_trips_path_segment() {
        for kind in RealtimeKind::ALL {
            assert_eq!(RealtimeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RealtimeKind::parse("bogus"), None);
        assert_eq!("alerts".parse::<RealtimeKind>(), Ok(RealtimeKind::ServiceAlerts));
        assert!("Alerts".parse::<RealtimeKind>().is_err());
    }
}
