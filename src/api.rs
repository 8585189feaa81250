use crate::access::{ApiKeys, handle_rejection, require_key};
use crate::caching::{CacheControl, Conditional, NO_STORE, conditional};
use crate::state::{DataManager, RealtimeKind};
use chrono::Utc;
use gtfs_realtime::{FeedHeader, FeedMessage};
use prost::Message;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::Filter;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegionBoundsBody {
    center_lat: f64,
    center_lon: f64,
    lat_span: f64,
    lon_span: f64,
    version: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody {
    version: u64,
    ready: bool,
    source: Option<String>,
    loaded_at: Option<String>,
    agencies: usize,
    routes: usize,
    stops: usize,
    trips: usize,
    shapes: usize,
    realtime_feeds: Vec<FeedStatus>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedStatus {
    id: String,
    /// Sub-feed kind to the time its data was fetched.
    fetched_at: BTreeMap<&'static str, String>,
}

pub fn routes(
    manager: Arc<DataManager>,
    cache: CacheControl,
    keys: Arc<ApiKeys>,
) -> BoxedFilter<(Response,)> {
    // Use .boxed() to simplify types
    let state_filter_base = manager.clone();
    let state_filter = warp::any().map(move || state_filter_base.clone()).boxed();
    let authorized = require_key(keys).boxed();
    let etag_source = {
        let manager = manager.clone();
        move || manager.current_etag()
    };

    // GET /api/region-bounds
    let bounds_route = warp::path!("api" / "region-bounds")
        .and(warp::get())
        .and(authorized.clone())
        .and(conditional(etag_source.clone()))
        .and(state_filter.clone())
        .map(|cond: Conditional, state: Arc<DataManager>| {
            cond.respond(|| {
                let guard = state.read();
                let (center_lat, center_lon, lat_span, lon_span) = guard.region_bounds().as_tuple();
                warp::reply::json(&RegionBoundsBody {
                    center_lat,
                    center_lon,
                    lat_span,
                    lon_span,
                    version: guard.version(),
                })
            })
        });

    // GET /api/snapshot
    let snapshot_route = warp::path!("api" / "snapshot")
        .and(warp::get())
        .and(authorized.clone())
        .and(conditional(etag_source.clone()))
        .and(state_filter.clone())
        .map(|cond: Conditional, state: Arc<DataManager>| {
            cond.respond(|| warp::reply::json(&snapshot_body(&state)))
        });

    // GET /gtfs-rt/<kind>, merged across every feed
    let merged_rt_route = warp::path!("gtfs-rt" / RealtimeKind)
        .and(warp::get())
        .and(authorized.clone())
        .and(conditional(etag_source.clone()))
        .and(state_filter.clone())
        .map(|kind: RealtimeKind, cond: Conditional, state: Arc<DataManager>| {
            cond.respond(|| protobuf(merged_feed(&state, kind)))
        });

    // GET /gtfs-rt/<feed>/<kind>
    let feed_rt_route = warp::path!("gtfs-rt" / String / RealtimeKind)
        .and(warp::get())
        .and(authorized)
        .and(conditional(etag_source))
        .and(state_filter)
        .map(|feed: String, kind: RealtimeKind, cond: Conditional, state: Arc<DataManager>| {
            cond.respond(|| match state.realtime(&feed, kind) {
                Some(data) => protobuf(data.message.encode_to_vec()),
                None => StatusCode::NOT_FOUND.into_response(),
            })
        });

    let cached = bounds_route
        .or(snapshot_route)
        .unify()
        .or(merged_rt_route)
        .unify()
        .or(feed_rt_route)
        .unify()
        .map(move |response: Response| cache.apply(response));

    // GET /healthz
    let health_route = warp::path!("healthz")
        .and(warp::get())
        .map(|| warp::reply::with_header("ok", "cache-control", NO_STORE).into_response());

    health_route
        .or(cached)
        .unify()
        .recover(handle_rejection)
        .unify()
        .boxed()
}

fn snapshot_body(state: &DataManager) -> SnapshotBody {
    let realtime_feeds = state
        .feed_ids()
        .into_iter()
        .filter_map(|id| {
            let overlay = state.overlay(&id)?;
            let fetched_at = RealtimeKind::ALL
                .into_iter()
                .filter_map(|kind| Some((kind.as_str(), overlay.get(kind)?.fetched_at.to_rfc3339())))
                .collect();
            Some(FeedStatus {
                id: id.to_string(),
                fetched_at,
            })
        })
        .collect();
    let guard = state.read();
    let snap = guard.snapshot();
    let count = |f: fn(&gtfs_structures::Gtfs) -> usize| snap.map(|s| f(s.gtfs())).unwrap_or(0);
    SnapshotBody {
        version: guard.version(),
        ready: guard.is_ready(),
        source: snap.map(|s| s.source().to_string()),
        loaded_at: snap.map(|s| s.loaded_at().to_rfc3339()),
        agencies: count(|g| g.agencies.len()),
        routes: count(|g| g.routes.len()),
        stops: count(|g| g.stops.len()),
        trips: count(|g| g.trips.len()),
        shapes: count(|g| g.shapes.len()),
        realtime_feeds,
    }
}

/// All feeds' entities of one kind in a single message.
fn merged_feed(state: &DataManager, kind: RealtimeKind) -> Vec<u8> {
    let mut msg = FeedMessage::default();
    let mut header = FeedHeader::default();
    header.gtfs_realtime_version = "2.0".to_string();
    header.timestamp = Some(Utc::now().timestamp() as u64);
    msg.header = header;

    for feed in state.feed_ids() {
        if let Some(data) = state.realtime(&feed, kind) {
            msg.entity.extend(data.message.entity.iter().cloned());
        }
    }
    msg.encode_to_vec()
}

fn protobuf(body: Vec<u8>) -> Response {
    warp::reply::with_header(body, "content-type", "application/x-protobuf").into_response()
}
