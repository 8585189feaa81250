use gtfs_structures::Gtfs;

/// Geographic extent of a static dataset, in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RegionBounds {
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub lat_span: f64,
    pub lon_span: f64,
}

impl RegionBounds {
    pub fn as_tuple(&self) -> (f64, f64, f64, f64) {
        (
            self.center_latitude,
            self.center_longitude,
            self.lat_span,
            self.lon_span,
        )
    }
}

#[derive(Clone, Copy)]
struct Extent {
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
}

impl Extent {
    fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Option<Self> {
        points.into_iter().fold(None, |acc: Option<Extent>, (lat, lon)| {
            Some(match acc {
                None => Extent {
                    min_lat: lat,
                    max_lat: lat,
                    min_lon: lon,
                    max_lon: lon,
                },
                Some(e) => Extent {
                    min_lat: e.min_lat.min(lat),
                    max_lat: e.max_lat.max(lat),
                    min_lon: e.min_lon.min(lon),
                    max_lon: e.max_lon.max(lon),
                },
            })
        })
    }

    fn into_bounds(self) -> RegionBounds {
        RegionBounds {
            center_latitude: (self.min_lat + self.max_lat) / 2.0,
            center_longitude: (self.min_lon + self.max_lon) / 2.0,
            lat_span: self.max_lat - self.min_lat,
            lon_span: self.max_lon - self.min_lon,
        }
    }
}

/// Bounds over every shape point, or over stops with both coordinates when
/// there is no shape geometry. `None` when neither yields a point.
pub fn compute_region_bounds(
    shape_points: impl IntoIterator<Item = (f64, f64)>,
    stop_coords: impl IntoIterator<Item = (Option<f64>, Option<f64>)>,
) -> Option<RegionBounds> {
    Extent::from_points(shape_points)
        .or_else(|| {
            Extent::from_points(stop_coords.into_iter().filter_map(|(lat, lon)| Some((lat?, lon?))))
        })
        .map(Extent::into_bounds)
}

pub fn region_bounds_for(gtfs: &Gtfs) -> Option<RegionBounds> {
    compute_region_bounds(
        gtfs.shapes
            .values()
            .flatten()
            .map(|p| (p.latitude, p.longitude)),
        gtfs.stops.values().map(|s| (s.latitude, s.longitude)),
    )
}
