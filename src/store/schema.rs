use gtfs_structures::Gtfs;
use rusqlite::Connection;
use rusqlite::types::Value;
use tracing::info;

use crate::error::LoadError;
use crate::store::loader::{BatchSink, SqliteSink, Table, load_table};

pub const AGENCIES: Table = Table {
    name: "agencies",
    columns: &["id", "name", "url", "timezone", "lang", "phone"],
};

pub const ROUTES: Table = Table {
    name: "routes",
    columns: &["id", "agency_id", "short_name", "long_name", "description", "url"],
};

pub const STOPS: Table = Table {
    name: "stops",
    columns: &["id", "code", "name", "lat", "lon", "parent_station", "platform_code"],
};

pub const TRIPS: Table = Table {
    name: "trips",
    columns: &["id", "route_id", "service_id", "headsign", "short_name", "block_id", "shape_id"],
};

pub const STOP_TIMES: Table = Table {
    name: "stop_times",
    columns: &[
        "trip_id",
        "stop_id",
        "stop_sequence",
        "arrival_time",
        "departure_time",
        "stop_headsign",
        "shape_dist_traveled",
    ],
};

pub const SHAPES: Table = Table {
    name: "shapes",
    columns: &["shape_id", "lat", "lon", "sequence", "dist_traveled"],
};

pub const CALENDAR: Table = Table {
    name: "calendar",
    columns: &[
        "service_id",
        "monday",
        "tuesday",
        "wednesday",
        "thursday",
        "friday",
        "saturday",
        "sunday",
        "start_date",
        "end_date",
    ],
};

pub const CALENDAR_DATES: Table = Table {
    name: "calendar_dates",
    columns: &["service_id", "date", "exception_type"],
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agencies (
    id TEXT, name TEXT NOT NULL, url TEXT, timezone TEXT, lang TEXT, phone TEXT
);
CREATE TABLE IF NOT EXISTS routes (
    id TEXT PRIMARY KEY, agency_id TEXT, short_name TEXT, long_name TEXT,
    description TEXT, url TEXT
);
CREATE TABLE IF NOT EXISTS stops (
    id TEXT PRIMARY KEY, code TEXT, name TEXT, lat REAL, lon REAL,
    parent_station TEXT, platform_code TEXT
);
CREATE TABLE IF NOT EXISTS trips (
    id TEXT PRIMARY KEY, route_id TEXT NOT NULL, service_id TEXT NOT NULL,
    headsign TEXT, short_name TEXT, block_id TEXT, shape_id TEXT
);
CREATE TABLE IF NOT EXISTS stop_times (
    trip_id TEXT NOT NULL, stop_id TEXT NOT NULL, stop_sequence INTEGER NOT NULL,
    arrival_time INTEGER, departure_time INTEGER, stop_headsign TEXT,
    shape_dist_traveled REAL
);
CREATE INDEX IF NOT EXISTS stop_times_trip ON stop_times (trip_id, stop_sequence);
CREATE INDEX IF NOT EXISTS stop_times_stop ON stop_times (stop_id);
CREATE TABLE IF NOT EXISTS shapes (
    shape_id TEXT NOT NULL, lat REAL NOT NULL, lon REAL NOT NULL,
    sequence INTEGER NOT NULL, dist_traveled REAL
);
CREATE INDEX IF NOT EXISTS shapes_id ON shapes (shape_id, sequence);
CREATE TABLE IF NOT EXISTS calendar (
    service_id TEXT PRIMARY KEY, monday INTEGER, tuesday INTEGER,
    wednesday INTEGER, thursday INTEGER, friday INTEGER, saturday INTEGER,
    sunday INTEGER, start_date TEXT, end_date TEXT
);
CREATE TABLE IF NOT EXISTS calendar_dates (
    service_id TEXT NOT NULL, date TEXT NOT NULL, exception_type INTEGER
);
";

const ALL_TABLES: [&Table; 8] = [
    &AGENCIES,
    &ROUTES,
    &STOPS,
    &TRIPS,
    &STOP_TIMES,
    &SHAPES,
    &CALENDAR,
    &CALENDAR_DATES,
];

/// Row counts written by one full load.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoadReport {
    pub tables: Vec<(&'static str, usize)>,
}

impl LoadReport {
    pub fn rows(&self, table: &str) -> usize {
        self.tables
            .iter()
            .find(|(name, _)| *name == table)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Replaces the database contents with `gtfs` inside one transaction. A
/// failed batch rolls the whole replacement back, leaving the previous data.
pub fn replace_all(conn: &mut Connection, gtfs: &Gtfs) -> Result<LoadReport, LoadError> {
    create_schema(conn)?;
    let tx = conn.transaction()?;
    for table in ALL_TABLES {
        tx.execute(&format!("DELETE FROM {}", table.name), [])?;
    }
    let report = {
        let mut sink = SqliteSink::new(&tx);
        write_gtfs(&mut sink, gtfs)?
    };
    tx.commit()?;
    info!(tables = ?report.tables, "static dataset written to storage");
    Ok(report)
}

/// Bulk-loads every static table through `sink`, stopping at the first failure.
pub fn write_gtfs<S: BatchSink>(sink: &mut S, gtfs: &Gtfs) -> Result<LoadReport, LoadError> {
    let mut report = LoadReport::default();

    let n = load_table(sink, &AGENCIES, gtfs.agencies.iter(), |a, out| {
        out.extend([
            sql(&a.id),
            sql(&a.name),
            sql(&a.url),
            sql(&a.timezone),
            sql(&a.lang),
            sql(&a.phone),
        ]);
    })?;
    report.tables.push((AGENCIES.name, n));

    let n = load_table(sink, &ROUTES, gtfs.routes.values(), |r, out| {
        out.extend([
            sql(&r.id),
            sql(&r.agency_id),
            sql(&r.short_name),
            sql(&r.long_name),
            sql(&r.desc),
            sql(&r.url),
        ]);
    })?;
    report.tables.push((ROUTES.name, n));

    let n = load_table(sink, &STOPS, gtfs.stops.values(), |s, out| {
        out.extend([
            sql(&s.id),
            sql(&s.code),
            sql(&s.name),
            sql(&s.latitude),
            sql(&s.longitude),
            sql(&s.parent_station),
            sql(&s.platform_code),
        ]);
    })?;
    report.tables.push((STOPS.name, n));

    let n = load_table(sink, &TRIPS, gtfs.trips.values(), |t, out| {
        out.extend([
            sql(&t.id),
            sql(&t.route_id),
            sql(&t.service_id),
            sql(&t.trip_headsign),
            sql(&t.trip_short_name),
            sql(&t.block_id),
            sql(&t.shape_id),
        ]);
    })?;
    report.tables.push((TRIPS.name, n));

    let stop_times = gtfs
        .trips
        .values()
        .flat_map(|t| t.stop_times.iter().map(move |st| (t.id.as_str(), st)));
    let n = load_table(sink, &STOP_TIMES, stop_times, |(trip_id, st), out| {
        out.extend([
            Value::Text((*trip_id).to_string()),
            sql(&st.stop.id),
            sql(&st.stop_sequence),
            sql(&st.arrival_time),
            sql(&st.departure_time),
            sql(&st.stop_headsign),
            sql(&st.shape_dist_traveled),
        ]);
    })?;
    report.tables.push((STOP_TIMES.name, n));

    let n = load_table(sink, &SHAPES, gtfs.shapes.values().flatten(), |p, out| {
        out.extend([
            sql(&p.id),
            sql(&p.latitude),
            sql(&p.longitude),
            Value::Integer(p.sequence as i64),
            sql(&p.dist_traveled),
        ]);
    })?;
    report.tables.push((SHAPES.name, n));

    let n = load_table(sink, &CALENDAR, gtfs.calendar.values(), |c, out| {
        out.extend([
            sql(&c.id),
            sql(&c.monday),
            sql(&c.tuesday),
            sql(&c.wednesday),
            sql(&c.thursday),
            sql(&c.friday),
            sql(&c.saturday),
            sql(&c.sunday),
            Value::Text(c.start_date.format("%Y%m%d").to_string()),
            Value::Text(c.end_date.format("%Y%m%d").to_string()),
        ]);
    })?;
    report.tables.push((CALENDAR.name, n));

    let n = load_table(
        sink,
        &CALENDAR_DATES,
        gtfs.calendar_dates.values().flatten(),
        |d, out| {
            let exception = match d.exception_type {
                gtfs_structures::Exception::Added => 1,
                gtfs_structures::Exception::Deleted => 2,
            };
            out.extend([
                sql(&d.service_id),
                Value::Text(d.date.format("%Y%m%d").to_string()),
                Value::Integer(exception),
            ]);
        },
    )?;
    report.tables.push((CALENDAR_DATES.name, n));

    Ok(report)
}

/// Conversion of parsed GTFS field types into SQLite values.
trait ToColumn {
    fn to_column(&self) -> Value;
}

impl ToColumn for String {
    fn to_column(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl ToColumn for f64 {
    fn to_column(&self) -> Value {
        Value::Real(*self)
    }
}

impl ToColumn for f32 {
    fn to_column(&self) -> Value {
        Value::Real(f64::from(*self))
    }
}

impl ToColumn for u32 {
    fn to_column(&self) -> Value {
        Value::Integer(i64::from(*self))
    }
}

impl ToColumn for bool {
    fn to_column(&self) -> Value {
        Value::Integer(i64::from(*self))
    }
}

impl<T: ToColumn> ToColumn for Option<T> {
    fn to_column(&self) -> Value {
        self.as_ref().map_or(Value::Null, ToColumn::to_column)
    }
}

fn sql<T: ToColumn>(field: &T) -> Value {
    field.to_column()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_columns_fit_a_statement() {
        for table in ALL_TABLES {
            let rows = crate::store::batch::safe_batch_size(table.fields_per_row() as i64);
            assert!(rows > 0, "{} must fit at least one row", table.name);
        }
    }

    #[test]
    fn test_schema_matches_table_columns() {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        for table in ALL_TABLES {
            let sql = table.insert_sql(1);
            assert!(conn.prepare(&sql).is_ok(), "{sql}");
        }
    }

    #[test]
    fn test_replace_all_with_empty_dataset() {
        let mut conn = Connection::open_in_memory().unwrap();
        let report = replace_all(&mut conn, &Gtfs::default()).unwrap();

        assert_eq!(report.tables.len(), ALL_TABLES.len());
        assert_eq!(report.rows("stops"), 0);
        assert_eq!(report.rows("unknown"), 0);
    }

    #[test]
    fn test_replace_all_clears_previous_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn.execute("INSERT INTO stops (id, name) VALUES ('old', 'Old Stop')", [])
            .unwrap();

        replace_all(&mut conn, &Gtfs::default()).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM stops", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_failed_replace_keeps_previous_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO routes (id, short_name) VALUES ('r1', '1');
             INSERT INTO stops (id, name) VALUES ('old', 'Old Stop');
             CREATE TRIGGER stops_reject BEFORE INSERT ON stops
             BEGIN SELECT RAISE(ABORT, 'boom'); END;",
        )
        .unwrap();

        let mut gtfs = Gtfs::default();
        let stop = gtfs_structures::Stop {
            id: "new".to_string(),
            ..Default::default()
        };
        gtfs.stops.insert(stop.id.clone(), std::sync::Arc::new(stop));

        let err = replace_all(&mut conn, &gtfs).unwrap_err();
        assert!(
            matches!(err, LoadError::Batch { table: "stops", batch_index: 0, .. }),
            "{err}"
        );

        let count = |table: &str| -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(count("routes"), 1);
        assert_eq!(count("stops"), 1);
        let id: String = conn
            .query_row("SELECT id FROM stops", [], |r| r.get(0))
            .unwrap();
        assert_eq!(id, "old");
    }
}
