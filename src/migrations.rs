//! Versioned schema for the geometry store.
//!
//! Geometries are MessagePack sequences of `[lon, lat]` pairs. Bounding boxes
//! are four REAL columns so intersection tests stay plain SQL.

use log::info;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

use crate::error::StoreResult;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            r#"
            CREATE TABLE trips (
                trip_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL DEFAULT '',
                start_date TEXT,
                end_date TEXT,
                min_lat REAL NOT NULL,
                max_lat REAL NOT NULL,
                min_lon REAL NOT NULL,
                max_lon REAL NOT NULL,
                points BLOB NOT NULL,
                timestamps TEXT NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE TABLE trips_transportation_modes (
                mode_id INTEGER PRIMARY KEY AUTOINCREMENT,
                trip_id INTEGER NOT NULL REFERENCES trips(trip_id) ON DELETE CASCADE,
                label TEXT NOT NULL,
                start_date TEXT,
                end_date TEXT,
                start_index INTEGER NOT NULL,
                end_index INTEGER NOT NULL,
                min_lat REAL NOT NULL,
                max_lat REAL NOT NULL,
                min_lon REAL NOT NULL,
                max_lon REAL NOT NULL
            );

            CREATE TABLE locations (
                location_id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL UNIQUE,
                centroid_lon REAL NOT NULL,
                centroid_lat REAL NOT NULL,
                point_cluster BLOB NOT NULL
            );

            CREATE TABLE canonical_trips (
                canonical_id INTEGER PRIMARY KEY AUTOINCREMENT,
                min_lat REAL NOT NULL,
                max_lat REAL NOT NULL,
                min_lon REAL NOT NULL,
                max_lon REAL NOT NULL,
                points BLOB NOT NULL
            );

            CREATE TABLE canonical_trips_relations (
                canonical_trip INTEGER NOT NULL REFERENCES canonical_trips(canonical_id),
                trip INTEGER NOT NULL REFERENCES trips(trip_id),
                PRIMARY KEY (canonical_trip, trip)
            );

            CREATE TABLE stays (
                stay_id INTEGER PRIMARY KEY AUTOINCREMENT,
                location_label TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL
            );

            CREATE INDEX idx_canonical_bounds ON canonical_trips(min_lat, max_lat, min_lon, max_lon);
            CREATE INDEX idx_relations_canonical ON canonical_trips_relations(canonical_trip);
            CREATE INDEX idx_modes_trip ON trips_transportation_modes(trip_id);
            "#,
        ),
        M::up("CREATE INDEX idx_stays_label ON stays(location_label);"),
    ])
}

/// Bring the schema up to date and enable foreign keys.
pub fn migrate(conn: &mut Connection) -> StoreResult<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    let migrations = migrations();
    migrations.to_latest(conn)?;
    info!("[GeometryStore] Schema at latest version");
    Ok(())
}
