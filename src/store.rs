//! # Geometry Store
//!
//! SQLite-backed storage for trips, transportation tags, locations, stays and
//! canonical trips.
//!
//! ## Write path
//!
//! Every write goes through a [`StoreTx`]. A batch of related writes (trip,
//! its tags, locations, canonical trip merge) either commits as a whole or is
//! rolled back when the transaction is dropped, so a partially stored trip is
//! never visible.
//!
//! ## Geometry encoding
//!
//! Point sequences are stored as MessagePack arrays of `[lon, lat]` pairs.
//! This axis order is fixed for every writer and reader in this module;
//! timestamps live in a separate JSON column.
//!
//! ## Location index
//!
//! Location centroids are mirrored in an in-memory R-tree that is loaded on
//! open and rebuilt whenever a committed batch touched the locations table.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rstar::{RTree, AABB};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};

use crate::canonical::CanonicalCandidate;
use crate::error::{StoreError, StoreResult};
use crate::geo_utils::{haversine_distance, meters_to_degrees};
use crate::migrations::migrate;
use crate::track_engine::LocationCandidate;
use crate::{
    Bounds, CanonicalTrip, CentroidEntry, Location, Point, Segment, Stay, StoredTrip,
    TransportationTag,
};

// ============================================================================
// Geometry Codec
// ============================================================================

/// Encode points as `[lon, lat]` pairs.
pub fn encode_points(points: &[Point]) -> StoreResult<Vec<u8>> {
    let pairs: Vec<[f64; 2]> = points.iter().map(|p| [p.lon, p.lat]).collect();
    rmp_serde::to_vec(&pairs).map_err(|e| StoreError::Codec {
        message: e.to_string(),
    })
}

/// Decode `[lon, lat]` pairs back into untimed points.
pub fn decode_points(blob: &[u8]) -> StoreResult<Vec<Point>> {
    let pairs: Vec<[f64; 2]> = rmp_serde::from_slice(blob).map_err(|e| StoreError::Codec {
        message: e.to_string(),
    })?;
    Ok(pairs.into_iter().map(|[lon, lat]| Point::new(lat, lon)).collect())
}

fn encode_timestamps(points: &[Point]) -> StoreResult<String> {
    let times: Vec<Option<DateTime<Utc>>> = points.iter().map(|p| p.time).collect();
    serde_json::to_string(&times).map_err(|e| StoreError::Codec {
        message: e.to_string(),
    })
}

fn decode_timestamps(json: &str) -> StoreResult<Vec<Option<DateTime<Utc>>>> {
    serde_json::from_str(json).map_err(|e| StoreError::Codec {
        message: e.to_string(),
    })
}

fn parse_time(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Codec {
            message: format!("bad timestamp '{}': {}", text, e),
        })
}

fn require_bounds(points: &[Point]) -> StoreResult<Bounds> {
    Bounds::from_points(points).ok_or_else(|| StoreError::Codec {
        message: "cannot store an empty geometry".to_string(),
    })
}

fn bounds_from_row(row: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<Bounds> {
    Ok(Bounds {
        min_lat: row.get(first)?,
        max_lat: row.get(first + 1)?,
        min_lon: row.get(first + 2)?,
        max_lon: row.get(first + 3)?,
    })
}

// ============================================================================
// Geometry Store
// ============================================================================

/// Connection to the geometry store.
pub struct GeometryStore {
    conn: Connection,
    /// Centroids of every committed location
    location_index: RTree<CentroidEntry>,
}

impl GeometryStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| StoreError::Unreachable {
            message: format!("{}: {}", path.display(), e),
        })?;
        info!("[GeometryStore] Opened {}", path.display());
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Unreachable {
            message: e.to_string(),
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(mut conn: Connection) -> StoreResult<Self> {
        migrate(&mut conn)?;
        let entries = load_centroids(&conn)?;
        debug!("[GeometryStore] Indexed {} location centroids", entries.len());
        Ok(Self {
            conn,
            location_index: RTree::bulk_load(entries),
        })
    }

    /// Start a write batch.
    pub fn transaction(&mut self) -> StoreResult<StoreTx<'_>> {
        Ok(StoreTx {
            tx: self.conn.transaction()?,
            location_index: &mut self.location_index,
            locations_changed: Cell::new(false),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Canonical trips whose bounds intersect `bounds`, with their relation
    /// counts. Only trips with at least one relation are returned.
    pub fn canonical_trips_with_weights(&self, bounds: &Bounds) -> StoreResult<Vec<CanonicalTrip>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.canonical_id, c.min_lat, c.max_lat, c.min_lon, c.max_lon, c.points,
                    COUNT(r.trip)
             FROM canonical_trips AS c
                 INNER JOIN canonical_trips_relations AS r ON c.canonical_id = r.canonical_trip
             WHERE c.min_lat <= ?2 AND c.max_lat >= ?1 AND c.min_lon <= ?4 AND c.max_lon >= ?3
             GROUP BY c.canonical_id
             ORDER BY c.canonical_id",
        )?;
        let rows = stmt
            .query_map(
                params![bounds.min_lat, bounds.max_lat, bounds.min_lon, bounds.max_lon],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        bounds_from_row(row, 1)?,
                        row.get::<_, Vec<u8>>(5)?,
                        row.get::<_, u32>(6)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, bounds, blob, relation_count)| {
                Ok(CanonicalTrip {
                    id,
                    bounds,
                    points: decode_points(&blob)?,
                    relation_count,
                })
            })
            .collect()
    }

    /// All canonical trips, oldest first.
    pub fn list_canonical_trips(&self) -> StoreResult<Vec<CanonicalTrip>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.canonical_id, c.min_lat, c.max_lat, c.min_lon, c.max_lon, c.points,
                    (SELECT COUNT(*) FROM canonical_trips_relations r
                     WHERE r.canonical_trip = c.canonical_id)
             FROM canonical_trips AS c
             ORDER BY c.canonical_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    bounds_from_row(row, 1)?,
                    row.get::<_, Vec<u8>>(5)?,
                    row.get::<_, u32>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, bounds, blob, relation_count)| {
                Ok(CanonicalTrip {
                    id,
                    bounds,
                    points: decode_points(&blob)?,
                    relation_count,
                })
            })
            .collect()
    }

    /// Source trip ids related to a canonical trip, in insertion order.
    pub fn canonical_relations(&self, canonical_id: i64) -> StoreResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT trip FROM canonical_trips_relations WHERE canonical_trip = ? ORDER BY rowid",
        )?;
        let ids = stmt
            .query_map(params![canonical_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// All locations, by label.
    pub fn list_locations(&self) -> StoreResult<Vec<Location>> {
        let mut stmt = self.conn.prepare(
            "SELECT label, centroid_lat, centroid_lon, point_cluster FROM locations ORDER BY label",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Point::new(row.get(1)?, row.get(2)?),
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(label, centroid, blob)| {
                Ok(Location {
                    label,
                    centroid,
                    point_cluster: decode_points(&blob)?,
                })
            })
            .collect()
    }

    /// Location by exact label.
    pub fn location(&self, label: &str) -> StoreResult<Option<Location>> {
        Ok(find_location(&self.conn, label)?.map(|(_, location)| location))
    }

    /// Locations whose centroid is within `radius` meters of `point`,
    /// nearest first.
    pub fn locations_within(&self, point: &Point, radius: f64) -> StoreResult<Vec<LocationCandidate>> {
        let (dlat, dlon) = meters_to_degrees(radius, point.lat);
        let envelope = AABB::from_corners(
            [point.lon - dlon, point.lat - dlat],
            [point.lon + dlon, point.lat + dlat],
        );

        let mut hits: Vec<(i64, Point, f64)> = self
            .location_index
            .locate_in_envelope(&envelope)
            .map(|e| {
                let centroid = Point::new(e.lat, e.lon);
                (e.location_id, centroid, haversine_distance(point, &centroid))
            })
            .filter(|(_, _, d)| *d <= radius)
            .collect();
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        hits.sort_by(|a, b| a.2.total_cmp(&b.2));

        let placeholders = vec!["?"; hits.len()].join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT location_id, label, point_cluster FROM locations WHERE location_id IN ({})",
            placeholders
        ))?;
        let mut rows: HashMap<i64, (String, Vec<u8>)> = stmt
            .query_map(params_from_iter(hits.iter().map(|(id, _, _)| *id)), |row| {
                Ok((row.get::<_, i64>(0)?, (row.get(1)?, row.get(2)?)))
            })?
            .collect::<rusqlite::Result<_>>()?;

        hits.into_iter()
            .filter_map(|(id, centroid, distance)| {
                rows.remove(&id).map(|(label, blob)| (label, blob, centroid, distance))
            })
            .map(|(label, blob, centroid, distance)| {
                Ok(LocationCandidate {
                    label,
                    centroid,
                    point_cluster: decode_points(&blob)?,
                    distance,
                })
            })
            .collect()
    }

    /// A stored trip by id.
    pub fn trip(&self, trip_id: i64) -> StoreResult<Option<StoredTrip>> {
        let row = self
            .conn
            .query_row(
                "SELECT min_lat, max_lat, min_lon, max_lon, points, timestamps
                 FROM trips WHERE trip_id = ?",
                params![trip_id],
                |row| {
                    Ok((
                        bounds_from_row(row, 0)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((bounds, blob, timestamps)) = row else {
            return Ok(None);
        };

        let times = decode_timestamps(&timestamps)?;
        let points = decode_points(&blob)?
            .into_iter()
            .zip(times.into_iter().chain(std::iter::repeat(None)))
            .map(|(p, time)| Point { time, ..p })
            .collect();

        let mut stmt = self.conn.prepare(
            "SELECT label, start_index, end_index FROM trips_transportation_modes
             WHERE trip_id = ? ORDER BY mode_id",
        )?;
        let transportation_modes = stmt
            .query_map(params![trip_id], |row| {
                Ok(TransportationTag {
                    label: row.get(0)?,
                    from_index: row.get::<_, i64>(1)? as usize,
                    to_index: row.get::<_, i64>(2)? as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(StoredTrip {
            id: trip_id,
            bounds,
            points,
            transportation_modes,
        }))
    }

    /// All stays, ordered by start.
    pub fn list_stays(&self) -> StoreResult<Vec<Stay>> {
        let mut stmt = self.conn.prepare(
            "SELECT location_label, start_date, end_date FROM stays ORDER BY start_date, stay_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(location_label, start, end)| {
                Ok(Stay {
                    location_label,
                    start: parse_time(&start)?,
                    end: parse_time(&end)?,
                })
            })
            .collect()
    }

    /// Row counts per table, for diagnostics.
    pub fn stats(&self) -> StoreResult<HashMap<&'static str, i64>> {
        let mut stats = HashMap::new();
        for table in [
            "trips",
            "trips_transportation_modes",
            "locations",
            "stays",
            "canonical_trips",
            "canonical_trips_relations",
        ] {
            let count: i64 =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            stats.insert(table, count);
        }
        Ok(stats)
    }
}

fn load_centroids(conn: &Connection) -> rusqlite::Result<Vec<CentroidEntry>> {
    let mut stmt = conn.prepare("SELECT location_id, centroid_lon, centroid_lat FROM locations")?;
    let entries = stmt
        .query_map([], |row| {
            Ok(CentroidEntry {
                location_id: row.get(0)?,
                lon: row.get(1)?,
                lat: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

fn find_location(conn: &Connection, label: &str) -> StoreResult<Option<(i64, Location)>> {
    let row = conn
        .query_row(
            "SELECT location_id, centroid_lat, centroid_lon, point_cluster
             FROM locations WHERE label = ?",
            params![label],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Point::new(row.get(1)?, row.get(2)?),
                    row.get::<_, Vec<u8>>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(id, centroid, blob)| {
        Ok((
            id,
            Location {
                label: label.to_string(),
                centroid,
                point_cluster: decode_points(&blob)?,
            },
        ))
    })
    .transpose()
}

// ============================================================================
// Write Batch
// ============================================================================

/// An open write batch. Dropping it without [`StoreTx::commit`] rolls back
/// every write made through it.
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
    location_index: &'a mut RTree<CentroidEntry>,
    locations_changed: Cell<bool>,
}

impl StoreTx<'_> {
    pub fn commit(self) -> StoreResult<()> {
        let StoreTx {
            tx,
            location_index,
            locations_changed,
        } = self;
        // Read through the open transaction so the index matches what commits
        let entries = if locations_changed.get() {
            Some(load_centroids(&tx)?)
        } else {
            None
        };
        tx.commit()?;
        if let Some(entries) = entries {
            *location_index = RTree::bulk_load(entries);
        }
        Ok(())
    }

    /// Insert one confirmed segment and its transportation tags.
    pub fn insert_trip(&self, name: &str, segment: &Segment) -> StoreResult<i64> {
        let bounds = require_bounds(&segment.points)?;
        self.tx.execute(
            "INSERT INTO trips (name, start_date, end_date, min_lat, max_lat, min_lon, max_lon,
                                points, timestamps)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                name,
                segment.start_time().map(|t| t.to_rfc3339()),
                segment.end_time().map(|t| t.to_rfc3339()),
                bounds.min_lat,
                bounds.max_lat,
                bounds.min_lon,
                bounds.max_lon,
                encode_points(&segment.points)?,
                encode_timestamps(&segment.points)?,
            ],
        )?;
        let trip_id = self.tx.last_insert_rowid();

        for tag in &segment.transportation_modes {
            self.insert_transportation_tag(trip_id, tag, segment)?;
        }

        debug!(
            "[GeometryStore] Inserted trip {} ({} points, {} tags)",
            trip_id,
            segment.points.len(),
            segment.transportation_modes.len()
        );
        Ok(trip_id)
    }

    fn insert_transportation_tag(
        &self,
        trip_id: i64,
        tag: &TransportationTag,
        segment: &Segment,
    ) -> StoreResult<()> {
        let span = segment
            .points
            .get(tag.from_index..=tag.to_index)
            .ok_or_else(|| StoreError::Codec {
                message: format!(
                    "tag '{}' range {}..={} outside {} points",
                    tag.label,
                    tag.from_index,
                    tag.to_index,
                    segment.points.len()
                ),
            })?;
        let bounds = require_bounds(span)?;
        self.tx.execute(
            "INSERT INTO trips_transportation_modes
                 (trip_id, label, start_date, end_date, start_index, end_index,
                  min_lat, max_lat, min_lon, max_lon)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                trip_id,
                tag.label,
                span[0].time.map(|t| t.to_rfc3339()),
                span[span.len() - 1].time.map(|t| t.to_rfc3339()),
                tag.from_index as i64,
                tag.to_index as i64,
                bounds.min_lat,
                bounds.max_lat,
                bounds.min_lon,
                bounds.max_lon,
            ],
        )?;
        Ok(())
    }

    /// Location by exact label, with its row id.
    pub fn find_location(&self, label: &str) -> StoreResult<Option<(i64, Location)>> {
        find_location(&self.tx, label)
    }

    pub fn insert_location(&self, location: &Location) -> StoreResult<i64> {
        self.tx.execute(
            "INSERT INTO locations (label, centroid_lon, centroid_lat, point_cluster)
             VALUES (?, ?, ?, ?)",
            params![
                location.label,
                location.centroid.lon,
                location.centroid.lat,
                encode_points(&location.point_cluster)?,
            ],
        )?;
        self.locations_changed.set(true);
        Ok(self.tx.last_insert_rowid())
    }

    pub fn update_location(&self, location_id: i64, location: &Location) -> StoreResult<()> {
        self.tx.execute(
            "UPDATE locations SET centroid_lon = ?, centroid_lat = ?, point_cluster = ?
             WHERE location_id = ?",
            params![
                location.centroid.lon,
                location.centroid.lat,
                encode_points(&location.point_cluster)?,
                location_id,
            ],
        )?;
        self.locations_changed.set(true);
        Ok(())
    }

    /// Canonical trips whose bounds intersect `bounds` (touching edges
    /// included), with their relation counts as weights.
    pub fn canonical_trips_intersecting(
        &self,
        bounds: &Bounds,
    ) -> StoreResult<Vec<CanonicalCandidate>> {
        let mut stmt = self.tx.prepare(
            "SELECT c.canonical_id, c.points,
                    (SELECT COUNT(*) FROM canonical_trips_relations r
                     WHERE r.canonical_trip = c.canonical_id)
             FROM canonical_trips AS c
             WHERE c.min_lat <= ?2 AND c.max_lat >= ?1 AND c.min_lon <= ?4 AND c.max_lon >= ?3
             ORDER BY c.canonical_id",
        )?;
        let rows = stmt
            .query_map(
                params![bounds.min_lat, bounds.max_lat, bounds.min_lon, bounds.max_lon],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, blob, weight)| {
                Ok(CanonicalCandidate {
                    id,
                    points: decode_points(&blob)?,
                    weight,
                })
            })
            .collect()
    }

    /// Insert a canonical trip and its first provenance relation.
    pub fn insert_canonical_trip(&self, points: &[Point], source_trip_id: i64) -> StoreResult<i64> {
        let bounds = require_bounds(points)?;
        self.tx.execute(
            "INSERT INTO canonical_trips (min_lat, max_lat, min_lon, max_lon, points)
             VALUES (?, ?, ?, ?, ?)",
            params![
                bounds.min_lat,
                bounds.max_lat,
                bounds.min_lon,
                bounds.max_lon,
                encode_points(points)?,
            ],
        )?;
        let canonical_id = self.tx.last_insert_rowid();
        self.insert_relation(canonical_id, source_trip_id)?;
        Ok(canonical_id)
    }

    /// Replace a canonical trip's geometry and add a provenance relation.
    pub fn update_canonical_trip(
        &self,
        canonical_id: i64,
        points: &[Point],
        source_trip_id: i64,
    ) -> StoreResult<()> {
        let bounds = require_bounds(points)?;
        self.tx.execute(
            "UPDATE canonical_trips SET min_lat = ?, max_lat = ?, min_lon = ?, max_lon = ?, points = ?
             WHERE canonical_id = ?",
            params![
                bounds.min_lat,
                bounds.max_lat,
                bounds.min_lon,
                bounds.max_lon,
                encode_points(points)?,
                canonical_id,
            ],
        )?;
        self.insert_relation(canonical_id, source_trip_id)
    }

    fn insert_relation(&self, canonical_id: i64, source_trip_id: i64) -> StoreResult<()> {
        self.tx.execute(
            "INSERT INTO canonical_trips_relations (canonical_trip, trip) VALUES (?, ?)",
            params![canonical_id, source_trip_id],
        )?;
        Ok(())
    }

    pub fn insert_stay(&self, stay: &Stay) -> StoreResult<()> {
        self.tx.execute(
            "INSERT INTO stays (location_label, start_date, end_date) VALUES (?, ?, ?)",
            params![
                stay.location_label,
                stay.start.to_rfc3339(),
                stay.end.to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_469_432_452 + secs, 0).unwrap()
    }

    fn sample_segment() -> Segment {
        let mut segment = Segment::new(
            (0..5)
                .map(|i| Point::at(41.15 + i as f64 * 0.001, -8.61, t(i * 30)))
                .collect(),
        );
        segment.transportation_modes.push(TransportationTag {
            label: "walk".to_string(),
            from_index: 1,
            to_index: 3,
        });
        segment
    }

    #[test]
    fn test_codec_keeps_lon_lat_order() {
        let points = vec![Point::new(41.0, -8.0)];
        let blob = encode_points(&points).unwrap();
        let pairs: Vec<[f64; 2]> = rmp_serde::from_slice(&blob).unwrap();
        assert_eq!(pairs, vec![[-8.0, 41.0]]);
        assert_eq!(decode_points(&blob).unwrap(), points);
    }

    #[test]
    fn test_insert_trip_with_tags() {
        let mut store = GeometryStore::in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let id = tx.insert_trip("2016-07-25", &sample_segment()).unwrap();
        tx.commit().unwrap();

        let trip = store.trip(id).unwrap().unwrap();
        assert_eq!(trip.points.len(), 5);
        assert_eq!(trip.points[2].time, Some(t(60)));
        assert_eq!(trip.transportation_modes.len(), 1);
        assert_eq!(trip.transportation_modes[0].label, "walk");
        assert_eq!(trip.bounds.min_lat, 41.15);

        assert!(store.trip(id + 1).unwrap().is_none());
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let mut store = GeometryStore::in_memory().unwrap();
        {
            let tx = store.transaction().unwrap();
            let id = tx.insert_trip("", &sample_segment()).unwrap();
            tx.insert_canonical_trip(&sample_segment().points, id).unwrap();
            // dropped without commit
        }
        let stats = store.stats().unwrap();
        assert_eq!(stats["trips"], 0);
        assert_eq!(stats["canonical_trips"], 0);
        assert_eq!(stats["canonical_trips_relations"], 0);
    }

    #[test]
    fn test_tag_out_of_range_is_rejected() {
        let mut store = GeometryStore::in_memory().unwrap();
        let mut segment = sample_segment();
        segment.transportation_modes[0].to_index = 9;
        let tx = store.transaction().unwrap();
        assert!(matches!(
            tx.insert_trip("", &segment),
            Err(StoreError::Codec { .. })
        ));
    }

    #[test]
    fn test_canonical_intersection_and_relations() {
        let mut store = GeometryStore::in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let a = tx.insert_trip("", &sample_segment()).unwrap();
        let b = tx.insert_trip("", &sample_segment()).unwrap();
        let can = tx.insert_canonical_trip(&sample_segment().points, a).unwrap();
        tx.update_canonical_trip(can, &sample_segment().points, b).unwrap();

        // Shares exactly one edge with the segment's bounds
        let touching = Bounds {
            min_lat: sample_segment().bounds().unwrap().max_lat,
            max_lat: 41.2,
            min_lon: -8.61,
            max_lon: -8.5,
        };
        let hits = tx.canonical_trips_intersecting(&touching).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].weight, 2);

        let far = Bounds {
            min_lat: 10.0,
            max_lat: 11.0,
            min_lon: 10.0,
            max_lon: 11.0,
        };
        assert!(tx.canonical_trips_intersecting(&far).unwrap().is_empty());
        tx.commit().unwrap();

        assert_eq!(store.canonical_relations(can).unwrap(), vec![a, b]);
        let weighted = store.canonical_trips_with_weights(&touching).unwrap();
        assert_eq!(weighted[0].relation_count, 2);
    }

    #[test]
    fn test_locations_within_orders_by_distance() {
        let mut store = GeometryStore::in_memory().unwrap();
        let tx = store.transaction().unwrap();
        for (label, lat) in [("far", 41.1520), ("near", 41.1505), ("out", 41.2)] {
            let p = Point::new(lat, -8.61);
            tx.insert_location(&Location {
                label: label.to_string(),
                centroid: p,
                point_cluster: vec![p],
            })
            .unwrap();
        }
        tx.commit().unwrap();

        let found = store.locations_within(&Point::new(41.15, -8.61), 300.0).unwrap();
        let labels: Vec<&str> = found.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["near", "far"]);
        assert!(found[0].distance < found[1].distance);
        assert_eq!(found[0].point_cluster.len(), 1);
        assert!(store
            .locations_within(&Point::new(10.0, 10.0), 300.0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_location_index_follows_committed_writes() {
        let mut store = GeometryStore::in_memory().unwrap();
        let home = Point::new(41.15, -8.61);
        let moved = Point::new(41.16, -8.61);

        let tx = store.transaction().unwrap();
        let id = tx
            .insert_location(&Location {
                label: "home".to_string(),
                centroid: home,
                point_cluster: vec![home],
            })
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(store.locations_within(&home, 50.0).unwrap().len(), 1);

        let tx = store.transaction().unwrap();
        tx.update_location(
            id,
            &Location {
                label: "home".to_string(),
                centroid: moved,
                point_cluster: vec![home, moved],
            },
        )
        .unwrap();
        tx.commit().unwrap();
        assert!(store.locations_within(&home, 50.0).unwrap().is_empty());
        let found = store.locations_within(&moved, 50.0).unwrap();
        assert_eq!(found[0].label, "home");
        assert_eq!(found[0].point_cluster.len(), 2);

        {
            let tx = store.transaction().unwrap();
            tx.insert_location(&Location {
                label: "work".to_string(),
                centroid: home,
                point_cluster: vec![home],
            })
            .unwrap();
            // dropped without commit
        }
        assert!(store.locations_within(&home, 50.0).unwrap().is_empty());
    }

    #[test]
    fn test_location_index_loaded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trips.db");
        let home = Point::new(41.15, -8.61);
        {
            let mut store = GeometryStore::open(&path).unwrap();
            let tx = store.transaction().unwrap();
            tx.insert_location(&Location {
                label: "home".to_string(),
                centroid: home,
                point_cluster: vec![home],
            })
            .unwrap();
            tx.commit().unwrap();
        }
        let store = GeometryStore::open(&path).unwrap();
        assert_eq!(store.locations_within(&home, 10.0).unwrap()[0].label, "home");
    }

    #[test]
    fn test_stays_round_trip() {
        let mut store = GeometryStore::in_memory().unwrap();
        let tx = store.transaction().unwrap();
        tx.insert_stay(&Stay {
            location_label: "home".to_string(),
            start: t(0),
            end: t(3600),
        })
        .unwrap();
        tx.commit().unwrap();

        let stays = store.list_stays().unwrap();
        assert_eq!(stays.len(), 1);
        assert_eq!(stays[0].end, t(3600));
    }
}
