//! Location register: named places learned from labelled points.
//!
//! A label always maps to exactly one [`Location`]. Points are never
//! rejected under their label; outliers are kept in the cluster but stop
//! moving the centroid once the cluster is established.

use log::{debug, warn};

use crate::error::StoreResult;
use crate::geo_utils::haversine_distance;
use crate::geocoding::PlaceCandidate;
use crate::store::{GeometryStore, StoreTx};
use crate::track_engine::{LocationCandidate, LocationLookup};
use crate::{Location, Point};

fn mean_position<'a>(points: impl Iterator<Item = &'a Point>) -> Option<Point> {
    let (mut lat, mut lon, mut n) = (0.0, 0.0, 0usize);
    for p in points {
        lat += p.lat;
        lon += p.lon;
        n += 1;
    }
    (n > 0).then(|| Point::new(lat / n as f64, lon / n as f64))
}

/// Recompute a centroid after a point was appended to `cluster`.
///
/// Below `min_samples` points the centroid is the mean of the whole cluster.
/// From `min_samples` on it is the mean of the members within `max_distance`
/// meters of `previous`; when none qualifies `previous` is kept.
pub fn update_centroid(
    previous: &Point,
    cluster: &[Point],
    max_distance: f64,
    min_samples: usize,
) -> Point {
    if cluster.len() < min_samples {
        return mean_position(cluster.iter()).unwrap_or(*previous);
    }
    mean_position(
        cluster
            .iter()
            .filter(|p| haversine_distance(p, previous) <= max_distance),
    )
    .unwrap_or(Point::new(previous.lat, previous.lon))
}

/// Find or create the location named `label` and fold `point` into it.
///
/// Exactly one row is inserted or updated per call.
pub fn resolve(
    tx: &StoreTx<'_>,
    label: &str,
    point: &Point,
    max_distance: f64,
    min_samples: usize,
) -> StoreResult<Location> {
    let point = Point::new(point.lat, point.lon);

    match tx.find_location(label)? {
        None => {
            let location = Location {
                label: label.to_string(),
                centroid: point,
                point_cluster: vec![point],
            };
            tx.insert_location(&location)?;
            debug!("[LocationRegister] New location '{}'", label);
            Ok(location)
        }
        Some((id, mut location)) => {
            location.point_cluster.push(point);
            location.centroid = update_centroid(
                &location.centroid,
                &location.point_cluster,
                max_distance,
                min_samples,
            );
            tx.update_location(id, &location)?;
            debug!(
                "[LocationRegister] '{}' now has {} points",
                label,
                location.point_cluster.len()
            );
            Ok(location)
        }
    }
}

/// Merge store and geocoder candidates into one label list, nearest first.
///
/// Labels appear once, at their nearest distance. At most `limit` labels are
/// returned.
pub fn suggest(
    point: &Point,
    known: Vec<LocationCandidate>,
    places: Vec<PlaceCandidate>,
    limit: usize,
) -> Vec<String> {
    let mut ranked: Vec<(String, f64)> = known
        .into_iter()
        .map(|c| (c.label, c.distance))
        .chain(
            places
                .into_iter()
                .map(|p| (p.label, haversine_distance(point, &p.point))),
        )
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut labels: Vec<String> = Vec::new();
    for (label, _) in ranked {
        if labels.len() >= limit {
            break;
        }
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}

impl LocationLookup for GeometryStore {
    fn locations_near(&self, point: &Point, radius: f64) -> Vec<LocationCandidate> {
        self.locations_within(point, radius).unwrap_or_else(|e| {
            warn!("[LocationRegister] Location lookup failed: {}", e);
            Vec::new()
        })
    }
}

/// Lookup used when no store is configured.
pub struct NoLocations;

impl LocationLookup for NoLocations {
    fn locations_near(&self, _point: &Point, _radius: f64) -> Vec<LocationCandidate> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn near(base: &Point, meters_north: f64) -> Point {
        Point::new(base.lat + meters_north / 111_195.0, base.lon)
    }

    #[test]
    fn test_n_resolves_make_one_location() {
        let mut store = GeometryStore::in_memory().unwrap();
        let home = Point::new(41.15, -8.61);
        let tx = store.transaction().unwrap();
        for i in 0..5 {
            resolve(&tx, "home", &near(&home, i as f64), 20.0, 2).unwrap();
        }
        tx.commit().unwrap();

        let locations = store.list_locations().unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].point_cluster.len(), 5);
        assert!(haversine_distance(&locations[0].centroid, &home) < 5.0);
    }

    #[test]
    fn test_labels_never_merge() {
        let mut store = GeometryStore::in_memory().unwrap();
        let p = Point::new(41.15, -8.61);
        let tx = store.transaction().unwrap();
        resolve(&tx, "home", &p, 20.0, 2).unwrap();
        resolve(&tx, "house", &p, 20.0, 2).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.list_locations().unwrap().len(), 2);
    }

    #[test]
    fn test_outlier_appended_but_ignored_by_centroid() {
        let home = Point::new(41.15, -8.61);
        let cluster = vec![home, near(&home, 2.0), near(&home, 500.0)];
        let previous = near(&home, 1.0);

        let centroid = update_centroid(&previous, &cluster, 20.0, 2);
        // Mean of the two close points only
        assert!(haversine_distance(&centroid, &near(&home, 1.0)) < 0.1);
    }

    #[test]
    fn test_small_cluster_uses_plain_mean() {
        let home = Point::new(41.15, -8.61);
        let cluster = vec![home, near(&home, 500.0)];

        let centroid = update_centroid(&home, &cluster, 20.0, 3);
        assert!(haversine_distance(&centroid, &near(&home, 250.0)) < 0.1);
    }

    #[test]
    fn test_centroid_kept_when_nothing_qualifies() {
        let home = Point::new(41.15, -8.61);
        let cluster = vec![near(&home, 100.0), near(&home, 200.0)];
        assert_eq!(update_centroid(&home, &cluster, 20.0, 2), home);
    }

    #[test]
    fn test_suggest_ranks_and_dedupes() {
        let origin = Point::new(41.15, -8.61);
        let known = vec![
            LocationCandidate {
                label: "work".to_string(),
                centroid: near(&origin, 50.0),
                point_cluster: vec![],
                distance: 50.0,
            },
            LocationCandidate {
                label: "home".to_string(),
                centroid: near(&origin, 10.0),
                point_cluster: vec![],
                distance: 10.0,
            },
        ];
        let places = vec![
            PlaceCandidate {
                label: "Cafe".to_string(),
                point: near(&origin, 30.0),
            },
            PlaceCandidate {
                label: "home".to_string(),
                point: near(&origin, 80.0),
            },
        ];

        assert_eq!(
            suggest(&origin, known.clone(), places.clone(), 5),
            vec!["home", "Cafe", "work"]
        );
        assert_eq!(suggest(&origin, known, places, 2), vec!["home", "Cafe"]);
    }
}
