//! Canonical trip register.
//!
//! This module decides, for every confirmed trip, whether it is a new route
//! or another pass over a route already learned:
//! - Bounding-box matching against stored canonical trips
//! - Fréchet similarity scoring on resampled polylines
//! - Weighted geometry merge so a canonical trip converges instead of growing
//! - Route completion from learned routes, weighted by popularity

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::TripLearningConfig;
use crate::error::StoreResult;
use crate::geo_utils::{closest_on_polyline, discrete_frechet, resample};
use crate::store::StoreTx;
use crate::{Bounds, CanonicalTrip, Point};

/// A stored canonical trip overlapping a trip under consideration.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalCandidate {
    pub id: i64,
    pub points: Vec<Point>,
    /// Number of relations (confirmed trips) behind this canonical trip
    pub weight: u32,
}

/// What [`learn`] did with a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    /// A new canonical trip was created
    Created(i64),
    /// The trip was merged into an existing canonical trip
    Merged(i64),
}

impl LearnOutcome {
    pub fn canonical_id(&self) -> i64 {
        match self {
            LearnOutcome::Created(id) | LearnOutcome::Merged(id) => *id,
        }
    }
}

/// Candidate routes between two points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteCompletion {
    /// Point sequences, each oriented from the query's `from` to its `to`
    pub possibilities: Vec<Vec<Point>>,
    /// Relation counts normalized to sum to 1, parallel to `possibilities`
    pub weights: Vec<f64>,
}

// ============================================================================
// Matching
// ============================================================================

/// Canonical trips whose bounding box intersects the bounding box of
/// `points`. Touching edges count. An empty trip matches nothing.
pub fn match_trip(tx: &StoreTx<'_>, points: &[Point]) -> StoreResult<Vec<CanonicalCandidate>> {
    match Bounds::from_points(points) {
        Some(bounds) => tx.canonical_trips_intersecting(&bounds),
        None => Ok(Vec::new()),
    }
}

/// Similarity score between two polylines: discrete Fréchet distance in
/// meters after resampling both to `resample_count` points. Lower is closer.
pub fn similarity(a: &[Point], b: &[Point], resample_count: usize) -> f64 {
    let n = resample_count.max(2);
    discrete_frechet(&resample(a, n), &resample(b, n))
}

// ============================================================================
// Learning
// ============================================================================

/// Merge a trip into a canonical geometry.
///
/// Both polylines are resampled to the same length, bounded by `max_points`,
/// and averaged point by point with the canonical side weighted by
/// `weight` (its relation count). Timestamps are dropped.
pub fn merge_geometry(
    canonical: &[Point],
    trip: &[Point],
    weight: u32,
    max_points: usize,
) -> Vec<Point> {
    let n = canonical
        .len()
        .max(trip.len())
        .clamp(2, max_points.max(2));
    let w = weight.max(1) as f64;

    resample(canonical, n)
        .iter()
        .zip(resample(trip, n).iter())
        .map(|(c, t)| Point::new((c.lat * w + t.lat) / (w + 1.0), (c.lon * w + t.lon) / (w + 1.0)))
        .collect()
}

/// Apply the trip-learning policy to a confirmed trip.
///
/// The best candidate is the one with the lowest [`similarity`] score. When it
/// scores within `config.epsilon` the merged geometry is written through
/// `update_fn`; otherwise (or with no candidates) `insert_fn` creates a new
/// canonical trip. Both callbacks record a provenance relation for
/// `source_trip_id`.
pub fn learn<E, I, U>(
    trip: &[Point],
    source_trip_id: i64,
    candidates: &[CanonicalCandidate],
    insert_fn: I,
    update_fn: U,
    config: &TripLearningConfig,
) -> std::result::Result<LearnOutcome, E>
where
    I: FnOnce(&[Point], i64) -> std::result::Result<i64, E>,
    U: FnOnce(i64, &[Point], i64) -> std::result::Result<(), E>,
{
    let best = candidates
        .iter()
        .map(|c| (c, similarity(&c.points, trip, config.resample_count)))
        .min_by(|a, b| a.1.total_cmp(&b.1));

    match best {
        Some((candidate, score)) if score <= config.epsilon => {
            debug!(
                "[CanonicalTrips] Trip {} matches canonical {} (score {:.1}m)",
                source_trip_id, candidate.id, score
            );
            let merged = merge_geometry(&candidate.points, trip, candidate.weight, config.max_points);
            update_fn(candidate.id, &merged, source_trip_id)?;
            Ok(LearnOutcome::Merged(candidate.id))
        }
        best => {
            if let Some((candidate, score)) = best {
                debug!(
                    "[CanonicalTrips] Trip {} too far from canonical {} (score {:.1}m)",
                    source_trip_id, candidate.id, score
                );
            }
            let untimed: Vec<Point> = trip.iter().map(|p| Point::new(p.lat, p.lon)).collect();
            let id = insert_fn(&untimed, source_trip_id)?;
            Ok(LearnOutcome::Created(id))
        }
    }
}

// ============================================================================
// Route Completion
// ============================================================================

/// Complete a route between `from` and `to` using learned canonical trips.
///
/// `candidates` are canonical trips intersecting the envelope of the two
/// points. Each point anchors to the nearest vertex of a candidate when it
/// lies within `anchor_radius` meters of its polyline. Candidates with a
/// missing anchor, or both anchors on the same vertex, are left out. Weights
/// are the relation counts of the kept candidates normalized to sum to 1.
pub fn complete_route(
    candidates: &[CanonicalTrip],
    from: &Point,
    to: &Point,
    anchor_radius: f64,
) -> RouteCompletion {
    let anchor = |p: &Point, points: &[Point]| {
        closest_on_polyline(p, points)
            .filter(|(_, distance)| *distance <= anchor_radius)
            .map(|(index, _)| index)
    };

    let mut possibilities = Vec::new();
    let mut counts = Vec::new();

    for candidate in candidates {
        let (Some(start), Some(end)) = (anchor(from, &candidate.points), anchor(to, &candidate.points))
        else {
            continue;
        };
        if start == end {
            continue;
        }

        let slice = if start < end {
            candidate.points[start..=end].to_vec()
        } else {
            candidate.points[end..=start].iter().rev().copied().collect()
        };
        possibilities.push(slice);
        counts.push(candidate.relation_count as f64);
    }

    let total: f64 = counts.iter().sum();
    if total <= 0.0 {
        return RouteCompletion::default();
    }

    RouteCompletion {
        possibilities,
        weights: counts.into_iter().map(|c| c / total).collect(),
    }
}
