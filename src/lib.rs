//! # Trip Review
//!
//! Turns raw GPS recordings into confirmed trips, one calendar day at a time,
//! while learning the routes and places that keep coming back.
//!
//! This library provides:
//! - A day-batched review workflow (Preview → Adjust → Annotate → Store) with undo
//! - A canonical-trip register that merges repeated routes into one learned geometry
//! - A location register that clusters labelled points into named places
//! - Route completion from learned routes, weighted by how often they were travelled
//!
//! The geometric track algorithms (smoothing, segmentation, map matching,
//! transportation-mode classification, GPX/LIFE parsing) are supplied by the
//! caller through the [`TrackEngine`] trait.
//!
//! ## Features
//!
//! - **`parallel`** - Predict start times of queued files in parallel with rayon
//! - **`http`** - Enable the Nominatim and Google Places reverse geocoders
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use trip_review::{Bounds, Point};
//!
//! let a = Bounds::from_points(&[Point::new(41.15, -8.61), Point::new(41.16, -8.60)]).unwrap();
//! let b = Bounds::from_points(&[Point::new(41.16, -8.60), Point::new(41.17, -8.59)]).unwrap();
//!
//! // Touching edges count as an intersection
//! assert!(a.intersects(&b));
//! ```

use chrono::{DateTime, Utc};
use rstar::{RTreeObject, AABB};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, ReviewError, StoreError, Warning};

// Immutable configuration with JSON overrides
pub mod config;
pub use config::{with_overrides, ProcessingConfig};

// Geographic utilities (distance, projection, resampling, Fréchet)
pub mod geo_utils;

// External track engine boundary
pub mod track_engine;
pub use track_engine::{AnnotationDocument, LocationCandidate, LocationLookup, TrackEngine};

// SQLite geometry store
pub mod migrations;
pub mod store;
pub use store::{GeometryStore, StoreTx};

// Learning registers
pub mod canonical;
pub use canonical::{complete_route, learn, CanonicalCandidate, LearnOutcome, RouteCompletion};
pub mod locations;

// Reverse geocoding (store suggestions augmented by external services)
pub mod geocoding;
pub use geocoding::{Geocoder, GeocoderSet, PlaceCandidate};

// Review workflow
pub mod day_queue;
pub use day_queue::{DayQueue, RawFile};
pub mod review;
pub use review::{ReviewState, Stage};
pub mod manager;
pub use manager::{AdvanceInput, ProcessingManager, SessionState};
pub mod session;
pub use session::Session;

// ============================================================================
// Core Types
// ============================================================================

/// A GPS fix. The timestamp is optional because learned geometries and
/// annotated places carry none.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl Point {
    /// Create an untimed point.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            time: None,
        }
    }

    /// Create a timestamped point.
    pub fn at(lat: f64, lon: f64, time: DateTime<Utc>) -> Self {
        Self {
            lat,
            lon,
            time: Some(time),
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Bounds {
    /// Create bounds from points. `None` for an empty slice.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut bounds = Self {
            min_lat: f64::MAX,
            max_lat: f64::MIN,
            min_lon: f64::MAX,
            max_lon: f64::MIN,
        };
        for p in points {
            bounds.min_lat = bounds.min_lat.min(p.lat);
            bounds.max_lat = bounds.max_lat.max(p.lat);
            bounds.min_lon = bounds.min_lon.min(p.lon);
            bounds.max_lon = bounds.max_lon.max(p.lon);
        }
        Some(bounds)
    }

    /// The min/max envelope of two points (route completion query box).
    pub fn envelope(a: &Point, b: &Point) -> Self {
        Self {
            min_lat: a.lat.min(b.lat),
            max_lat: a.lat.max(b.lat),
            min_lon: a.lon.min(b.lon),
            max_lon: a.lon.max(b.lon),
        }
    }

    /// Rectangle intersection, inclusive of touching edges.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
            && self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> Point {
        Point::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }
}

/// A transportation mode covering `points[from_index..=to_index]` of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportationTag {
    pub label: String,
    pub from_index: usize,
    pub to_index: usize,
}

/// One continuous piece of a track. After the Preview stage each segment is a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub points: Vec<Point>,
    #[serde(default)]
    pub transportation_modes: Vec<TransportationTag>,
    #[serde(default)]
    pub location_from: Option<String>,
    #[serde(default)]
    pub location_to: Option<String>,
}

impl Segment {
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            points,
            transportation_modes: Vec::new(),
            location_from: None,
            location_to: None,
        }
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(&self.points)
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.points.first().and_then(|p| p.time)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.points.last().and_then(|p| p.time)
    }
}

/// An ordered, non-empty sequence of segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub name: String,
    pub segments: Vec<Segment>,
}

impl Track {
    pub fn new(name: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            name: name.into(),
            segments,
        }
    }

    /// First timestamp of the track, if any point carries one.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.segments
            .iter()
            .flat_map(|s| s.points.iter())
            .find_map(|p| p.time)
    }

    /// Check the structural invariants every stage relies on:
    /// non-empty track and segments, valid coordinates, non-decreasing
    /// timestamps within a segment, and in-range transportation tags.
    pub fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(ReviewError::InvalidTrack {
                message: "track has no segments".to_string(),
            });
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if segment.points.is_empty() {
                return Err(ReviewError::InvalidTrack {
                    message: format!("segment {} has no points", i),
                });
            }
            if let Some(p) = segment.points.iter().find(|p| !p.is_valid()) {
                return Err(ReviewError::InvalidTrack {
                    message: format!("segment {} has invalid point ({}, {})", i, p.lat, p.lon),
                });
            }
            let times: Vec<DateTime<Utc>> = segment.points.iter().filter_map(|p| p.time).collect();
            if times.windows(2).any(|w| w[1] < w[0]) {
                return Err(ReviewError::InvalidTrack {
                    message: format!("segment {} goes back in time", i),
                });
            }
            for tag in &segment.transportation_modes {
                if tag.from_index > tag.to_index || tag.to_index >= segment.points.len() {
                    return Err(ReviewError::InvalidTrack {
                        message: format!(
                            "segment {} has tag '{}' out of range ({}..={})",
                            i, tag.label, tag.from_index, tag.to_index
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A named place learned from labelled points.
///
/// The centroid is always derived from the point cluster, see
/// [`locations::update_centroid`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub label: String,
    pub centroid: Point,
    pub point_cluster: Vec<Point>,
}

/// A learned representative geometry for a recurring route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTrip {
    pub id: i64,
    pub bounds: Bounds,
    pub points: Vec<Point>,
    /// Number of confirmed trips that produced or updated this route
    pub relation_count: u32,
}

/// The persisted record of one confirmed segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTrip {
    pub id: i64,
    pub bounds: Bounds,
    pub points: Vec<Point>,
    pub transportation_modes: Vec<TransportationTag>,
}

/// "Was at location X between T1 and T2", taken from annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stay {
    pub location_label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// ============================================================================
// Spatial Indexing Types
// ============================================================================

/// Location centroid wrapper for R-tree lookups. Coordinates are `[lon, lat]`.
#[derive(Debug, Clone)]
pub(crate) struct CentroidEntry {
    pub location_id: i64,
    pub lon: f64,
    pub lat: f64,
}

impl RTreeObject for CentroidEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lon, self.lat])
    }
}

// ============================================================================
// Tests
// ============================================================================
