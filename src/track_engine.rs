//! Boundary to the external track engine.
//!
//! The review workflow never touches raw geometry algorithms itself. Parsing,
//! smoothing, segmentation, simplification, location and transportation-mode
//! inference and the GPX/LIFE text formats all live behind [`TrackEngine`].

use std::path::Path;

use crate::config::{
    LocationConfig, SegmentationConfig, SimplificationConfig, SmoothingConfig,
    TransportationConfig,
};
use crate::{Point, Result, Stay, Track};

/// A known place near a queried point.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationCandidate {
    pub label: String,
    pub centroid: Point,
    pub point_cluster: Vec<Point>,
    /// Distance from the queried point to the centroid, in meters
    pub distance: f64,
}

/// Repository of known locations handed to the engine during location
/// inference. Lookups never fail: an unreachable store yields no candidates.
pub trait LocationLookup {
    /// Locations whose centroid lies within `radius` meters of `point`,
    /// nearest first.
    fn locations_near(&self, point: &Point, radius: f64) -> Vec<LocationCandidate>;
}

/// A parsed annotation document: named places and stays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationDocument {
    pub locations: Vec<(String, Point)>,
    pub stays: Vec<Stay>,
}

/// Geometry operations supplied by the track engine.
pub trait TrackEngine: Send + Sync {
    /// Read one raw recording from disk.
    fn parse_track(&self, path: &Path) -> Result<Track>;

    /// Turn a raw track into trips: smoothing, segmentation, simplification.
    fn raw_to_trip(
        &self,
        track: Track,
        smoothing: &SmoothingConfig,
        segmentation: &SegmentationConfig,
        simplification: &SimplificationConfig,
    ) -> Result<Track>;

    /// Label the start and end of every segment, using `lookup` for places
    /// already known.
    fn infer_locations(
        &self,
        track: Track,
        lookup: &dyn LocationLookup,
        options: &LocationConfig,
    ) -> Result<Track>;

    /// Attach transportation tags to every segment.
    fn infer_transportation_modes(
        &self,
        track: Track,
        options: &TransportationConfig,
    ) -> Result<Track>;

    /// Suggest a transportation label for each point of a polyline.
    fn suggest_transportation_modes(&self, points: &[Point]) -> Vec<String>;

    /// Update the transportation-mode model from a track whose tags were
    /// confirmed by a person.
    fn learn_transportation_modes(&mut self, track: &Track) -> Result<()>;

    /// Name for a track from a strftime-style pattern.
    fn generate_name(&self, track: &Track, format: &str) -> String;

    /// Engine-derived annotation summary of a track (LIFE text).
    fn to_annotation(&self, track: &Track) -> String;

    /// Parse annotation text (LIFE) into places and stays.
    fn parse_annotation(&self, text: &str) -> Result<AnnotationDocument>;

    /// Serialize a track as GPX.
    fn to_gpx(&self, track: &Track) -> String;
}
