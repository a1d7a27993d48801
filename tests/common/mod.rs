//! Shared fixtures: a deterministic track engine and GPX writers.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use trip_review::config::{
    LocationConfig, SegmentationConfig, SimplificationConfig, SmoothingConfig,
    TransportationConfig,
};
use trip_review::{
    AnnotationDocument, Geocoder, LocationLookup, PlaceCandidate, Point, ProcessingConfig, Result,
    ReviewError, Segment, Stay, Track, TrackEngine, TransportationTag,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Track engine with trivial, predictable geometry:
/// - one segment per file, built from `<trkpt>` lines
/// - `raw_to_trip` is the identity
/// - locations are the nearest known place or the rounded coordinates
/// - every segment is tagged "walk" end to end
/// - annotations are `place <label> <lat> <lon>` and
///   `stay <label> <start> <end>` lines
#[derive(Clone, Default)]
pub struct StubEngine {
    pub learned: Arc<AtomicUsize>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn learned_count(&self) -> usize {
        self.learned.load(Ordering::SeqCst)
    }
}

fn attr<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let key = format!("{}=\"", name);
    let start = line.find(&key)? + key.len();
    let end = line[start..].find('"')? + start;
    Some(&line[start..end])
}

fn element<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = line.find(&open)? + open.len();
    let end = line[start..].find(&close)? + start;
    Some(&line[start..end])
}

fn engine_error(message: impl Into<String>) -> ReviewError {
    ReviewError::TrackEngine {
        message: message.into(),
    }
}

fn place_label(lookup: &dyn LocationLookup, point: &Point) -> String {
    lookup
        .locations_near(point, 50.0)
        .into_iter()
        .next()
        .map(|c| c.label)
        .unwrap_or_else(|| format!("{:.3},{:.3}", point.lat, point.lon))
}

impl TrackEngine for StubEngine {
    fn parse_track(&self, path: &Path) -> Result<Track> {
        let content = fs::read_to_string(path)?;
        let mut points = Vec::new();
        for line in content.lines().filter(|l| l.contains("<trkpt")) {
            let lat = attr(line, "lat").and_then(|v| v.parse().ok());
            let lon = attr(line, "lon").and_then(|v| v.parse().ok());
            let (Some(lat), Some(lon)) = (lat, lon) else {
                return Err(engine_error(format!("bad trkpt in {}", path.display())));
            };
            let time = element(line, "time")
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc));
            points.push(Point { lat, lon, time });
        }
        if points.is_empty() {
            return Err(engine_error(format!("no points in {}", path.display())));
        }
        Ok(Track::new("", vec![Segment::new(points)]))
    }

    fn raw_to_trip(
        &self,
        track: Track,
        _smoothing: &SmoothingConfig,
        _segmentation: &SegmentationConfig,
        _simplification: &SimplificationConfig,
    ) -> Result<Track> {
        Ok(track)
    }

    fn infer_locations(
        &self,
        mut track: Track,
        lookup: &dyn LocationLookup,
        _options: &LocationConfig,
    ) -> Result<Track> {
        for segment in &mut track.segments {
            let first = segment.points[0];
            let last = segment.points[segment.points.len() - 1];
            segment.location_from = Some(place_label(lookup, &first));
            segment.location_to = Some(place_label(lookup, &last));
        }
        Ok(track)
    }

    fn infer_transportation_modes(
        &self,
        mut track: Track,
        _options: &TransportationConfig,
    ) -> Result<Track> {
        for segment in &mut track.segments {
            segment.transportation_modes = vec![TransportationTag {
                label: "walk".to_string(),
                from_index: 0,
                to_index: segment.points.len() - 1,
            }];
        }
        Ok(track)
    }

    fn suggest_transportation_modes(&self, points: &[Point]) -> Vec<String> {
        vec!["walk".to_string(); points.len()]
    }

    fn learn_transportation_modes(&mut self, _track: &Track) -> Result<()> {
        self.learned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn generate_name(&self, track: &Track, format: &str) -> String {
        track
            .start_time()
            .map(|t| t.format(format).to_string())
            .unwrap_or_else(|| "untitled".to_string())
    }

    fn to_annotation(&self, track: &Track) -> String {
        let mut lines = Vec::new();
        for segment in &track.segments {
            let first = segment.points[0];
            let last = segment.points[segment.points.len() - 1];
            if let Some(label) = &segment.location_from {
                lines.push(format!("place {} {} {}", label, first.lat, first.lon));
            }
            if let Some(label) = &segment.location_to {
                lines.push(format!("place {} {} {}", label, last.lat, last.lon));
            }
        }
        lines.join("\n")
    }

    fn parse_annotation(&self, text: &str) -> Result<AnnotationDocument> {
        let mut document = AnnotationDocument::default();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["place", label, lat, lon] => {
                    let lat = lat.parse().map_err(|_| engine_error(line))?;
                    let lon = lon.parse().map_err(|_| engine_error(line))?;
                    document.locations.push((label.to_string(), Point::new(lat, lon)));
                }
                ["stay", label, start, end] => {
                    let parse = |t: &str| {
                        DateTime::parse_from_rfc3339(t)
                            .map(|t| t.with_timezone(&Utc))
                            .map_err(|_| engine_error(line))
                    };
                    document.stays.push(Stay {
                        location_label: label.to_string(),
                        start: parse(start)?,
                        end: parse(end)?,
                    });
                }
                _ => return Err(engine_error(format!("unreadable annotation line '{}'", line))),
            }
        }
        Ok(document)
    }

    fn to_gpx(&self, track: &Track) -> String {
        let mut gpx = String::from("<gpx><trk>\n");
        for segment in &track.segments {
            gpx.push_str("<trkseg>\n");
            for p in &segment.points {
                gpx.push_str(&format!("<trkpt lat=\"{}\" lon=\"{}\"></trkpt>\n", p.lat, p.lon));
            }
            gpx.push_str("</trkseg>\n");
        }
        gpx.push_str("</trk></gpx>\n");
        gpx
    }
}

/// Geocoder that always answers with one place.
pub struct FixedPlace {
    pub place: PlaceCandidate,
}

impl FixedPlace {
    pub fn new(label: &str, point: Point) -> Self {
        Self {
            place: PlaceCandidate {
                label: label.to_string(),
                point,
            },
        }
    }
}

impl Geocoder for FixedPlace {
    fn name(&self) -> &str {
        "fixed-place"
    }

    fn reverse<'a>(
        &'a self,
        _point: &'a Point,
        _radius: f64,
    ) -> BoxFuture<'a, Result<Vec<PlaceCandidate>>> {
        let place = self.place.clone();
        async move { Ok(vec![place]) }.boxed()
    }
}

/// Noon UTC on July `day`, 2016.
pub fn day_start(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2016, 7, day, 12, 0, 0).unwrap()
}

/// East-west walk of `n` points starting at (`lat`, `lon0`), one fix every
/// 30 seconds from `start`.
pub fn walk(lat: f64, lon0: f64, n: usize, start: DateTime<Utc>) -> Vec<Point> {
    (0..n)
        .map(|i| Point::at(lat, lon0 + i as f64 * 0.001, start + Duration::seconds(30 * i as i64)))
        .collect()
}

/// Like [`walk`] but zigzagging ~1m either side of `lat`, so the bounding
/// box has some height.
pub fn wobbly_walk(lat: f64, lon0: f64, n: usize, start: DateTime<Utc>) -> Vec<Point> {
    walk(lat, lon0, n, start)
        .into_iter()
        .enumerate()
        .map(|(i, p)| Point {
            lat: if i % 2 == 0 { p.lat + 0.00001 } else { p.lat - 0.00001 },
            ..p
        })
        .collect()
}

pub fn write_gpx(dir: &Path, name: &str, points: &[Point]) -> PathBuf {
    let mut gpx = String::from("<?xml version=\"1.0\"?>\n<gpx><trk><trkseg>\n");
    for p in points {
        match p.time {
            Some(t) => gpx.push_str(&format!(
                "<trkpt lat=\"{}\" lon=\"{}\"><time>{}</time></trkpt>\n",
                p.lat,
                p.lon,
                t.to_rfc3339()
            )),
            None => gpx.push_str(&format!("<trkpt lat=\"{}\" lon=\"{}\"></trkpt>\n", p.lat, p.lon)),
        }
    }
    gpx.push_str("</trkseg></trk></gpx>\n");
    let path = dir.join(name);
    fs::write(&path, gpx).unwrap();
    path
}

/// Workspace folders for one session.
pub struct Workspace {
    pub root: tempfile::TempDir,
    pub input: PathBuf,
    pub backup: PathBuf,
    pub output: PathBuf,
    pub life: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let root = tempfile::TempDir::new().unwrap();
        let mk = |name: &str| {
            let path = root.path().join(name);
            fs::create_dir(&path).unwrap();
            path
        };
        let (input, backup, output, life) = (mk("input"), mk("backup"), mk("output"), mk("life"));
        Self {
            root,
            input,
            backup,
            output,
            life,
        }
    }

    pub fn config(&self) -> ProcessingConfig {
        ProcessingConfig {
            input_path: Some(self.input.clone()),
            backup_path: Some(self.backup.clone()),
            output_path: Some(self.output.clone()),
            life_path: Some(self.life.clone()),
            ..ProcessingConfig::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.path().join("trips.db")
    }
}
