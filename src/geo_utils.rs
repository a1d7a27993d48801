//! Geographic utilities: distances, polyline projection, resampling and
//! the discrete Fréchet distance used to score trip similarity.

use geo::{Distance, Haversine};

use crate::Point;

/// Mean Earth radius in meters.
const EARTH_RADIUS: f64 = 6_371_008.8;

/// Great-circle distance between two points in meters.
pub fn haversine_distance(p1: &Point, p2: &Point) -> f64 {
    let a = geo::Point::new(p1.lon, p1.lat);
    let b = geo::Point::new(p2.lon, p2.lat);
    Haversine::distance(a, b)
}

/// Total length of a polyline in meters.
pub fn polyline_length(points: &[Point]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Convert a distance in meters to a (latitude, longitude) span in degrees
/// around `lat`. The longitude span widens towards the poles.
pub fn meters_to_degrees(meters: f64, lat: f64) -> (f64, f64) {
    let lat_deg = (meters / EARTH_RADIUS).to_degrees();
    let cos_lat = lat.to_radians().cos().abs().max(1e-6);
    (lat_deg, (lat_deg / cos_lat).min(360.0))
}

/// Distance in meters from `p` to the segment `a`-`b`.
///
/// Uses a local equirectangular projection centred on `p`, which is accurate
/// for the segment lengths found in GPS tracks.
pub fn point_segment_distance(p: &Point, a: &Point, b: &Point) -> f64 {
    let cos_lat = p.lat.to_radians().cos();
    let project = |q: &Point| {
        (
            (q.lon - p.lon).to_radians() * cos_lat * EARTH_RADIUS,
            (q.lat - p.lat).to_radians() * EARTH_RADIUS,
        )
    };
    let (ax, ay) = project(a);
    let (bx, by) = project(b);
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    (cx * cx + cy * cy).sqrt()
}

/// Nearest point on a polyline.
///
/// Returns the index of the vertex closest to `p` together with the distance
/// from `p` to the polyline itself (which may be shorter than the distance to
/// that vertex). `None` for an empty polyline.
pub fn closest_on_polyline(p: &Point, polyline: &[Point]) -> Option<(usize, f64)> {
    let vertex = polyline
        .iter()
        .enumerate()
        .map(|(i, q)| (i, haversine_distance(p, q)))
        .min_by(|a, b| a.1.total_cmp(&b.1))?;

    let line_distance = polyline
        .windows(2)
        .map(|w| point_segment_distance(p, &w[0], &w[1]))
        .fold(vertex.1, f64::min);

    Some((vertex.0, line_distance))
}

/// Resample a polyline to exactly `target_count` points, evenly spaced by
/// distance. Timestamps are dropped.
pub fn resample(points: &[Point], target_count: usize) -> Vec<Point> {
    let untimed = |p: &Point| Point::new(p.lat, p.lon);

    if points.is_empty() || target_count == 0 {
        return Vec::new();
    }
    if points.len() == 1 || target_count == 1 {
        return vec![untimed(&points[0]); target_count];
    }

    let total_dist = polyline_length(points);
    if total_dist == 0.0 {
        return vec![untimed(&points[0]); target_count];
    }

    let step_dist = total_dist / (target_count - 1) as f64;
    let mut resampled = Vec::with_capacity(target_count);
    resampled.push(untimed(&points[0]));

    let mut accumulated = 0.0;
    let mut next_threshold = step_dist;

    for w in points.windows(2) {
        let (prev, curr) = (&w[0], &w[1]);
        let seg_dist = haversine_distance(prev, curr);

        while seg_dist > 0.0
            && accumulated + seg_dist >= next_threshold
            && resampled.len() < target_count - 1
        {
            // Interpolate point at the threshold distance
            let ratio = (next_threshold - accumulated) / seg_dist;
            resampled.push(Point::new(
                prev.lat + ratio * (curr.lat - prev.lat),
                prev.lon + ratio * (curr.lon - prev.lon),
            ));
            next_threshold += step_dist;
        }

        accumulated += seg_dist;
    }

    // Always end on the last point
    while resampled.len() < target_count {
        resampled.push(untimed(&points[points.len() - 1]));
    }

    resampled
}

/// Discrete Fréchet distance between two polylines, in meters.
///
/// `f64::INFINITY` if either polyline is empty.
pub fn discrete_frechet(a: &[Point], b: &[Point]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }

    // Rolling row of the coupling table
    let mut prev = vec![0.0_f64; b.len()];
    let mut curr = vec![0.0_f64; b.len()];

    for (i, pa) in a.iter().enumerate() {
        for (j, pb) in b.iter().enumerate() {
            let d = haversine_distance(pa, pb);
            curr[j] = match (i, j) {
                (0, 0) => d,
                (0, _) => curr[j - 1].max(d),
                (_, 0) => prev[0].max(d),
                _ => prev[j].min(prev[j - 1]).min(curr[j - 1]).max(d),
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len() - 1]
}
