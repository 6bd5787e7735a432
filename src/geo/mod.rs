//! Geographic primitives for the dispatch core
//!
//! Points are WGS-84 coordinates stored as `f64`. Distances use the
//! haversine great-circle formula, which is accurate to well under a percent
//! at the city scales this simulator operates on. The module also provides
//! the deterministic worker start grid and the hex-packed coverage grid used
//! by the bootstrap procedure.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude.
const METERS_PER_LAT_DEGREE: f64 = 111_320.0;

// ============================================================================
// Point
// ============================================================================

/// A WGS-84 geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

impl Point {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Haversine great-circle distance in meters.
    pub fn distance_m(&self, other: Point) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();

        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();

        let a = (d_lat * 0.5).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon * 0.5).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// Dedup key: coordinates rounded to micro-degrees (~0.1 m).
    pub fn key(&self) -> (i64, i64) {
        (
            (self.lat * 1_000_000.0).round() as i64,
            (self.lon * 1_000_000.0).round() as i64,
        )
    }

    /// Randomize the coordinate by up to `amount` degrees on each axis.
    ///
    /// The default jitter of 0.0003° moves a point by up to ~47 m, enough to
    /// make repeated visits to the same spawn look organic.
    pub fn jittered(&self, amount: f64, rng: &mut impl Rng) -> Point {
        Point {
            lat: rng.gen_range(self.lat - amount..=self.lat + amount),
            lon: rng.gen_range(self.lon - amount..=self.lon + amount),
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

// ============================================================================
// Bounds
// ============================================================================

/// Rectangular scan area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lat_start: f64,
    pub lon_start: f64,
    pub lat_end: f64,
    pub lon_end: f64,
}

impl Bounds {
    pub fn new(lat_start: f64, lon_start: f64, lat_end: f64, lon_end: f64) -> Self {
        Self {
            lat_start,
            lon_start,
            lat_end,
            lon_end,
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        point.lat >= self.lat_start
            && point.lat <= self.lat_end
            && point.lon >= self.lon_start
            && point.lon <= self.lon_end
    }

    pub fn center(&self) -> Point {
        Point {
            lat: (self.lat_start + self.lat_end) / 2.0,
            lon: (self.lon_start + self.lon_end) / 2.0,
        }
    }

    fn lat_span(&self) -> f64 {
        self.lat_end - self.lat_start
    }

    fn lon_span(&self) -> f64 {
        self.lon_end - self.lon_start
    }
}

// ============================================================================
// Worker start grid
// ============================================================================

/// Center of the grid cell assigned to a worker index.
///
/// The area is divided into `rows` x `cols` cells, one per worker; worker
/// `index` owns the cell at row `index / cols`, column `index % cols`.
pub fn cell_center(bounds: &Bounds, rows: usize, cols: usize, index: usize) -> Point {
    let row = (index / cols) as f64;
    let col = (index % cols) as f64;

    let part_lat = bounds.lat_span() / rows as f64;
    let part_lon = bounds.lon_span() / cols as f64;

    Point {
        lat: bounds.lat_start + part_lat * (row + 0.5),
        lon: bounds.lon_start + part_lon * (col + 0.5),
    }
}

// ============================================================================
// Coverage grid
// ============================================================================

fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_LAT_DEGREE
}

fn meters_to_lon_degrees(meters: f64, at_lat: f64) -> f64 {
    meters / (METERS_PER_LAT_DEGREE * at_lat.to_radians().cos())
}

/// Hex-packed coverage grid over the bounds at the given sight radius.
///
/// Rows are spaced 1.5r apart with every odd row offset by half the column
/// spacing of r*sqrt(3), so circles of radius `radius_m` centered on the
/// returned points cover the whole rectangle with minimal overlap.
pub fn coverage_grid(bounds: &Bounds, radius_m: f64) -> Vec<Point> {
    let col_spacing = radius_m * 3.0_f64.sqrt();
    let row_spacing = col_spacing * 3.0_f64.sqrt() / 2.0;

    let lat_gain = meters_to_lat_degrees(row_spacing);
    let lon_gain = meters_to_lon_degrees(col_spacing, bounds.lat_start);

    let mut points = Vec::new();
    let mut lat = bounds.lat_start;
    let mut row = 0usize;
    while lat < bounds.lat_end {
        let mut lon = bounds.lon_start;
        if row % 2 != 0 {
            lon -= 0.5 * lon_gain;
        }
        while lon < bounds.lon_end {
            points.push(Point::new(lat, lon));
            lon += lon_gain;
        }
        lat += lat_gain;
        row += 1;
    }
    points
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn test_bounds() -> Bounds {
        Bounds::new(40.78, -73.97, 40.80, -73.95)
    }

    #[test]
    fn test_distance_zero_for_same_point() {
        let p = Point::new(40.79, -73.96);
        assert!(p.distance_m(p) < 1e-6);
    }

    #[test]
    fn test_distance_one_lat_degree() {
        let a = Point::new(40.0, -73.96);
        let b = Point::new(41.0, -73.96);
        let d = a.distance_m(b);
        // One degree of latitude is ~111.2 km everywhere.
        assert!((d - 111_195.0).abs() < 500.0, "got {d}");
    }

    #[test]
    fn test_distance_symmetric() {
        let a = Point::new(40.78, -73.97);
        let b = Point::new(40.80, -73.95);
        assert!((a.distance_m(b) - b.distance_m(a)).abs() < 1e-9);
    }

    #[test]
    fn test_key_rounds_to_microdegrees() {
        let a = Point::new(40.1234561, -73.9876549);
        let b = Point::new(40.1234564, -73.9876551);
        assert_eq!(a.key(), b.key());

        let c = Point::new(40.1234580, -73.9876549);
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_jitter_stays_within_amount() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let origin = Point::new(40.79, -73.96);
        for _ in 0..100 {
            let j = origin.jittered(0.0003, &mut rng);
            assert!((j.lat - origin.lat).abs() <= 0.0003);
            assert!((j.lon - origin.lon).abs() <= 0.0003);
        }
    }

    #[test]
    fn test_bounds_contains() {
        let bounds = test_bounds();
        assert!(bounds.contains(bounds.center()));
        assert!(!bounds.contains(Point::new(41.0, -73.96)));
    }

    #[test]
    fn test_cell_centers_distinct_and_inside() {
        let bounds = test_bounds();
        let (rows, cols) = (3, 4);
        let mut keys = std::collections::HashSet::new();
        for i in 0..rows * cols {
            let center = cell_center(&bounds, rows, cols, i);
            assert!(bounds.contains(center), "worker {i} center out of bounds");
            assert!(keys.insert(center.key()), "worker {i} center collides");
        }
    }

    #[test]
    fn test_cell_center_single_cell_is_area_center() {
        let bounds = test_bounds();
        let center = cell_center(&bounds, 1, 1, 0);
        let expected = bounds.center();
        assert!((center.lat - expected.lat).abs() < 1e-9);
        assert!((center.lon - expected.lon).abs() < 1e-9);
    }

    #[test]
    fn test_coverage_grid_covers_bounds() {
        let bounds = test_bounds();
        let radius = 120.0;
        let points = coverage_grid(&bounds, radius);
        assert!(!points.is_empty());

        // Every grid point must be near the area (odd rows poke out half a
        // column to the west).
        for p in &points {
            assert!(p.lat >= bounds.lat_start && p.lat < bounds.lat_end + 0.01);
        }

        // The area center must be within sight of some grid point.
        let center = bounds.center();
        let nearest = points
            .iter()
            .map(|p| p.distance_m(center))
            .fold(f64::INFINITY, f64::min);
        assert!(nearest <= radius * 1.5, "nearest grid point {nearest} m away");
    }

    #[test]
    fn test_coverage_grid_density_scales_with_radius() {
        let bounds = test_bounds();
        let fine = coverage_grid(&bounds, 70.0);
        let coarse = coverage_grid(&bounds, 200.0);
        assert!(fine.len() > coarse.len());
    }
}
