// Spatial index over (lat, lon, payload) points

pub mod geo;
mod quadtree;

pub use quadtree::QuadTree;

/// A geotagged point carrying an opaque payload.
#[derive(Clone, Debug)]
pub struct Point<T> {
    pub lat: f64,
    pub lon: f64,
    pub data: T,
}

impl<T> Point<T> {
    pub fn new(lat: f64, lon: f64, data: T) -> Self {
        Self { lat, lon, data }
    }
}

/// Axis-aligned box in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Whole-world box.
    pub fn world() -> Self {
        Self {
            min_lat: -90.0,
            min_lon: -180.0,
            max_lat: 90.0,
            max_lon: 180.0,
        }
    }

    /// True when the box spans the 180th meridian (`min_lon > max_lon`).
    pub fn crosses_antimeridian(&self) -> bool {
        self.min_lon > self.max_lon
    }

    /// Longitude intervals covered, split at the antimeridian.
    fn lon_spans(&self) -> [(f64, f64); 2] {
        if self.crosses_antimeridian() {
            [(self.min_lon, 180.0), (-180.0, self.max_lon)]
        } else {
            [(self.min_lon, self.max_lon); 2]
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat
            && lat <= self.max_lat
            && self.lon_spans().iter().any(|&(lo, hi)| lon >= lo && lon <= hi)
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.lon_spans().iter().any(|&(a_lo, a_hi)| {
                other
                    .lon_spans()
                    .iter()
                    .any(|&(b_lo, b_hi)| a_lo <= b_hi && a_hi >= b_lo)
            })
    }

    pub fn center(&self) -> (f64, f64) {
        let lat = (self.min_lat + self.max_lat) / 2.0;
        if self.crosses_antimeridian() {
            let lon = (self.min_lon + self.max_lon + 360.0) / 2.0;
            (lat, if lon > 180.0 { lon - 360.0 } else { lon })
        } else {
            (lat, (self.min_lon + self.max_lon) / 2.0)
        }
    }
}

/// Point-region index contract consumed by the entity store.
///
/// Implementations own their points; `k_nearest` ranks candidates inside the box
/// by great-circle distance from the box centre.
pub trait SpatialIndex<T>: Send + Sync {
    /// Inserts a point. Returns false if the coordinates are rejected.
    fn insert(&mut self, point: Point<T>) -> bool;

    /// Removes the first point at exactly (`lat`, `lon`) whose payload matches.
    fn remove(&mut self, lat: f64, lon: f64, matches: &dyn Fn(&T) -> bool) -> Option<Point<T>>;

    /// Replaces a point, moving it if the coordinates changed.
    ///
    /// Returns false if the old point was not found or the new one was rejected;
    /// in the latter case the old point is restored.
    fn update(
        &mut self,
        old_lat: f64,
        old_lon: f64,
        matches: &dyn Fn(&T) -> bool,
        new: Point<T>,
    ) -> bool;

    /// Up to `limit` points inside `bbox` matching `filter`, nearest first.
    fn k_nearest(&self, bbox: &BoundingBox, limit: usize, filter: &dyn Fn(&T) -> bool) -> Vec<&Point<T>>;

    /// Every stored point, in no particular order.
    fn points(&self) -> Vec<&Point<T>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
