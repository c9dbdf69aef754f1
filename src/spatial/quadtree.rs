use super::geo::{haversine_m, valid_coordinates};
use super::{BoundingBox, Point, SpatialIndex};

/// Points held by a leaf before it splits.
const NODE_CAPACITY: usize = 16;

/// Leaves at this depth never split (cells are ~0.0002° wide).
const MAX_DEPTH: u8 = 20;

/// Point-region quadtree covering the whole world.
pub struct QuadTree<T> {
    root: Node<T>,
    len: usize,
}

struct Node<T> {
    bounds: BoundingBox,
    depth: u8,
    points: Vec<Point<T>>,
    children: Option<Box<[Node<T>; 4]>>,
}

impl<T> Node<T> {
    fn new(bounds: BoundingBox, depth: u8) -> Self {
        Self {
            bounds,
            depth,
            points: Vec::new(),
            children: None,
        }
    }

    /// Child slot for a coordinate. Boundary points go to the upper/eastern cell,
    /// and removal uses the same rule so lookups are deterministic.
    fn quadrant(&self, lat: f64, lon: f64) -> usize {
        let (mid_lat, mid_lon) = self.bounds.center();
        let north = (lat >= mid_lat) as usize;
        let east = (lon >= mid_lon) as usize;
        north * 2 + east
    }

    fn split(&mut self) {
        let b = self.bounds;
        let (mid_lat, mid_lon) = b.center();
        let depth = self.depth + 1;
        let cell = |min_lat, min_lon, max_lat, max_lon| {
            Node::new(
                BoundingBox {
                    min_lat,
                    min_lon,
                    max_lat,
                    max_lon,
                },
                depth,
            )
        };

        let mut children = Box::new([
            cell(b.min_lat, b.min_lon, mid_lat, mid_lon),
            cell(b.min_lat, mid_lon, mid_lat, b.max_lon),
            cell(mid_lat, b.min_lon, b.max_lat, mid_lon),
            cell(mid_lat, mid_lon, b.max_lat, b.max_lon),
        ]);

        for point in self.points.drain(..) {
            let q = {
                let north = (point.lat >= mid_lat) as usize;
                let east = (point.lon >= mid_lon) as usize;
                north * 2 + east
            };
            children[q].points.push(point);
        }

        self.children = Some(children);
    }

    fn insert(&mut self, point: Point<T>) {
        if self.children.is_none() {
            if self.points.len() < NODE_CAPACITY || self.depth >= MAX_DEPTH {
                self.points.push(point);
                return;
            }
            self.split();
        }

        let q = self.quadrant(point.lat, point.lon);
        if let Some(children) = self.children.as_mut() {
            children[q].insert(point);
        }
    }

    fn remove(&mut self, lat: f64, lon: f64, matches: &dyn Fn(&T) -> bool) -> Option<Point<T>> {
        if let Some(children) = self.children.as_mut() {
            let q = {
                let (mid_lat, mid_lon) = self.bounds.center();
                (lat >= mid_lat) as usize * 2 + (lon >= mid_lon) as usize
            };
            return children[q].remove(lat, lon, matches);
        }

        let pos = self
            .points
            .iter()
            .position(|p| p.lat == lat && p.lon == lon && matches(&p.data))?;
        Some(self.points.swap_remove(pos))
    }

    fn collect<'a>(
        &'a self,
        bbox: &BoundingBox,
        filter: &dyn Fn(&T) -> bool,
        out: &mut Vec<&'a Point<T>>,
    ) {
        if !self.bounds.intersects(bbox) {
            return;
        }
        match &self.children {
            Some(children) => {
                for child in children.iter() {
                    child.collect(bbox, filter, out);
                }
            }
            None => out.extend(
                self.points
                    .iter()
                    .filter(|p| bbox.contains(p.lat, p.lon) && filter(&p.data)),
            ),
        }
    }
}

impl<T> QuadTree<T> {
    pub fn new() -> Self {
        Self {
            root: Node::new(BoundingBox::world(), 0),
            len: 0,
        }
    }
}

impl<T> Default for QuadTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> SpatialIndex<T> for QuadTree<T> {
    fn insert(&mut self, point: Point<T>) -> bool {
        if !valid_coordinates(point.lat, point.lon) {
            return false;
        }
        self.root.insert(point);
        self.len += 1;
        true
    }

    fn remove(&mut self, lat: f64, lon: f64, matches: &dyn Fn(&T) -> bool) -> Option<Point<T>> {
        if !valid_coordinates(lat, lon) {
            return None;
        }
        let removed = self.root.remove(lat, lon, matches);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn update(
        &mut self,
        old_lat: f64,
        old_lon: f64,
        matches: &dyn Fn(&T) -> bool,
        new: Point<T>,
    ) -> bool {
        let Some(old) = self.remove(old_lat, old_lon, matches) else {
            return false;
        };
        if !valid_coordinates(new.lat, new.lon) {
            self.insert(old);
            return false;
        }
        self.insert(new)
    }

    fn k_nearest(&self, bbox: &BoundingBox, limit: usize, filter: &dyn Fn(&T) -> bool) -> Vec<&Point<T>> {
        if limit == 0 {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        self.root.collect(bbox, filter, &mut candidates);

        let (c_lat, c_lon) = bbox.center();
        let mut ranked: Vec<(f64, &Point<T>)> = candidates
            .into_iter()
            .map(|p| (haversine_m(c_lat, c_lon, p.lat, p.lon), p))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked.truncate(limit);
        ranked.into_iter().map(|(_, p)| p).collect()
    }

    fn points(&self) -> Vec<&Point<T>> {
        let mut out = Vec::with_capacity(self.len);
        self.root.collect(&BoundingBox::world(), &|_| true, &mut out);
        out
    }

    fn len(&self) -> usize {
        self.len
    }
}
