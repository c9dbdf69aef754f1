use atlas::spatial::geo::haversine_m;

/// Result of advancing along a route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkStep {
    /// New route index
    pub index: usize,
    /// `[lat, lon]` of the route point at `index`
    pub position: [f64; 2],
    pub walked_m: f64,
    /// `index` is the last route point
    pub finished: bool,
}

/// Walk from `route[index]` until about `step_m` is covered or the route ends.
///
/// Positions snap to route vertices. The index always advances by at least one
/// point while the route has points left, so repeated calls terminate within
/// `route.len() - 1` steps.
pub fn advance(route: &[[f64; 2]], index: usize, step_m: f64) -> WalkStep {
    let last = route.len().saturating_sub(1);
    let start = index.min(last);

    if route.is_empty() || start == last {
        return WalkStep {
            index: start,
            position: route.get(start).copied().unwrap_or([0.0, 0.0]),
            walked_m: 0.0,
            finished: true,
        };
    }

    let mut current = start;
    let mut walked = 0.0;
    while current < last && (current == start || walked < step_m) {
        let [lat1, lon1] = route[current];
        let [lat2, lon2] = route[current + 1];
        walked += haversine_m(lat1, lon1, lat2, lon2);
        current += 1;
    }

    WalkStep {
        index: current,
        position: route[current],
        walked_m: walked,
        finished: current == last,
    }
}
