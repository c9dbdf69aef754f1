//! Geodesy helpers shared by the store and the simulation.

use super::BoundingBox;

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Metres per degree of latitude (and of longitude at the equator).
const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Returns true if the coordinate pair is finite and inside the world bounds.
pub fn valid_coordinates(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Great-circle distance in metres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Bounding box that encloses a circle of `radius_m` around the point.
///
/// Longitude span widens with latitude; near the poles the box covers the full
/// longitude range. A box reaching past ±180° wraps to the other side, giving
/// `min_lon > max_lon`.
pub fn bounding_box(lat: f64, lon: f64, radius_m: f64) -> BoundingBox {
    let d_lat = radius_m / METERS_PER_DEGREE;
    let cos_lat = lat.to_radians().cos().abs();
    let d_lon = if cos_lat < 1e-6 {
        180.0
    } else {
        (radius_m / (METERS_PER_DEGREE * cos_lat)).min(180.0)
    };

    let (min_lon, max_lon) = if d_lon >= 180.0 {
        (-180.0, 180.0)
    } else {
        (wrap_lon(lon - d_lon), wrap_lon(lon + d_lon))
    };

    BoundingBox {
        min_lat: (lat - d_lat).max(-90.0),
        min_lon,
        max_lat: (lat + d_lat).min(90.0),
        max_lon,
    }
}

/// Normalise a longitude into [-180, 180].
fn wrap_lon(lon: f64) -> f64 {
    if lon > 180.0 {
        lon - 360.0
    } else if lon < -180.0 {
        lon + 360.0
    } else {
        lon
    }
}

/// Destination reached by travelling `distance_m` from the point along `bearing_deg`
/// (clockwise from north).
pub fn destination(lat: f64, lon: f64, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    let lon2 = (lambda2.to_degrees() + 540.0) % 360.0 - 180.0;
    (phi2.to_degrees(), lon2)
}

/// Perpendicular distance in metres from `p` to the segment `a`–`b`.
///
/// Uses a local equirectangular projection centred on `a`, which is accurate at
/// street scale. Points are `[lat, lon]`.
pub fn perpendicular_distance_m(p: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    let cos_lat = a[0].to_radians().cos();
    let project = |q: [f64; 2]| {
        (
            (q[1] - a[1]) * METERS_PER_DEGREE * cos_lat,
            (q[0] - a[0]) * METERS_PER_DEGREE,
        )
    };

    let (px, py) = project(p);
    let (bx, by) = project(b);
    let len_sq = bx * bx + by * by;
    if len_sq == 0.0 {
        return (px * px + py * py).sqrt();
    }

    let t = ((px * bx + py * by) / len_sq).clamp(0.0, 1.0);
    let (dx, dy) = (px - t * bx, py - t * by);
    (dx * dx + dy * dy).sqrt()
}

/// Total length in metres of a `[lat, lon]` polyline.
pub fn polyline_length_m(points: &[[f64; 2]]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_m(w[0][0], w[0][1], w[1][0], w[1][1]))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // London (Charing Cross) to Paris (Notre-Dame) ≈ 343 km
        let d = haversine_m(51.5074, -0.1278, 48.8530, 2.3499);
        assert!((d - 343_500.0).abs() < 2_000.0, "distance was {}", d);
    }

    #[test]
    fn test_haversine_zero() {
        assert_eq!(haversine_m(51.41, -0.30, 51.41, -0.30), 0.0);
    }

    #[test]
    fn test_bounding_box_contains_circle_edge() {
        let bbox = bounding_box(51.41, -0.30, 1_000.0);
        let (north_lat, north_lon) = destination(51.41, -0.30, 0.0, 999.0);
        let (east_lat, east_lon) = destination(51.41, -0.30, 90.0, 999.0);
        assert!(bbox.contains(north_lat, north_lon));
        assert!(bbox.contains(east_lat, east_lon));

        let (far_lat, far_lon) = destination(51.41, -0.30, 0.0, 1_200.0);
        assert!(!bbox.contains(far_lat, far_lon));
    }

    #[test]
    fn test_bounding_box_wraps_at_antimeridian() {
        let bbox = bounding_box(-17.0, 179.99, 5_000.0);
        assert!(bbox.crosses_antimeridian());
        assert!(bbox.contains(-17.0, -179.99));
        assert!(bbox.contains(-17.0, 179.95));
        assert!(!bbox.contains(-17.0, 0.0));

        let (_, center_lon) = bbox.center();
        assert!((center_lon - 179.99).abs() < 1e-9);

        assert!(!bounding_box(51.41, -0.30, 5_000.0).crosses_antimeridian());
    }

    #[test]
    fn test_destination_roundtrip_distance() {
        let (lat, lon) = destination(51.41, -0.30, 135.0, 350.0);
        let d = haversine_m(51.41, -0.30, lat, lon);
        assert!((d - 350.0).abs() < 0.5);
    }

    #[test]
    fn test_perpendicular_distance() {
        let a = [51.0, 0.0];
        let b = [51.0, 0.01];
        let (off_lat, off_lon) = destination(51.0, 0.005, 0.0, 25.0);
        let d = perpendicular_distance_m([off_lat, off_lon], a, b);
        assert!((d - 25.0).abs() < 0.5, "distance was {}", d);
    }

    #[test]
    fn test_valid_coordinates() {
        assert!(valid_coordinates(0.0, 0.0));
        assert!(!valid_coordinates(91.0, 0.0));
        assert!(!valid_coordinates(0.0, f64::NAN));
    }
}
