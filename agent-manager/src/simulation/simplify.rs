use atlas::spatial::geo::perpendicular_distance_m;

/// Ramer–Douglas–Peucker simplification of a `[lat, lon]` track.
///
/// Endpoints are always kept. Interior points closer than `tolerance_m` to the
/// chord of their span are dropped.
pub fn simplify(points: &[[f64; 2]], tolerance_m: f64) -> Vec<[f64; 2]> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    // Pending (start, end) spans
    let mut spans = vec![(0, points.len() - 1)];
    while let Some((start, end)) = spans.pop() {
        if end <= start + 1 {
            continue;
        }

        let (index, max_dist) = (start + 1..end)
            .map(|i| (i, perpendicular_distance_m(points[i], points[start], points[end])))
            .fold((start, 0.0), |best, cur| if cur.1 > best.1 { cur } else { best });

        if max_dist > tolerance_m {
            keep[index] = true;
            spans.push((start, index));
            spans.push((index, end));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}
