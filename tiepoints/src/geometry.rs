//! Planar helpers shared by the RANSAC filter and the locator.

use glam::DVec2;

/// Area of the convex hull of `points` (Andrew's monotone chain).
///
/// Returns 0 for fewer than three points and for collinear clouds.
pub fn convex_hull_area(points: &[DVec2]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }

    let hull = convex_hull(points);
    polygon_area(&hull)
}

/// Counter-clockwise hull vertices without the closing point.
pub fn convex_hull(points: &[DVec2]) -> Vec<DVec2> {
    let mut sorted: Vec<DVec2> = points.to_vec();
    sorted.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    sorted.dedup();

    if sorted.len() < 3 {
        return sorted;
    }

    let mut hull: Vec<DVec2> = Vec::with_capacity(sorted.len() * 2);

    // Lower hull
    for &p in &sorted {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }

    // Upper hull
    let lower_len = hull.len() + 1;
    for &p in sorted.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(p);
    }

    hull.pop();
    hull
}

/// Shoelace area of a simple polygon given by its vertices.
pub fn polygon_area(vertices: &[DVec2]) -> f64 {
    if vertices.len() < 3 {
        return 0.0;
    }

    let twice_area: f64 = vertices
        .iter()
        .zip(vertices.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum();

    twice_area.abs() * 0.5
}

#[inline]
fn cross(o: DVec2, a: DVec2, b: DVec2) -> f64 {
    (a - o).perp_dot(b - o)
}
