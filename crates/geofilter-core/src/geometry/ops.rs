//! Distance and intersection tests between geometries

use super::{Coord, Geometry, Primitive};

const EPSILON: f64 = 1e-12;

fn dist(a: Coord, b: Coord) -> f64 {
    (a.x - b.x).hypot(a.y - b.y)
}

fn cross(o: Coord, a: Coord, b: Coord) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn on_segment(p: Coord, a: Coord, b: Coord) -> bool {
    p.x >= a.x.min(b.x) - EPSILON
        && p.x <= a.x.max(b.x) + EPSILON
        && p.y >= a.y.min(b.y) - EPSILON
        && p.y <= a.y.max(b.y) + EPSILON
}

pub(crate) fn segments_intersect(a: Coord, b: Coord, c: Coord, d: Coord) -> bool {
    let d1 = cross(c, d, a);
    let d2 = cross(c, d, b);
    let d3 = cross(a, b, c);
    let d4 = cross(a, b, d);

    if ((d1 > EPSILON && d2 < -EPSILON) || (d1 < -EPSILON && d2 > EPSILON))
        && ((d3 > EPSILON && d4 < -EPSILON) || (d3 < -EPSILON && d4 > EPSILON))
    {
        return true;
    }

    (d1.abs() <= EPSILON && on_segment(a, c, d))
        || (d2.abs() <= EPSILON && on_segment(b, c, d))
        || (d3.abs() <= EPSILON && on_segment(c, a, b))
        || (d4.abs() <= EPSILON && on_segment(d, a, b))
}

fn point_segment_distance(p: Coord, a: Coord, b: Coord) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len2 = dx * dx + dy * dy;
    if len2 <= EPSILON {
        return dist(p, a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    dist(p, Coord::new(a.x + t * dx, a.y + t * dy))
}

fn segment_distance(a: Coord, b: Coord, c: Coord, d: Coord) -> f64 {
    if segments_intersect(a, b, c, d) {
        return 0.0;
    }
    point_segment_distance(a, c, d)
        .min(point_segment_distance(b, c, d))
        .min(point_segment_distance(c, a, b))
        .min(point_segment_distance(d, a, b))
}

fn point_line_distance(p: Coord, line: &[Coord]) -> f64 {
    match line {
        [] => f64::INFINITY,
        [only] => dist(p, *only),
        _ => line
            .windows(2)
            .map(|w| point_segment_distance(p, w[0], w[1]))
            .fold(f64::INFINITY, f64::min),
    }
}

fn line_line_distance(a: &[Coord], b: &[Coord]) -> f64 {
    if a.len() < 2 {
        return a.first().map_or(f64::INFINITY, |p| point_line_distance(*p, b));
    }
    if b.len() < 2 {
        return b.first().map_or(f64::INFINITY, |p| point_line_distance(*p, a));
    }
    let mut best = f64::INFINITY;
    for s in a.windows(2) {
        for t in b.windows(2) {
            best = best.min(segment_distance(s[0], s[1], t[0], t[1]));
            if best == 0.0 {
                return 0.0;
            }
        }
    }
    best
}

/// Even-odd ray casting; points on the boundary count as inside
pub(crate) fn point_in_ring(p: Coord, ring: &[Coord]) -> bool {
    if point_line_distance(p, ring) <= EPSILON {
        return true;
    }
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (pi, pj) = (ring[i], ring[j]);
        if (pi.y > p.y) != (pj.y > p.y) && p.x < (pj.x - pi.x) * (p.y - pi.y) / (pj.y - pi.y) + pi.x
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub(crate) fn point_in_polygon(p: Coord, rings: &[Vec<Coord>]) -> bool {
    let Some((exterior, holes)) = rings.split_first() else {
        return false;
    };
    if !point_in_ring(p, exterior) {
        return false;
    }
    // on a hole boundary still touches the polygon
    !holes
        .iter()
        .any(|hole| point_in_ring(p, hole) && point_line_distance(p, hole) > EPSILON)
}

fn rings_distance(line: &[Coord], rings: &[Vec<Coord>]) -> f64 {
    rings
        .iter()
        .map(|ring| line_line_distance(line, ring))
        .fold(f64::INFINITY, f64::min)
}

fn primitive_distance(a: Primitive<'_>, b: Primitive<'_>) -> f64 {
    match (a, b) {
        (Primitive::Point(p), Primitive::Point(q)) => dist(p, q),
        (Primitive::Point(p), Primitive::Line(l)) | (Primitive::Line(l), Primitive::Point(p)) => {
            point_line_distance(p, l)
        }
        (Primitive::Point(p), Primitive::Polygon(rings))
        | (Primitive::Polygon(rings), Primitive::Point(p)) => {
            if point_in_polygon(p, rings) {
                0.0
            } else {
                rings
                    .iter()
                    .map(|r| point_line_distance(p, r))
                    .fold(f64::INFINITY, f64::min)
            }
        }
        (Primitive::Line(a), Primitive::Line(b)) => line_line_distance(a, b),
        (Primitive::Line(l), Primitive::Polygon(rings))
        | (Primitive::Polygon(rings), Primitive::Line(l)) => {
            if l.iter().any(|c| point_in_polygon(*c, rings)) {
                0.0
            } else {
                rings_distance(l, rings)
            }
        }
        (Primitive::Polygon(a), Primitive::Polygon(b)) => {
            let a_in_b = a.first().is_some_and(|r| r.iter().any(|c| point_in_polygon(*c, b)));
            let b_in_a = b.first().is_some_and(|r| r.iter().any(|c| point_in_polygon(*c, a)));
            if a_in_b || b_in_a {
                0.0
            } else {
                a.iter()
                    .map(|ring| rings_distance(ring, b))
                    .fold(f64::INFINITY, f64::min)
            }
        }
    }
}

/// Minimum cartesian distance between two geometries (0 when they touch)
pub fn distance(a: &Geometry, b: &Geometry) -> f64 {
    let left = a.primitives();
    let right = b.primitives();
    let mut best = f64::INFINITY;
    for pa in &left {
        for pb in &right {
            best = best.min(primitive_distance(*pa, *pb));
            if best == 0.0 {
                return 0.0;
            }
        }
    }
    best
}

/// Whether two geometries share at least one point
pub fn intersects(a: &Geometry, b: &Geometry) -> bool {
    match (a.bbox(), b.bbox()) {
        (Some(ra), Some(rb)) if ra.intersects(&rb) => distance(a, b) <= EPSILON,
        _ => false,
    }
}

/// Whether `a` lies within `max_distance` of `b`
pub fn within_distance(a: &Geometry, b: &Geometry, max_distance: f64) -> bool {
    match (a.bbox(), b.bbox()) {
        (Some(ra), Some(rb)) if ra.intersects(&rb.expand(max_distance)) => {
            distance(a, b) <= max_distance + EPSILON
        }
        _ => false,
    }
}

/// Signed area of a ring (positive when counter-clockwise)
pub fn ring_area(ring: &[Coord]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for w in ring.windows(2) {
        sum += w[0].x * w[1].y - w[1].x * w[0].y;
    }
    sum / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    fn pt(x: f64, y: f64) -> Geometry {
        Geometry::Point(Coord::new(x, y))
    }

    fn square(x: f64, y: f64, size: f64) -> Geometry {
        Rect::new(x, y, x + size, y + size).to_polygon()
    }

    #[test]
    fn test_point_in_square() {
        assert!(intersects(&pt(0.5, 0.5), &square(0.0, 0.0, 1.0)));
        assert!(intersects(&pt(1.0, 0.5), &square(0.0, 0.0, 1.0)));
        assert!(!intersects(&pt(1.5, 0.5), &square(0.0, 0.0, 1.0)));
    }

    #[test]
    fn test_point_in_hole_is_outside() {
        let donut = Geometry::Polygon(vec![
            vec![
                Coord::new(0.0, 0.0),
                Coord::new(10.0, 0.0),
                Coord::new(10.0, 10.0),
                Coord::new(0.0, 10.0),
                Coord::new(0.0, 0.0),
            ],
            vec![
                Coord::new(4.0, 4.0),
                Coord::new(6.0, 4.0),
                Coord::new(6.0, 6.0),
                Coord::new(4.0, 6.0),
                Coord::new(4.0, 4.0),
            ],
        ]);
        assert!(!intersects(&pt(5.0, 5.0), &donut));
        assert!(intersects(&pt(2.0, 2.0), &donut));
    }

    #[test]
    fn test_crossing_lines() {
        let a = Geometry::LineString(vec![Coord::new(0.0, 0.0), Coord::new(2.0, 2.0)]);
        let b = Geometry::LineString(vec![Coord::new(0.0, 2.0), Coord::new(2.0, 0.0)]);
        assert!(intersects(&a, &b));
    }

    #[test]
    fn test_overlapping_squares_without_vertex_containment() {
        // cross shape: no vertex of one inside the other, edges cross
        let wide = Geometry::Polygon(vec![vec![
            Coord::new(0.0, 1.0),
            Coord::new(3.0, 1.0),
            Coord::new(3.0, 2.0),
            Coord::new(0.0, 2.0),
            Coord::new(0.0, 1.0),
        ]]);
        let tall = Geometry::Polygon(vec![vec![
            Coord::new(1.0, 0.0),
            Coord::new(2.0, 0.0),
            Coord::new(2.0, 3.0),
            Coord::new(1.0, 3.0),
            Coord::new(1.0, 0.0),
        ]]);
        assert!(intersects(&wide, &tall));
    }

    #[test]
    fn test_distance_between_squares() {
        let d = distance(&square(0.0, 0.0, 1.0), &square(4.0, 0.0, 1.0));
        assert!((d - 3.0).abs() < 1e-9);
        assert!(within_distance(&square(0.0, 0.0, 1.0), &square(4.0, 0.0, 1.0), 3.0));
        assert!(!within_distance(&square(0.0, 0.0, 1.0), &square(4.0, 0.0, 1.0), 2.9));
    }

    #[test]
    fn test_ring_area_orientation() {
        if let Geometry::Polygon(rings) = square(0.0, 0.0, 2.0) {
            assert!((ring_area(&rings[0]) - 4.0).abs() < 1e-9);
        }
    }
}
