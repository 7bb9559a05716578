//! In-process geometry support
//!
//! Just enough geometry to prepare reference geometries (union, repair,
//! reprojection between geographic and web mercator) and to evaluate the
//! generic driver's predicates. Database backends never use this for
//! filtering: they push predicates to the storage engine.

pub mod ops;
pub mod repair;
pub mod transform;
pub mod wkt;

pub use ops::{distance, intersects};
pub use repair::{repair, validate, GeometryIssue, RepairOutcome, RepairStep};
pub use wkt::{parse_wkt, to_wkt};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Simple-features geometry
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    /// Exterior ring first, then holes
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    Collection(Vec<Geometry>),
}

/// Borrowed atomic part of a geometry
#[derive(Debug, Clone, Copy)]
pub enum Primitive<'a> {
    Point(Coord),
    Line(&'a [Coord]),
    Polygon(&'a [Vec<Coord>]),
}

impl Geometry {
    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::LineString(_) => "LineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPoint(_) => "MultiPoint",
            Geometry::MultiLineString(_) => "MultiLineString",
            Geometry::MultiPolygon(_) => "MultiPolygon",
            Geometry::Collection(_) => "GeometryCollection",
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Geometry::Point(_) => false,
            Geometry::LineString(c) | Geometry::MultiPoint(c) => c.is_empty(),
            Geometry::Polygon(rings) => rings.first().is_none_or(|r| r.is_empty()),
            Geometry::MultiLineString(lines) => lines.iter().all(|l| l.is_empty()),
            Geometry::MultiPolygon(polys) => {
                polys.iter().all(|p| p.first().is_none_or(|r| r.is_empty()))
            }
            Geometry::Collection(parts) => parts.iter().all(Geometry::is_empty),
        }
    }

    /// Flatten into points, lines and polygons
    pub fn primitives(&self) -> Vec<Primitive<'_>> {
        let mut out = Vec::new();
        self.collect_primitives(&mut out);
        out
    }

    fn collect_primitives<'a>(&'a self, out: &mut Vec<Primitive<'a>>) {
        match self {
            Geometry::Point(c) => out.push(Primitive::Point(*c)),
            Geometry::LineString(coords) => out.push(Primitive::Line(coords)),
            Geometry::Polygon(rings) => out.push(Primitive::Polygon(rings)),
            Geometry::MultiPoint(coords) => out.extend(coords.iter().map(|c| Primitive::Point(*c))),
            Geometry::MultiLineString(lines) => {
                out.extend(lines.iter().map(|l| Primitive::Line(l.as_slice())))
            }
            Geometry::MultiPolygon(polys) => {
                out.extend(polys.iter().map(|p| Primitive::Polygon(p.as_slice())))
            }
            Geometry::Collection(parts) => {
                for part in parts {
                    part.collect_primitives(out);
                }
            }
        }
    }

    /// Visit every coordinate
    pub fn coords(&self) -> Vec<Coord> {
        let mut out = Vec::new();
        for prim in self.primitives() {
            match prim {
                Primitive::Point(c) => out.push(c),
                Primitive::Line(coords) => out.extend_from_slice(coords),
                Primitive::Polygon(rings) => {
                    for ring in rings {
                        out.extend_from_slice(ring);
                    }
                }
            }
        }
        out
    }

    /// Apply a function to every coordinate
    pub fn map_coords(&self, f: &impl Fn(Coord) -> Coord) -> Geometry {
        let line = |coords: &Vec<Coord>| coords.iter().map(|c| f(*c)).collect::<Vec<_>>();
        let poly = |rings: &Vec<Vec<Coord>>| rings.iter().map(line).collect::<Vec<_>>();
        match self {
            Geometry::Point(c) => Geometry::Point(f(*c)),
            Geometry::LineString(c) => Geometry::LineString(line(c)),
            Geometry::Polygon(rings) => Geometry::Polygon(poly(rings)),
            Geometry::MultiPoint(c) => Geometry::MultiPoint(line(c)),
            Geometry::MultiLineString(lines) => {
                Geometry::MultiLineString(lines.iter().map(line).collect())
            }
            Geometry::MultiPolygon(polys) => Geometry::MultiPolygon(polys.iter().map(poly).collect()),
            Geometry::Collection(parts) => {
                Geometry::Collection(parts.iter().map(|p| p.map_coords(f)).collect())
            }
        }
    }

    pub fn bbox(&self) -> Option<Rect> {
        Rect::from_coords(&self.coords())
    }

    /// Combine several geometries into one collection, flattening nested collections
    pub fn collect(parts: impl IntoIterator<Item = Geometry>) -> Geometry {
        let mut flat = Vec::new();
        for part in parts {
            match part {
                Geometry::Collection(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Geometry::Collection(flat)
        }
    }
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Rect {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn from_coords(coords: &[Coord]) -> Option<Self> {
        let first = coords.first()?;
        let mut rect = Rect::new(first.x, first.y, first.x, first.y);
        for c in &coords[1..] {
            rect.min_x = rect.min_x.min(c.x);
            rect.min_y = rect.min_y.min(c.y);
            rect.max_x = rect.max_x.max(c.x);
            rect.max_y = rect.max_y.max(c.y);
        }
        Some(rect)
    }

    /// Grow (or shrink, for negative distances) on every side
    pub fn expand(&self, distance: f64) -> Self {
        Rect::new(
            self.min_x - distance,
            self.min_y - distance,
            self.max_x + distance,
            self.max_y + distance,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    pub fn approx_eq(&self, other: &Rect, tolerance: f64) -> bool {
        (self.min_x - other.min_x).abs() <= tolerance
            && (self.min_y - other.min_y).abs() <= tolerance
            && (self.max_x - other.max_x).abs() <= tolerance
            && (self.max_y - other.max_y).abs() <= tolerance
    }

    pub fn to_polygon(&self) -> Geometry {
        Geometry::Polygon(vec![vec![
            Coord::new(self.min_x, self.min_y),
            Coord::new(self.max_x, self.min_y),
            Coord::new(self.max_x, self.max_y),
            Coord::new(self.min_x, self.max_y),
            Coord::new(self.min_x, self.min_y),
        ]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, size: f64) -> Geometry {
        Rect::new(x, y, x + size, y + size).to_polygon()
    }

    #[test]
    fn test_bbox_of_collection() {
        let g = Geometry::collect(vec![square(0.0, 0.0, 1.0), Geometry::Point(Coord::new(5.0, -2.0))]);
        assert_eq!(g.bbox(), Some(Rect::new(0.0, -2.0, 5.0, 1.0)));
        assert_eq!(g.type_name(), "GeometryCollection");
    }

    #[test]
    fn test_collect_single_part_is_not_wrapped() {
        let g = Geometry::collect(vec![square(0.0, 0.0, 1.0)]);
        assert_eq!(g.type_name(), "Polygon");
    }

    #[test]
    fn test_rect_expand_negative_can_invert() {
        let r = Rect::new(0.0, 0.0, 1.0, 1.0).expand(-1.0);
        assert!(!r.is_valid());
        assert!(!r.intersects(&Rect::new(0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn test_empty_detection() {
        assert!(Geometry::LineString(vec![]).is_empty());
        assert!(Geometry::Collection(vec![]).is_empty());
        assert!(!Geometry::Point(Coord::new(0.0, 0.0)).is_empty());
    }
}
