//! Geometry validity checks and the bounded repair sequence
//!
//! Repair tries, in order: a validity fix (drop non-finite coordinates,
//! close rings), a zero-distance rebuild (drop collapsed rings and empty
//! parts), simplification (drop repeated vertices) and finally a re-type to a
//! lower dimension. The first step that yields a valid geometry wins.

use serde::Serialize;

use super::ops::ring_area;
use super::{Coord, Geometry};
use crate::error::{FilterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryIssue {
    Empty,
    NonFiniteCoordinate,
    UnclosedRing,
    TooFewPoints,
    CollapsedRing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    ValidityFix,
    ZeroBuffer,
    Simplify,
    Retype,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub geometry: Geometry,
    /// Steps applied; empty when the input was already valid
    pub steps: Vec<RepairStep>,
}

fn check_line(coords: &[Coord], issues: &mut Vec<GeometryIssue>) {
    if coords.iter().any(|c| !c.is_finite()) {
        issues.push(GeometryIssue::NonFiniteCoordinate);
    }
    let mut distinct = coords.to_vec();
    distinct.dedup();
    if distinct.len() < 2 {
        issues.push(GeometryIssue::TooFewPoints);
    }
}

fn check_rings(rings: &[Vec<Coord>], issues: &mut Vec<GeometryIssue>) {
    if rings.is_empty() {
        issues.push(GeometryIssue::Empty);
    }
    for ring in rings {
        if ring.iter().any(|c| !c.is_finite()) {
            issues.push(GeometryIssue::NonFiniteCoordinate);
        }
        if ring.len() < 4 {
            issues.push(GeometryIssue::TooFewPoints);
        } else if ring.first() != ring.last() {
            issues.push(GeometryIssue::UnclosedRing);
        } else if ring_area(ring).abs() <= f64::EPSILON {
            issues.push(GeometryIssue::CollapsedRing);
        }
    }
}

fn collect_issues(geometry: &Geometry, issues: &mut Vec<GeometryIssue>) {
    match geometry {
        Geometry::Point(c) => {
            if !c.is_finite() {
                issues.push(GeometryIssue::NonFiniteCoordinate);
            }
        }
        Geometry::MultiPoint(coords) => {
            if coords.is_empty() {
                issues.push(GeometryIssue::Empty);
            }
            if coords.iter().any(|c| !c.is_finite()) {
                issues.push(GeometryIssue::NonFiniteCoordinate);
            }
        }
        Geometry::LineString(coords) => check_line(coords, issues),
        Geometry::MultiLineString(lines) => {
            if lines.is_empty() {
                issues.push(GeometryIssue::Empty);
            }
            lines.iter().for_each(|l| check_line(l, issues));
        }
        Geometry::Polygon(rings) => check_rings(rings, issues),
        Geometry::MultiPolygon(polys) => {
            if polys.is_empty() {
                issues.push(GeometryIssue::Empty);
            }
            polys.iter().for_each(|p| check_rings(p, issues));
        }
        Geometry::Collection(parts) => {
            if parts.is_empty() {
                issues.push(GeometryIssue::Empty);
            }
            parts.iter().for_each(|p| collect_issues(p, issues));
        }
    }
}

/// List validity problems; an empty list means the geometry is valid
pub fn validate(geometry: &Geometry) -> Vec<GeometryIssue> {
    let mut issues = Vec::new();
    collect_issues(geometry, &mut issues);
    issues.sort_by_key(|i| *i as u8);
    issues.dedup();
    issues
}

fn finite(coords: &[Coord]) -> Vec<Coord> {
    coords.iter().copied().filter(Coord::is_finite).collect()
}

fn close_ring(mut ring: Vec<Coord>) -> Vec<Coord> {
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
        if first != last {
            ring.push(first);
        }
    }
    ring
}

fn validity_fix(geometry: &Geometry) -> Geometry {
    let ring = |r: &Vec<Coord>| close_ring(finite(r));
    let poly = |rings: &Vec<Vec<Coord>>| rings.iter().map(ring).collect::<Vec<_>>();
    match geometry {
        Geometry::Point(c) => Geometry::Point(*c),
        Geometry::LineString(c) => Geometry::LineString(finite(c)),
        Geometry::MultiPoint(c) => Geometry::MultiPoint(finite(c)),
        Geometry::MultiLineString(lines) => {
            Geometry::MultiLineString(lines.iter().map(|l| finite(l)).collect())
        }
        Geometry::Polygon(rings) => Geometry::Polygon(poly(rings)),
        Geometry::MultiPolygon(polys) => Geometry::MultiPolygon(polys.iter().map(poly).collect()),
        Geometry::Collection(parts) => Geometry::Collection(parts.iter().map(validity_fix).collect()),
    }
}

fn ring_is_solid(ring: &[Coord]) -> bool {
    ring.len() >= 4 && ring.first() == ring.last() && ring_area(ring).abs() > f64::EPSILON
}

/// Rebuild polygons from their non-degenerate rings; a polygon whose
/// exterior collapsed is dropped along with its holes
fn solid_rings(rings: &[Vec<Coord>]) -> Option<Vec<Vec<Coord>>> {
    let (exterior, holes) = rings.split_first()?;
    if !ring_is_solid(exterior) {
        return None;
    }
    let mut out = vec![exterior.clone()];
    out.extend(holes.iter().filter(|h| ring_is_solid(h)).cloned());
    Some(out)
}

fn zero_buffer(geometry: &Geometry) -> Geometry {
    match geometry {
        Geometry::Polygon(rings) => {
            Geometry::Polygon(solid_rings(rings).unwrap_or_default())
        }
        Geometry::MultiPolygon(polys) => {
            Geometry::MultiPolygon(polys.iter().filter_map(|p| solid_rings(p)).collect())
        }
        Geometry::MultiLineString(lines) => Geometry::MultiLineString(
            lines.iter().filter(|l| l.len() >= 2).cloned().collect(),
        ),
        Geometry::Collection(parts) => Geometry::Collection(
            parts
                .iter()
                .map(zero_buffer)
                .filter(|p| !p.is_empty())
                .collect(),
        ),
        other => other.clone(),
    }
}

fn dedup(coords: &[Coord]) -> Vec<Coord> {
    let mut out = coords.to_vec();
    out.dedup();
    out
}

fn simplify(geometry: &Geometry) -> Geometry {
    let ring = |r: &Vec<Coord>| close_ring(dedup(r));
    let poly = |rings: &Vec<Vec<Coord>>| rings.iter().map(ring).collect::<Vec<_>>();
    match geometry {
        Geometry::LineString(c) => Geometry::LineString(dedup(c)),
        Geometry::MultiPoint(c) => Geometry::MultiPoint(dedup(c)),
        Geometry::MultiLineString(lines) => {
            Geometry::MultiLineString(lines.iter().map(|l| dedup(l)).collect())
        }
        Geometry::Polygon(rings) => Geometry::Polygon(poly(rings)),
        Geometry::MultiPolygon(polys) => Geometry::MultiPolygon(polys.iter().map(poly).collect()),
        Geometry::Collection(parts) => Geometry::Collection(parts.iter().map(simplify).collect()),
        other => other.clone(),
    }
}

/// Lower the dimension of a degenerate geometry: a ring that cannot enclose
/// area becomes a line, a line with one distinct vertex becomes a point
fn retype(geometry: &Geometry) -> Option<Geometry> {
    let from_coords = |coords: Vec<Coord>| -> Option<Geometry> {
        let mut distinct = finite(&coords);
        distinct.dedup();
        match distinct.len() {
            0 => None,
            1 => Some(Geometry::Point(distinct[0])),
            _ => Some(Geometry::LineString(distinct)),
        }
    };
    match geometry {
        Geometry::Polygon(rings) => from_coords(rings.first()?.clone()),
        Geometry::MultiPolygon(polys) => {
            let parts: Vec<Geometry> = polys
                .iter()
                .filter_map(|p| p.first().cloned().and_then(from_coords))
                .collect();
            (!parts.is_empty()).then(|| Geometry::collect(parts))
        }
        Geometry::LineString(coords) => from_coords(coords.clone()),
        Geometry::MultiLineString(lines) => {
            let parts: Vec<Geometry> = lines.iter().cloned().filter_map(from_coords).collect();
            (!parts.is_empty()).then(|| Geometry::collect(parts))
        }
        Geometry::Collection(parts) => {
            let parts: Vec<Geometry> = parts.iter().filter_map(retype).collect();
            (!parts.is_empty()).then(|| Geometry::collect(parts))
        }
        Geometry::MultiPoint(coords) => {
            let kept = finite(coords);
            (!kept.is_empty()).then_some(Geometry::MultiPoint(kept))
        }
        Geometry::Point(c) => c.is_finite().then_some(Geometry::Point(*c)),
    }
}

/// Run the bounded repair sequence.
///
/// Returns `GeometryInvalid` when every step fails; callers skip and count
/// such features rather than failing the whole request.
pub fn repair(geometry: &Geometry) -> Result<RepairOutcome> {
    if validate(geometry).is_empty() {
        return Ok(RepairOutcome {
            geometry: geometry.clone(),
            steps: Vec::new(),
        });
    }

    let mut steps = Vec::new();
    let fixed = validity_fix(geometry);
    let rebuilt = zero_buffer(&fixed);
    let simplified = simplify(&rebuilt);
    // re-type from the fixed geometry so parts dropped by the rebuild survive
    let retyped = retype(&simplify(&fixed));
    let candidates = [
        (RepairStep::ValidityFix, Some(fixed)),
        (RepairStep::ZeroBuffer, Some(rebuilt)),
        (RepairStep::Simplify, Some(simplified)),
        (RepairStep::Retype, retyped),
    ];

    for (step, candidate) in candidates {
        let Some(candidate) = candidate else {
            break;
        };
        steps.push(step);
        if validate(&candidate).is_empty() {
            tracing::trace!(steps = ?steps, "geometry repaired");
            return Ok(RepairOutcome {
                geometry: candidate,
                steps,
            });
        }
    }

    Err(FilterError::GeometryInvalid {
        reason: format!(
            "{} could not be repaired ({:?})",
            geometry.type_name(),
            validate(geometry)
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(points: &[(f64, f64)]) -> Vec<Coord> {
        points.iter().map(|(x, y)| Coord::new(*x, *y)).collect()
    }

    #[test]
    fn test_valid_geometry_untouched() {
        let g = Geometry::Polygon(vec![ring(&[(0., 0.), (1., 0.), (1., 1.), (0., 0.)])]);
        let out = repair(&g).unwrap();
        assert!(out.steps.is_empty());
        assert_eq!(out.geometry, g);
    }

    #[test]
    fn test_unclosed_ring_is_closed() {
        let g = Geometry::Polygon(vec![ring(&[(0., 0.), (1., 0.), (1., 1.), (0., 1.)])]);
        assert_eq!(validate(&g), vec![GeometryIssue::UnclosedRing]);
        let out = repair(&g).unwrap();
        assert_eq!(out.steps, vec![RepairStep::ValidityFix]);
        assert!(validate(&out.geometry).is_empty());
    }

    #[test]
    fn test_collapsed_polygon_retyped_to_line() {
        let g = Geometry::Polygon(vec![ring(&[(0., 0.), (1., 1.), (2., 2.), (0., 0.)])]);
        let out = repair(&g).unwrap();
        assert_eq!(out.steps.last(), Some(&RepairStep::Retype));
        assert_eq!(out.geometry.type_name(), "LineString");
    }

    #[test]
    fn test_collection_drops_degenerate_parts() {
        let g = Geometry::Collection(vec![
            Geometry::Polygon(vec![ring(&[(0., 0.), (0., 0.), (0., 0.), (0., 0.)])]),
            Geometry::Point(Coord::new(3.0, 3.0)),
        ]);
        let out = repair(&g).unwrap();
        assert!(validate(&out.geometry).is_empty());
        assert_eq!(out.geometry, Geometry::Collection(vec![Geometry::Point(Coord::new(3.0, 3.0))]));
    }

    #[test]
    fn test_irreparable_reports_geometry_invalid() {
        let g = Geometry::LineString(vec![Coord::new(f64::NAN, 0.0)]);
        assert!(matches!(repair(&g), Err(FilterError::GeometryInvalid { .. })));
    }
}
