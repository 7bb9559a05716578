//! Reprojection for the in-process path
//!
//! Only geographic WGS84 and spherical web mercator are handled here; other
//! CRS pairs must be reprojected by the storage engine.

use std::f64::consts::PI;

use super::{Coord, Geometry};
use crate::dataset::Crs;
use crate::error::{FilterError, Result};

const EARTH_RADIUS: f64 = 6_378_137.0;
const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Metres per degree of latitude, used to express metric buffers in degrees
pub const METRES_PER_DEGREE: f64 = 111_320.0;

fn to_mercator(c: Coord) -> Coord {
    let lat = c.y.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    Coord::new(
        EARTH_RADIUS * c.x.to_radians(),
        EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln(),
    )
}

fn to_geographic(c: Coord) -> Coord {
    Coord::new(
        (c.x / EARTH_RADIUS).to_degrees(),
        (2.0 * (c.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees(),
    )
}

fn is_wgs84(crs: &Crs) -> bool {
    crs.srid() == Some(4326)
}

fn is_mercator(crs: &Crs) -> bool {
    matches!(crs.srid(), Some(3857) | Some(900913))
}

/// Whether [`transform`] can handle this pair
pub fn supports(from: &Crs, to: &Crs) -> bool {
    from == to
        || (is_wgs84(from) && is_mercator(to))
        || (is_mercator(from) && is_wgs84(to))
}

pub fn transform(geometry: &Geometry, from: &Crs, to: &Crs) -> Result<Geometry> {
    if from == to {
        return Ok(geometry.clone());
    }
    if is_wgs84(from) && is_mercator(to) {
        return Ok(geometry.map_coords(&to_mercator));
    }
    if is_mercator(from) && is_wgs84(to) {
        return Ok(geometry.map_coords(&to_geographic));
    }
    Err(FilterError::CrsMismatch {
        source_crs: from.to_string(),
        target_crs: to.to_string(),
    })
}
