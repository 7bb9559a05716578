//! GeoJSON export writer

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use geofilter_core::dataset::{AttributeValue, Crs, DatasetHandle, Feature};
use geofilter_core::error::{FilterError, Result};
use geofilter_core::geometry::{Coord, Geometry};
use geofilter_core::host::{ExportLayer, ExportOptions, ExportWriter};

fn position(c: &Coord) -> Value {
    json!([c.x, c.y])
}

fn positions(coords: &[Coord]) -> Value {
    Value::Array(coords.iter().map(position).collect())
}

fn rings(rings: &[Vec<Coord>]) -> Value {
    Value::Array(rings.iter().map(|r| positions(r)).collect())
}

pub fn geometry(geometry: &Geometry) -> Value {
    let coordinates = match geometry {
        Geometry::Point(c) => position(c),
        Geometry::LineString(c) | Geometry::MultiPoint(c) => positions(c),
        Geometry::Polygon(r) | Geometry::MultiLineString(r) => rings(r),
        Geometry::MultiPolygon(polygons) => Value::Array(polygons.iter().map(|p| rings(p)).collect()),
        Geometry::Collection(parts) => {
            return json!({
                "type": "GeometryCollection",
                "geometries": parts.iter().map(self::geometry).collect::<Vec<_>>(),
            })
        }
    };
    json!({ "type": geometry.type_name(), "coordinates": coordinates })
}

fn property(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Null => Value::Null,
        AttributeValue::Bool(v) => Value::Bool(*v),
        AttributeValue::Integer(v) => json!(v),
        AttributeValue::Real(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
        AttributeValue::Text(s) => Value::String(s.clone()),
    }
}

pub fn feature(feature: &Feature) -> Value {
    let properties: Map<String, Value> = feature
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), property(v)))
        .collect();
    json!({
        "type": "Feature",
        "id": feature.id,
        "properties": properties,
        "geometry": feature.geometry.as_ref().map(self::geometry),
    })
}

/// Named CRS member, omitted for WGS 84 which GeoJSON assumes
fn crs_member(crs: &Crs) -> Option<Value> {
    (crs != &Crs::wgs84()).then(|| {
        json!({
            "type": "name",
            "properties": { "name": crs.authid() },
        })
    })
}

pub struct GeoJsonWriter;

impl GeoJsonWriter {
    fn collection(layer: &ExportLayer) -> Value {
        let mut collection = json!({
            "type": "FeatureCollection",
            "name": layer.name,
            "features": layer.features.iter().map(feature).collect::<Vec<_>>(),
        });
        if let (Some(crs), Some(object)) = (crs_member(&layer.crs), collection.as_object_mut()) {
            object.insert("crs".to_string(), crs);
        }
        collection
    }
}

impl ExportWriter for GeoJsonWriter {
    fn write_layer(&self, layer: &ExportLayer, options: &ExportOptions, path: &Path) -> Result<PathBuf> {
        let sequence = match options.format.to_ascii_lowercase().as_str() {
            "geojson" | "json" => false,
            "geojsonseq" | "geojsonl" | "ndjson" => true,
            other => {
                return Err(FilterError::Export {
                    target: path.to_path_buf(),
                    reason: format!("unsupported format '{}'", other),
                })
            }
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(path)?);
        if sequence {
            for f in &layer.features {
                serde_json::to_writer(&mut out, &feature(f))?;
                out.write_all(b"\n")?;
            }
        } else {
            serde_json::to_writer_pretty(&mut out, &Self::collection(layer))?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        tracing::debug!(path = %path.display(), features = layer.features.len(), "layer written");
        Ok(path.to_path_buf())
    }

    /// Layers in a plain database carry no style
    fn write_style(&self, _dataset: &DatasetHandle, _path: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn archive(&self, _files: &[PathBuf], archive: &Path) -> Result<PathBuf> {
        Err(FilterError::Export {
            target: archive.to_path_buf(),
            reason: "archives are not supported".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geofilter_core::dataset::DatasetId;

    fn layer(crs: Crs) -> ExportLayer {
        ExportLayer {
            dataset: DatasetId::new("towns"),
            name: "towns".to_string(),
            crs,
            features: vec![
                Feature::new(7, Some(Geometry::Point(Coord::new(1.5, 2.0))))
                    .with_attribute("name", AttributeValue::Text("Ash".into())),
                Feature::new(8, None).with_attribute("population", AttributeValue::Integer(3)),
            ],
        }
    }

    fn options(format: &str) -> ExportOptions {
        ExportOptions {
            format: format.to_string(),
            target_crs: None,
        }
    }

    #[test]
    fn test_feature_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/towns.geojson");
        GeoJsonWriter.write_layer(&layer(Crs::wgs84()), &options("geojson"), &path).unwrap();

        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["type"], "FeatureCollection");
        assert!(value.get("crs").is_none());
        assert_eq!(value["features"][0]["id"], 7);
        assert_eq!(value["features"][0]["geometry"]["coordinates"], json!([1.5, 2.0]));
        assert_eq!(value["features"][1]["geometry"], Value::Null);
    }

    #[test]
    fn test_sequence_and_named_crs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("towns.geojsonl");
        GeoJsonWriter
            .write_layer(&layer(Crs::new("EPSG:3857")), &options("geojsonseq"), &path)
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        let collection = GeoJsonWriter::collection(&layer(Crs::new("EPSG:3857")));
        assert_eq!(collection["crs"]["properties"]["name"], "EPSG:3857");
    }

    #[test]
    fn test_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let err = GeoJsonWriter
            .write_layer(&layer(Crs::wgs84()), &options("shp"), &dir.path().join("x.shp"))
            .unwrap_err();
        assert!(matches!(err, FilterError::Export { .. }));
    }
}
