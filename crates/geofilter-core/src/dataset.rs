//! Dataset handles and features as seen by the filter engine

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::geometry::Geometry;

/// Identifier of a filterable dataset in the host registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier reduced to `[a-z0-9_]`, usable inside generated relation names
    pub fn slug(&self) -> String {
        let slug: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        slug.chars().take(32).collect()
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Host-side feature identifier (primary key value)
pub type FeatureId = i64;

/// Native storage of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Full SQL/spatial database server
    Sql,
    /// Local transactional database file
    Embedded,
    /// Anything read through the host's generic feature driver
    Generic,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Sql => write!(f, "sql"),
            StorageKind::Embedded => write!(f, "embedded"),
            StorageKind::Generic => write!(f, "generic"),
        }
    }
}

/// Coordinate reference system, identified by authority id (`EPSG:4326`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Crs(String);

impl Crs {
    pub const WGS84: &'static str = "EPSG:4326";
    pub const WEB_MERCATOR: &'static str = "EPSG:3857";

    pub fn new(authid: impl Into<String>) -> Self {
        Self(authid.into().to_ascii_uppercase())
    }

    pub fn wgs84() -> Self {
        Self::new(Self::WGS84)
    }

    pub fn authid(&self) -> &str {
        &self.0
    }

    /// Numeric SRID for `EPSG:<n>` identifiers
    pub fn srid(&self) -> Option<i32> {
        self.0
            .strip_prefix("EPSG:")
            .and_then(|code| code.parse().ok())
    }

    /// Whether coordinates are angular (degrees)
    pub fn is_geographic(&self) -> bool {
        matches!(self.srid(), Some(4326) | Some(4258) | Some(4269) | Some(4167))
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse type of an attribute field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Real,
    Text,
    Boolean,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Physical table behind a database-backed dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

/// Reference to a filterable dataset as reported by the host registry.
///
/// Handles are cheap value snapshots; tasks re-resolve them from the registry
/// instead of sharing the host's storage objects across threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub id: DatasetId,
    pub name: String,
    pub storage: StorageKind,
    pub table: Option<TableRef>,
    /// Datasets sharing a connection key live in the same database
    pub connection: Option<String>,
    pub geometry_column: Option<String>,
    pub primary_key: Option<String>,
    pub crs: Crs,
    pub fields: Vec<Field>,
    pub feature_count: u64,
}

impl DatasetHandle {
    pub fn new(id: impl Into<String>, storage: StorageKind) -> Self {
        let id = DatasetId::new(id);
        Self {
            name: id.to_string(),
            id,
            storage,
            table: None,
            connection: None,
            geometry_column: None,
            primary_key: None,
            crs: Crs::wgs84(),
            fields: Vec::new(),
            feature_count: 0,
        }
    }

    pub fn with_table(mut self, table: TableRef) -> Self {
        self.table = Some(table);
        self
    }

    pub fn with_connection(mut self, key: impl Into<String>) -> Self {
        self.connection = Some(key.into());
        self
    }

    pub fn with_geometry_column(mut self, column: impl Into<String>) -> Self {
        self.geometry_column = Some(column.into());
        self
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    pub fn with_crs(mut self, crs: Crs) -> Self {
        self.crs = crs;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(Field::new(name, field_type));
        self
    }

    pub fn with_feature_count(mut self, count: u64) -> Self {
        self.feature_count = count;
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name.eq_ignore_ascii_case(name))
            || self
                .primary_key
                .as_deref()
                .is_some_and(|pk| pk.eq_ignore_ascii_case(name))
    }

    /// Geometry column and primary key, or `InvalidProperties` naming what is missing
    pub fn require_keys(&self) -> Result<(&str, &str)> {
        match (self.geometry_column.as_deref(), self.primary_key.as_deref()) {
            (Some(geom), Some(pk)) if !geom.is_empty() && !pk.is_empty() => Ok((geom, pk)),
            (geom, pk) => {
                let mut missing = Vec::new();
                if geom.is_none_or(str::is_empty) {
                    missing.push("geometry column");
                }
                if pk.is_none_or(str::is_empty) {
                    missing.push("primary key");
                }
                Err(FilterError::missing_properties(&self.id, &missing))
            }
        }
    }

    /// Table reference, required by the database-backed backends
    pub fn require_table(&self) -> Result<&TableRef> {
        self.table
            .as_ref()
            .ok_or_else(|| FilterError::missing_properties(&self.id, &["table"]))
    }
}

/// Attribute value carried by an in-process feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(v) => Some(*v as f64),
            AttributeValue::Real(v) => Some(*v),
            AttributeValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            AttributeValue::Text(s) => s.trim().parse().ok(),
            AttributeValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => write!(f, "NULL"),
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::Integer(v) => write!(f, "{}", v),
            AttributeValue::Real(v) => write!(f, "{}", v),
            AttributeValue::Text(s) => f.write_str(s),
        }
    }
}

/// A feature delivered by the host's generic feature primitives
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: FeatureId,
    pub geometry: Option<Geometry>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Feature {
    pub fn new(id: FeatureId, geometry: Option<Geometry>) -> Self {
        Self {
            id,
            geometry,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Case-insensitive attribute lookup
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name).or_else(|| {
            self.attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_keys_reports_all_missing() {
        let handle = DatasetHandle::new("roads", StorageKind::Sql);
        let err = handle.require_keys().unwrap_err();
        match err {
            FilterError::InvalidProperties { missing, .. } => {
                assert_eq!(missing, "geometry column, primary key");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_require_keys_ok() {
        let handle = DatasetHandle::new("roads", StorageKind::Sql)
            .with_geometry_column("geom")
            .with_primary_key("gid");
        assert_eq!(handle.require_keys().unwrap(), ("geom", "gid"));
    }

    #[test]
    fn test_crs_srid_and_geographic() {
        assert_eq!(Crs::new("epsg:2154").srid(), Some(2154));
        assert!(Crs::wgs84().is_geographic());
        assert!(!Crs::new(Crs::WEB_MERCATOR).is_geographic());
        assert_eq!(Crs::new("IGNF:LAMB93").srid(), None);
    }

    #[test]
    fn test_slug() {
        assert_eq!(DatasetId::new("My Layer-01").slug(), "my_layer_01");
    }

    #[test]
    fn test_attribute_lookup_case_insensitive() {
        let f = Feature::new(1, None).with_attribute("Population", AttributeValue::Integer(5));
        assert_eq!(f.attribute("population"), Some(&AttributeValue::Integer(5)));
    }
}
