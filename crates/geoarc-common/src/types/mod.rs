//! Canonical feature model shared by every ingestion front-end

use crate::error::{CommonError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Geometry
// ============================================================================

/// The three supported feature shapes.
///
/// Variants are declared in probe priority order: when a placemark carries
/// more than one shape, the earliest variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GeometryKind {
    Point,
    LineString,
    Polygon,
}

impl GeometryKind {
    /// All kinds in priority order
    pub const ALL: [GeometryKind; 3] = [
        GeometryKind::Point,
        GeometryKind::LineString,
        GeometryKind::Polygon,
    ];

    /// Uppercase label written to metadata (e.g. "LINESTRING")
    pub fn as_str(self) -> &'static str {
        match self {
            GeometryKind::Point => "POINT",
            GeometryKind::LineString => "LINESTRING",
            GeometryKind::Polygon => "POLYGON",
        }
    }

    /// Element name used by KML and GeoJSON (e.g. "LineString")
    pub fn element_name(self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::LineString => "LineString",
            GeometryKind::Polygon => "Polygon",
        }
    }
}

impl std::fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GeometryKind {
    type Err = CommonError;

    /// Accepts both the metadata labels and the KML/GeoJSON element names
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "POINT" => Ok(GeometryKind::Point),
            "LINESTRING" => Ok(GeometryKind::LineString),
            "POLYGON" => Ok(GeometryKind::Polygon),
            _ => Err(CommonError::UnknownGeometryKind(s.to_string())),
        }
    }
}

// ============================================================================
// Canonical Feature Record
// ============================================================================

/// Derived metadata stored alongside every feature.
///
/// Serializes to
/// `{"original_geometry_kind": "POINT", "feature_count": 1, "processing_time": "..."}`
/// plus any front-end specific entries in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMetadata {
    /// Geometry kind as parsed from the source document
    pub original_geometry_kind: GeometryKind,

    /// Number of source features folded into this record (always 1 today)
    pub feature_count: u32,

    /// When the record was normalized
    pub processing_time: DateTime<Utc>,

    /// Additional front-end specific entries
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FeatureMetadata {
    pub fn new(kind: GeometryKind, processing_time: DateTime<Utc>) -> Self {
        Self {
            original_geometry_kind: kind,
            feature_count: 1,
            processing_time,
            extra: BTreeMap::new(),
        }
    }

    /// Attach an extra key-value entry
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Render as a JSON object for storage
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A normalized, store-ready feature.
///
/// `geometry_kind` and `coordinates` are always both present; the
/// coordinate payload is opaque KML coordinate text and is never validated
/// before the store's geometry constructor sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFeature {
    /// Identifier of the source this feature came from
    pub source_id: String,

    /// Optional feature name
    pub name: Option<String>,

    /// Optional feature description
    pub description: Option<String>,

    /// Geometry shape
    pub geometry_kind: GeometryKind,

    /// Coordinate text in KML syntax (`lon,lat[,alt]` tuples)
    pub coordinates: String,

    /// Derived metadata
    pub metadata: FeatureMetadata,
}
