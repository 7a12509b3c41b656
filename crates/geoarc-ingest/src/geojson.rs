//! GeoJSON front-end
//!
//! Converts decoded GeoJSON feature collections (as exported from map
//! tooling) into the same placemark model the KML parser produces, so they
//! can be normalized and loaded or repackaged as a KMZ. An optional filter
//! keeps only features whose `type`, `class` or `structure` property
//! contains a substring, compared case-insensitively.

use anyhow::{Context, Result};
use geoarc_common::{CanonicalFeature, GeometryKind};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};

use crate::normalizer::FeatureNormalizer;
use crate::parser::{RawFeature, RawGeometry};

/// Properties inspected by the substring filter
pub const FILTER_PROPERTIES: [&str; 3] = ["type", "class", "structure"];

/// Metadata key holding the original GeoJSON properties
pub const PROPERTIES_METADATA_KEY: &str = "properties";

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureCollection {
    #[serde(default)]
    pub features: Vec<GeoJsonFeature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoJsonFeature {
    pub geometry: Option<GeoJsonGeometry>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoJsonGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub coordinates: Value,
}

impl GeoJsonFeature {
    fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.as_ref()?.get(key)?.as_str()
    }
}

impl FeatureCollection {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid GeoJSON feature collection")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read GeoJSON file {}", path.display()))?;
        Self::from_json_str(&json)
    }
}

/// Render one GeoJSON position as a KML tuple (`lon,lat[,alt]`)
fn position(value: &Value) -> Option<String> {
    let ordinates = value.as_array()?;
    if !(2..=3).contains(&ordinates.len()) {
        return None;
    }
    let parts = ordinates
        .iter()
        .map(|o| o.as_f64().map(|n| n.to_string()))
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join(","))
}

fn positions(value: &Value) -> Option<String> {
    let list = value
        .as_array()?
        .iter()
        .map(position)
        .collect::<Option<Vec<_>>>()?;
    Some(list.join(" "))
}

/// Convert GeoJSON coordinates to KML coordinate text
///
/// Polygons contribute their outer ring only. Returns `None` for
/// unsupported geometry types or malformed coordinates.
pub fn coordinates_to_kml(geometry: &GeoJsonGeometry) -> Option<(GeometryKind, String)> {
    let kind: GeometryKind = geometry.kind.parse().ok()?;
    let text = match kind {
        GeometryKind::Point => position(&geometry.coordinates)?,
        GeometryKind::LineString => positions(&geometry.coordinates)?,
        GeometryKind::Polygon => positions(geometry.coordinates.as_array()?.first()?)?,
    };
    Some((kind, text))
}

/// Filters and converts GeoJSON features
#[derive(Debug, Clone, Default)]
pub struct GeoJsonFrontEnd {
    filter: Option<String>,
}

impl GeoJsonFrontEnd {
    pub fn new(filter: Option<&str>) -> Self {
        Self {
            filter: filter
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_lowercase),
        }
    }

    /// Whether the feature passes the property filter
    pub fn matches(&self, feature: &GeoJsonFeature) -> bool {
        let Some(needle) = &self.filter else {
            return true;
        };
        FILTER_PROPERTIES.iter().any(|key| {
            feature
                .property_str(key)
                .is_some_and(|value| value.to_lowercase().contains(needle.as_str()))
        })
    }

    fn to_raw(feature: &GeoJsonFeature) -> RawFeature {
        RawFeature {
            name: feature.property_str("name").map(str::to_string),
            description: feature.property_str("description").map(str::to_string),
            geometry: feature
                .geometry
                .as_ref()
                .and_then(|geometry| {
                    let converted = coordinates_to_kml(geometry);
                    if converted.is_none() {
                        debug!(
                            geometry_type = %geometry.kind,
                            "Skipping unsupported or malformed GeoJSON geometry"
                        );
                    }
                    converted
                })
                .map(|(kind, coordinates)| RawGeometry { kind, coordinates }),
        }
    }

    /// Filtered features as placemarks, in collection order
    pub fn to_raw_features(&self, collection: &FeatureCollection) -> Vec<RawFeature> {
        let raws: Vec<_> = collection
            .features
            .iter()
            .filter(|f| self.matches(f))
            .map(Self::to_raw)
            .collect();

        debug!(
            total = collection.features.len(),
            matched = raws.len(),
            "Filtered GeoJSON features"
        );
        raws
    }

    /// Filtered features as canonical records
    ///
    /// Each record's metadata carries the original GeoJSON properties under
    /// `properties`.
    pub fn to_canonical(
        &self,
        collection: &FeatureCollection,
        source_id: &str,
        normalizer: &FeatureNormalizer,
    ) -> Vec<CanonicalFeature> {
        let features: Vec<_> = collection
            .features
            .iter()
            .filter(|f| self.matches(f))
            .filter_map(|f| {
                let mut canonical = normalizer.normalize(Self::to_raw(f), source_id)?;
                if let Some(properties) = &f.properties {
                    canonical.metadata = canonical
                        .metadata
                        .with_extra(PROPERTIES_METADATA_KEY, Value::Object(properties.clone()));
                }
                Some(canonical)
            })
            .collect();

        info!(
            source_id,
            total = collection.features.len(),
            kept = features.len(),
            "Converted GeoJSON features"
        );
        features
    }
}
