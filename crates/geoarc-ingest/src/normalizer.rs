//! Raw placemark to canonical feature conversion

use chrono::{DateTime, Utc};
use geoarc_common::{CanonicalFeature, FeatureMetadata};
use tracing::{debug, warn};

use crate::parser::RawFeature;

/// Keeps placemarks that carry a geometry with non-empty coordinates
#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureNormalizer;

impl FeatureNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize one placemark, stamping the current time
    ///
    /// Returns `None` when the placemark has no geometry or its
    /// coordinate text is empty.
    pub fn normalize(&self, raw: RawFeature, source_id: &str) -> Option<CanonicalFeature> {
        self.normalize_at(raw, source_id, Utc::now())
    }

    pub fn normalize_at(
        &self,
        raw: RawFeature,
        source_id: &str,
        processing_time: DateTime<Utc>,
    ) -> Option<CanonicalFeature> {
        let geometry = raw.geometry?;
        if geometry.coordinates.is_empty() {
            return None;
        }

        Some(CanonicalFeature {
            source_id: source_id.to_string(),
            name: raw.name,
            description: raw.description,
            geometry_kind: geometry.kind,
            coordinates: geometry.coordinates,
            metadata: FeatureMetadata::new(geometry.kind, processing_time),
        })
    }

    /// Normalize a document's placemarks, preserving order
    pub fn normalize_all(&self, raws: Vec<RawFeature>, source_id: &str) -> Vec<CanonicalFeature> {
        let total = raws.len();
        let mut without_geometry = 0usize;
        let mut empty_coordinates = 0usize;
        let mut features = Vec::with_capacity(total);

        for raw in raws {
            match &raw.geometry {
                None => {
                    without_geometry += 1;
                    debug!(
                        source_id,
                        name = raw.name.as_deref().unwrap_or("<unnamed>"),
                        "Dropping placemark without a supported geometry"
                    );
                },
                Some(g) if g.coordinates.is_empty() => {
                    empty_coordinates += 1;
                    warn!(
                        source_id,
                        name = raw.name.as_deref().unwrap_or("<unnamed>"),
                        kind = %g.kind,
                        "Dropping placemark with empty coordinates"
                    );
                },
                Some(_) => {},
            }

            if let Some(feature) = self.normalize(raw, source_id) {
                features.push(feature);
            }
        }

        debug!(
            placemarks = total,
            kept = features.len(),
            without_geometry,
            empty_coordinates,
            "Normalized placemarks"
        );
        features
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::parser::RawGeometry;
    use chrono::TimeZone;
    use geoarc_common::GeometryKind;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn raw(name: Option<&str>, geometry: Option<(GeometryKind, &str)>) -> RawFeature {
        RawFeature {
            name: name.map(str::to_string),
            description: None,
            geometry: geometry.map(|(kind, coords)| RawGeometry {
                kind,
                coordinates: coords.to_string(),
            }),
        }
    }

    #[test]
    fn test_normalize_builds_metadata() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let feature = FeatureNormalizer::new()
            .normalize_at(raw(Some("A"), Some((GeometryKind::LineString, "0,0 1,1"))), "s1", at)
            .unwrap();

        assert_eq!(feature.source_id, "s1");
        assert_eq!(feature.name.as_deref(), Some("A"));
        assert_eq!(feature.geometry_kind, GeometryKind::LineString);
        assert_eq!(feature.coordinates, "0,0 1,1");
        assert_eq!(feature.metadata.original_geometry_kind, GeometryKind::LineString);
        assert_eq!(feature.metadata.feature_count, 1);
        assert_eq!(feature.metadata.processing_time, at);
    }

    #[test]
    fn test_normalize_drops_missing_geometry_and_empty_coordinates() {
        let normalizer = FeatureNormalizer::new();
        assert!(normalizer.normalize(raw(Some("A"), None), "s1").is_none());
        assert!(normalizer
            .normalize(raw(Some("B"), Some((GeometryKind::Point, ""))), "s1")
            .is_none());
    }

    #[test]
    fn test_normalize_all_preserves_order() {
        let raws = vec![
            raw(Some("first"), Some((GeometryKind::Point, "1,1"))),
            raw(Some("skipped"), None),
            raw(Some("second"), Some((GeometryKind::Polygon, "0,0 1,0 1,1 0,0"))),
        ];
        let names: Vec<_> = FeatureNormalizer::new()
            .normalize_all(raws, "s1")
            .into_iter()
            .map(|f| f.name.unwrap())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    fn arb_raw() -> impl Strategy<Value = RawFeature> {
        let kind = prop_oneof![
            Just(GeometryKind::Point),
            Just(GeometryKind::LineString),
            Just(GeometryKind::Polygon),
        ];
        let geometry = prop::option::of((kind, "[0-9, .]{0,12}"));
        (prop::option::of("[a-z]{1,8}"), geometry).prop_map(|(name, geometry)| RawFeature {
            name,
            description: None,
            geometry: geometry.map(|(kind, coords)| RawGeometry {
                kind,
                coordinates: coords.trim().to_string(),
            }),
        })
    }

    proptest! {
        #[test]
        fn prop_kept_features_always_have_geometry(raws in prop::collection::vec(arb_raw(), 0..20)) {
            let expected = raws
                .iter()
                .filter(|r| r.geometry.as_ref().is_some_and(|g| !g.coordinates.is_empty()))
                .count();
            let features = FeatureNormalizer::new().normalize_all(raws, "s1");

            prop_assert_eq!(features.len(), expected);
            for feature in &features {
                prop_assert!(!feature.coordinates.is_empty());
                prop_assert_eq!(feature.metadata.original_geometry_kind, feature.geometry_kind);
            }
        }
    }

    #[test]
    fn test_every_dropped_placemark_is_logged_by_name() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let kept = tracing::subscriber::with_default(subscriber, || {
            FeatureNormalizer::new().normalize_all(
                vec![
                    raw(Some("tour"), None),
                    raw(Some("blank"), Some((GeometryKind::Point, ""))),
                    raw(Some("pole"), Some((GeometryKind::Point, "1,2"))),
                ],
                "s7",
            )
        });

        assert_eq!(kept.len(), 1);
        let text = logs.text();
        let dropped: Vec<_> = text.lines().filter(|l| l.contains("Dropping placemark")).collect();
        assert_eq!(dropped.len(), 2);
        assert!(dropped[0].contains("source_id=\"s7\"") || dropped[0].contains("source_id=s7"));
        assert!(dropped[0].contains("tour"));
        assert!(dropped[1].contains("blank"));
    }
}
