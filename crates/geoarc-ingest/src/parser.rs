//! KML placemark parser
//!
//! Streams the document with a namespace-aware reader and materializes a
//! small element tree for each `Placemark` in the KML 2.2 namespace only.
//! Placemarks are emitted in document order; a placemark nested inside
//! another follows its parent.
//!
//! For each placemark:
//! - `name` / `description` are the text of the direct children of that
//!   name, `None` when absent or empty
//! - geometry is probed as `Point/coordinates`, then
//!   `LineString/coordinates`, then
//!   `Polygon/outerBoundaryIs/LinearRing/coordinates`; the first hit wins
//!   and its text is trimmed
//!
//! Elements in other namespaces (or none) never match.

use anyhow::{anyhow, Context};
use geoarc_common::GeometryKind;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::extractor::ExtractedDocument;

pub const KML_NAMESPACE: &str = "http://www.opengis.net/kml/2.2";

const PLACEMARK: &str = "Placemark";
const MULTI_GEOMETRY: &str = "MultiGeometry";

/// Geometry found on a placemark
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGeometry {
    pub kind: GeometryKind,
    /// Trimmed coordinate text, possibly empty
    pub coordinates: String,
}

/// A placemark as read from the document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFeature {
    pub name: Option<String>,
    pub description: Option<String>,
    pub geometry: Option<RawGeometry>,
}

impl RawFeature {
    pub fn geometry_kind(&self) -> Option<GeometryKind> {
        self.geometry.as_ref().map(|g| g.kind)
    }
}

/// Probe path below the placemark for each geometry kind
fn coordinates_path(kind: GeometryKind) -> &'static [&'static str] {
    match kind {
        GeometryKind::Point => &["Point", "coordinates"],
        GeometryKind::LineString => &["LineString", "coordinates"],
        GeometryKind::Polygon => &["Polygon", "outerBoundaryIs", "LinearRing", "coordinates"],
    }
}

#[derive(Debug)]
struct Node {
    local_name: String,
    in_kml: bool,
    /// Character data before the first child element
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn open(ns: &ResolveResult<'_>, start: &BytesStart<'_>) -> Self {
        let in_kml = matches!(ns, ResolveResult::Bound(Namespace(uri)) if *uri == KML_NAMESPACE.as_bytes());
        Self {
            local_name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            in_kml,
            text: String::new(),
            children: Vec::new(),
        }
    }

    fn is(&self, local_name: &str) -> bool {
        self.in_kml && self.local_name == local_name
    }

    fn push_text(&mut self, text: &str) {
        if self.children.is_empty() {
            self.text.push_str(text);
        }
    }

    fn text(&self) -> Option<String> {
        if self.text.is_empty() {
            None
        } else {
            Some(self.text.clone())
        }
    }

    fn child(&self, local_name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.is(local_name))
    }

    /// First descendant reached by following `path` one level per step
    fn find_path(&self, path: &[&str]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        self.children
            .iter()
            .filter(|c| c.is(first))
            .find_map(|c| if rest.is_empty() { Some(c) } else { c.find_path(rest) })
    }

    fn to_feature(&self) -> RawFeature {
        let geometry = GeometryKind::ALL.into_iter().find_map(|kind| {
            self.find_path(coordinates_path(kind)).map(|node| RawGeometry {
                kind,
                coordinates: node.text.trim().to_string(),
            })
        });

        let name = self.child("name").and_then(Node::text);

        if geometry.is_none() && self.child(MULTI_GEOMETRY).is_some() {
            debug!(
                name = name.as_deref().unwrap_or("<unnamed>"),
                "Placemark uses MultiGeometry, which is not supported"
            );
        }

        RawFeature {
            name,
            description: self.child("description").and_then(Node::text),
            geometry,
        }
    }

    /// Emit this subtree's placemarks in pre-order
    fn collect_placemarks(self, out: &mut Vec<RawFeature>) {
        if self.is(PLACEMARK) {
            out.push(self.to_feature());
        }
        for child in self.children {
            child.collect_placemarks(out);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KmlParser;

impl KmlParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse the extracted document into raw placemarks
    pub fn parse(&self, document: &ExtractedDocument) -> Result<Vec<RawFeature>> {
        let features =
            self.parse_str(&document.content)
                .map_err(|e| PipelineError::MarkupParse {
                    source_id: document.source_id.clone(),
                    document: document.locator.display().to_string(),
                    reason: format!("{:#}", e),
                })?;

        debug!(
            document = %document.locator.display(),
            placemarks = features.len(),
            "Parsed markup document"
        );
        Ok(features)
    }

    /// Parse KML text; zero placemarks is a valid result
    pub fn parse_str(&self, xml: &str) -> anyhow::Result<Vec<RawFeature>> {
        let mut reader = NsReader::from_str(xml);
        let mut features = Vec::new();
        // Open elements inside the current outermost placemark
        let mut stack: Vec<Node> = Vec::new();
        let mut depth = 0usize;
        let mut saw_root = false;

        loop {
            let position = reader.buffer_position();
            let (ns, event) = reader
                .read_resolved_event()
                .with_context(|| format!("XML error near byte {}", position))?;

            match event {
                Event::Start(start) => {
                    depth += 1;
                    saw_root = true;
                    let node = Node::open(&ns, &start);
                    if !stack.is_empty() || node.is(PLACEMARK) {
                        stack.push(node);
                    }
                },
                Event::Empty(start) => {
                    saw_root = true;
                    let node = Node::open(&ns, &start);
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => node.collect_placemarks(&mut features),
                    }
                },
                Event::End(_) => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| anyhow!("unmatched closing tag near byte {}", position))?;
                    if let Some(node) = stack.pop() {
                        match stack.last_mut() {
                            Some(parent) => parent.children.push(node),
                            None => node.collect_placemarks(&mut features),
                        }
                    }
                },
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .with_context(|| format!("invalid character data near byte {}", position))?;
                    if let Some(node) = stack.last_mut() {
                        node.push_text(&text);
                    }
                },
                Event::CData(data) => {
                    if let Some(node) = stack.last_mut() {
                        node.push_text(&String::from_utf8_lossy(&data));
                    }
                },
                Event::Eof => break,
                _ => {},
            }
        }

        if !saw_root {
            return Err(anyhow!("document has no root element"));
        }
        if depth > 0 {
            return Err(anyhow!(
                "unexpected end of document with {} unclosed element(s)",
                depth
            ));
        }

        Ok(features)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn kml(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2"><Document>{}</Document></kml>"#,
            body
        )
    }

    #[test]
    fn test_point_placemark() {
        let xml = kml(
            "<Placemark><name>A</name><Point><coordinates> 10,20,0 </coordinates></Point></Placemark>",
        );
        let features = KmlParser::new().parse_str(&xml).unwrap();

        assert_eq!(features.len(), 1);
        assert_eq!(features[0].name.as_deref(), Some("A"));
        assert_eq!(features[0].description, None);
        assert_eq!(
            features[0].geometry,
            Some(RawGeometry {
                kind: GeometryKind::Point,
                coordinates: "10,20,0".to_string()
            })
        );
    }

    #[test]
    fn test_polygon_uses_outer_boundary() {
        let xml = kml(
            "<Placemark><Polygon>\
               <outerBoundaryIs><LinearRing><coordinates>0,0 1,0 1,1 0,0</coordinates></LinearRing></outerBoundaryIs>\
               <innerBoundaryIs><LinearRing><coordinates>9,9 9,9 9,9 9,9</coordinates></LinearRing></innerBoundaryIs>\
             </Polygon></Placemark>",
        );
        let features = KmlParser::new().parse_str(&xml).unwrap();

        let geometry = features[0].geometry.as_ref().unwrap();
        assert_eq!(geometry.kind, GeometryKind::Polygon);
        assert_eq!(geometry.coordinates, "0,0 1,0 1,1 0,0");
    }

    #[test]
    fn test_point_wins_over_linestring() {
        let xml = kml(
            "<Placemark>\
               <LineString><coordinates>0,0 1,1</coordinates></LineString>\
               <Point><coordinates>5,5</coordinates></Point>\
             </Placemark>",
        );
        let features = KmlParser::new().parse_str(&xml).unwrap();
        assert_eq!(features[0].geometry_kind(), Some(GeometryKind::Point));
    }

    #[test]
    fn test_placemark_without_geometry_is_kept_raw() {
        let xml = kml("<Placemark><name>Nothing here</name></Placemark>");
        let features = KmlParser::new().parse_str(&xml).unwrap();
        assert_eq!(features.len(), 1);
        assert!(features[0].geometry.is_none());
    }

    #[test]
    fn test_empty_name_is_absent_and_entities_decoded() {
        let xml = kml(
            "<Placemark><name></name><description>Poles &amp; wires</description>\
             <Point><coordinates>1,2</coordinates></Point></Placemark>",
        );
        let features = KmlParser::new().parse_str(&xml).unwrap();
        assert_eq!(features[0].name, None);
        assert_eq!(features[0].description.as_deref(), Some("Poles & wires"));
    }

    #[test]
    fn test_cdata_description() {
        let xml = kml(
            "<Placemark><description><![CDATA[<b>bold</b>]]></description>\
             <Point><coordinates>1,2</coordinates></Point></Placemark>",
        );
        let features = KmlParser::new().parse_str(&xml).unwrap();
        assert_eq!(features[0].description.as_deref(), Some("<b>bold</b>"));
    }

    #[test]
    fn test_foreign_namespace_is_ignored() {
        let xml = r#"<kml xmlns="http://www.opengis.net/kml/2.2" xmlns:x="urn:other">
            <x:Placemark><x:name>ghost</x:name></x:Placemark>
            <Placemark><x:name>ignored</x:name><Point><x:coordinates>1,1</x:coordinates></Point></Placemark>
        </kml>"#;
        let features = KmlParser::new().parse_str(xml).unwrap();

        assert_eq!(features.len(), 1);
        assert_eq!(features[0].name, None);
        assert!(features[0].geometry.is_none());
    }

    #[test]
    fn test_unnamespaced_document_yields_nothing() {
        let xml = "<kml><Placemark><name>A</name><Point><coordinates>1,2</coordinates></Point></Placemark></kml>";
        assert!(KmlParser::new().parse_str(xml).unwrap().is_empty());
    }

    #[test]
    fn test_nested_placemarks_in_document_order() {
        let xml = kml(
            "<Placemark><name>outer</name><Placemark><name>inner</name></Placemark></Placemark>\
             <Folder><Placemark><name>last</name></Placemark></Folder>",
        );
        let names: Vec<_> = KmlParser::new()
            .parse_str(&xml)
            .unwrap()
            .into_iter()
            .map(|f| f.name.unwrap())
            .collect();
        assert_eq!(names, vec!["outer", "inner", "last"]);
    }

    #[test]
    fn test_self_closing_placemark() {
        let xml = kml("<Placemark/>");
        let features = KmlParser::new().parse_str(&xml).unwrap();
        assert_eq!(features, vec![RawFeature::default()]);
    }

    #[test]
    fn test_zero_placemarks_is_ok() {
        let xml = kml("<Folder><name>empty</name></Folder>");
        assert!(KmlParser::new().parse_str(&xml).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_documents() {
        let parser = KmlParser::new();
        assert!(parser.parse_str("").is_err());
        assert!(parser.parse_str(&kml("<Placemark><name>A</Placemark>")).is_err());
        assert!(parser
            .parse_str(r#"<kml xmlns="http://www.opengis.net/kml/2.2"><Placemark>"#)
            .is_err());
    }

    #[test]
    fn test_parse_maps_errors_to_markup_parse() {
        let document = ExtractedDocument {
            source_id: "s1".to_string(),
            locator: "doc.kml".into(),
            content: "<kml><broken></kml>".to_string(),
        };
        let err = KmlParser::new().parse(&document).unwrap_err();
        assert!(matches!(err, PipelineError::MarkupParse { ref document, .. } if document == "doc.kml"));
    }
}
