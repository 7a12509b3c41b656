//! KML document rendering and KMZ packaging

use anyhow::{Context, Result};
use quick_xml::escape::escape;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::extractor::PRIMARY_DOCUMENT_NAME;
use crate::loader::kml_fragment;
use crate::parser::{RawFeature, KML_NAMESPACE};

/// Render placemarks as a KML 2.2 document
///
/// Placemarks without geometry are written with name and description only.
pub fn render_kml(document_name: &str, features: &[RawFeature]) -> String {
    let mut kml = String::new();
    kml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    kml.push_str(&format!("<kml xmlns=\"{}\">\n<Document>\n", KML_NAMESPACE));
    kml.push_str(&format!("<name>{}</name>\n", escape(document_name)));

    for feature in features {
        kml.push_str("<Placemark>");
        if let Some(name) = &feature.name {
            kml.push_str(&format!("<name>{}</name>", escape(name.as_str())));
        }
        if let Some(description) = &feature.description {
            kml.push_str(&format!(
                "<description>{}</description>",
                escape(description.as_str())
            ));
        }
        if let Some(geometry) = &feature.geometry {
            kml.push_str(&kml_fragment(
                geometry.kind,
                &escape(geometry.coordinates.as_str()),
            ));
        }
        kml.push_str("</Placemark>\n");
    }

    kml.push_str("</Document>\n</kml>\n");
    kml
}

/// Write `entries` (archive path, content) into a new ZIP container
pub fn write_archive(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create archive {}", path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, content) in entries {
        zip.start_file(*name, options)
            .with_context(|| format!("Failed to add {} to archive", name))?;
        zip.write_all(content)
            .with_context(|| format!("Failed to write {} to archive", name))?;
    }

    zip.finish().context("Failed to finalize archive")?;
    Ok(())
}

/// Package placemarks as a KMZ with a single `doc.kml`
pub fn write_kmz(path: &Path, document_name: &str, features: &[RawFeature]) -> Result<()> {
    let kml = render_kml(document_name, features);
    write_archive(path, &[(PRIMARY_DOCUMENT_NAME, kml.as_bytes())])?;

    info!(
        path = %path.display(),
        placemarks = features.len(),
        "KMZ written"
    );
    Ok(())
}
