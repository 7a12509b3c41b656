//! Shared fixtures for geoarc-ingest integration tests
//!
//! - KML/KMZ builders for archive fixtures
//! - Test tracing setup
//! - A PostGIS container wrapper for the database-backed tests

#![allow(dead_code)]

use anyhow::{Context, Result};
use geoarc_ingest::config::SourceDescriptor;
use geoarc_ingest::packager::write_archive;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;
use url::Url;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const POSTGIS_IMAGE: &str = "postgis/postgis";
pub const POSTGIS_TAG: &str = "16-3.4";

// ============================================================================
// Tracing
// ============================================================================

/// Route test logs through the libtest writer; safe to call repeatedly
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("geoarc_ingest=debug")
        .with_test_writer()
        .try_init();
}

// ============================================================================
// KML / KMZ fixtures
// ============================================================================

pub fn kml_document(placemarks: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <name>fixture</name>
    {}
  </Document>
</kml>"#,
        placemarks
    )
}

pub fn point(name: &str, coordinates: &str) -> String {
    format!(
        "<Placemark><name>{}</name><Point><coordinates>{}</coordinates></Point></Placemark>",
        name, coordinates
    )
}

pub fn line(name: &str, coordinates: &str) -> String {
    format!(
        "<Placemark><name>{}</name><LineString><coordinates>{}</coordinates></LineString></Placemark>",
        name, coordinates
    )
}

pub fn polygon(name: &str, coordinates: &str) -> String {
    format!(
        "<Placemark><name>{}</name><Polygon><outerBoundaryIs><LinearRing>\
         <coordinates>{}</coordinates>\
         </LinearRing></outerBoundaryIs></Polygon></Placemark>",
        name, coordinates
    )
}

/// One point, one line and one polygon
pub fn three_shape_document() -> String {
    kml_document(&[
        point("pole-1", "-74.0060,40.7128,0"),
        line("span-1", "-74.0060,40.7128,0 -73.9352,40.7306,0"),
        polygon("lot-1", "0,0 1,0 1,1 0,1 0,0"),
    ]
    .concat())
}

/// KMZ archive bytes with the given (path, content) entries, in order
pub fn kmz_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        zip.start_file(*name, SimpleFileOptions::default())
            .expect("start zip entry");
        zip.write_all(content.as_bytes()).expect("write zip entry");
    }
    zip.finish().expect("finish zip").into_inner()
}

/// Write a KMZ archive with the given entries into `dir`
pub fn write_kmz_fixture(dir: &Path, file_name: &str, entries: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(file_name);
    let entries: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(name, content)| (*name, content.as_bytes()))
        .collect();
    write_archive(&path, &entries).expect("write kmz fixture");
    path
}

pub fn source(id: &str, url: &str) -> SourceDescriptor {
    SourceDescriptor {
        id: id.to_string(),
        name: format!("{} fixture", id),
        archive_url: Url::parse(url).expect("valid fixture url"),
    }
}

// ============================================================================
// PostGIS Test Container
// ============================================================================

/// PostGIS container with the feature table migration applied
pub struct TestPostgis {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgis {
    pub async fn start() -> Result<Self> {
        info!("Starting PostGIS test container...");

        let container = Postgres::default()
            .with_name(POSTGIS_IMAGE)
            .with_tag(POSTGIS_TAG)
            .start()
            .await
            .context("Failed to start PostGIS container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostGIS")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
