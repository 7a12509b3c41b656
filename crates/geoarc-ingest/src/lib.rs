//! GeoArc Ingest Library
//!
//! Loads KMZ archives of geospatial placemarks into a PostGIS feature table.
//!
//! # Pipeline
//!
//! For each configured source, in catalog order:
//!
//! - **Fetch**: stream the archive into a temporary directory
//! - **Extract**: unpack it and pick the primary `.kml` document
//! - **Parse**: read every KML 2.2 `Placemark`
//! - **Normalize**: keep placemarks with a usable geometry
//! - **Load**: insert into the feature table, one savepoint per record
//!
//! Store readiness (spatial extension, destination table) is checked once
//! before any source is fetched.
//!
//! # Example
//!
//! ```no_run
//! use geoarc_ingest::config::{IngestConfig, SourceCatalog};
//! use geoarc_ingest::fetcher::ArchiveFetcher;
//! use geoarc_ingest::loader::SpatialLoader;
//! use geoarc_ingest::orchestrator::IngestOrchestrator;
//! use geoarc_ingest::store::PgSpatialStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let catalog = SourceCatalog::load(&config.sources_path)?;
//!
//!     let store = PgSpatialStore::connect(&config.database).await?;
//!     let orchestrator = IngestOrchestrator::new(
//!         ArchiveFetcher::new(&config.fetch)?,
//!         SpatialLoader::new(store, config.table.clone()),
//!     );
//!
//!     let report = orchestrator.run(catalog.sources()).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod geojson;
pub mod loader;
pub mod normalizer;
pub mod orchestrator;
pub mod packager;
pub mod parser;
pub mod report;
pub mod store;

pub use error::{PipelineError, Result, Stage};
