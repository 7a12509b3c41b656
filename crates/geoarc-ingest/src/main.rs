//! GeoArc Ingest - KMZ to PostGIS loader

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geoarc_common::logging::{init_logging, LogConfig, LogLevel};
use geoarc_common::{CanonicalFeature, GeometryKind};
use geoarc_ingest::config::{validate_table_name, IngestConfig, SourceCatalog};
use geoarc_ingest::extractor::ArchiveExtractor;
use geoarc_ingest::fetcher::{ArchiveFetcher, StagedArchive};
use geoarc_ingest::geojson::{FeatureCollection, GeoJsonFrontEnd};
use geoarc_ingest::loader::SpatialLoader;
use geoarc_ingest::normalizer::FeatureNormalizer;
use geoarc_ingest::orchestrator::IngestOrchestrator;
use geoarc_ingest::packager::write_kmz;
use geoarc_ingest::parser::KmlParser;
use geoarc_ingest::store::{MemoryStore, PgSpatialStore, SpatialStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "geoarc-ingest")]
#[command(author, version, about = "Load KMZ placemark archives into PostGIS")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch, parse and load every configured source
    Run {
        /// Source catalog (JSON)
        #[arg(short, long)]
        sources: Option<PathBuf>,

        /// Destination table
        #[arg(short, long)]
        table: Option<String>,

        /// Load into an in-memory store instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,

        /// Show download progress bars
        #[arg(long)]
        progress: bool,
    },

    /// Extract and parse a local archive without touching the database
    Inspect {
        /// Path to a .kmz archive
        archive: PathBuf,
    },

    /// Convert a GeoJSON feature collection into a KMZ archive
    PackageGeojson {
        /// Input GeoJSON file
        input: PathBuf,

        /// Output .kmz path
        output: PathBuf,

        /// Keep features whose type, class or structure property contains this text
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Load a GeoJSON feature collection directly as one source
    LoadGeojson {
        /// Input GeoJSON file
        input: PathBuf,

        /// Source identifier recorded on every row
        #[arg(long)]
        source_id: String,

        /// Destination table
        #[arg(short, long)]
        table: Option<String>,

        /// Keep features whose type, class or structure property contains this text
        #[arg(short, long)]
        filter: Option<String>,

        /// Load into an in-memory store instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("geoarc-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run {
            sources,
            table,
            dry_run,
            progress,
        } => {
            let mut config = IngestConfig::from_env()?;
            if let Some(path) = sources {
                config.sources_path = path;
            }
            if let Some(table) = table {
                validate_table_name(&table)?;
                config.table = table;
            }
            config.fetch.show_progress = progress;

            if dry_run {
                let store = MemoryStore::with_table(&config.table);
                run_sources(store, &config).await
            } else {
                let store = PgSpatialStore::connect(&config.database)
                    .await
                    .context("Failed to connect to the spatial database")?;
                run_sources(store, &config).await
            }
        },
        Command::Inspect { archive } => {
            inspect(&archive)?;
            Ok(ExitCode::SUCCESS)
        },
        Command::PackageGeojson {
            input,
            output,
            filter,
        } => {
            let collection = FeatureCollection::load(&input)?;
            let raws = GeoJsonFrontEnd::new(filter.as_deref()).to_raw_features(&collection);
            let document_name = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "features".to_string());
            write_kmz(&output, &document_name, &raws)?;
            Ok(ExitCode::SUCCESS)
        },
        Command::LoadGeojson {
            input,
            source_id,
            table,
            filter,
            dry_run,
        } => {
            let mut config = IngestConfig::from_env()?;
            if let Some(table) = table {
                validate_table_name(&table)?;
                config.table = table;
            }

            let collection = FeatureCollection::load(&input)?;
            let features = GeoJsonFrontEnd::new(filter.as_deref()).to_canonical(
                &collection,
                &source_id,
                &FeatureNormalizer::new(),
            );

            if dry_run {
                let store = MemoryStore::with_table(&config.table);
                load_features(store, &config, &source_id, &features).await
            } else {
                let store = PgSpatialStore::connect(&config.database)
                    .await
                    .context("Failed to connect to the spatial database")?;
                load_features(store, &config, &source_id, &features).await
            }
        },
    }
}

async fn run_sources<S: SpatialStore>(store: S, config: &IngestConfig) -> Result<ExitCode> {
    let catalog = SourceCatalog::load(&config.sources_path)?;
    info!(
        path = %config.sources_path.display(),
        sources = catalog.len(),
        "Loaded source catalog"
    );

    let orchestrator = IngestOrchestrator::new(
        ArchiveFetcher::new(&config.fetch)?,
        SpatialLoader::new(store, config.table.clone()),
    );

    let result = orchestrator.run(catalog.sources()).await;
    orchestrator.shutdown().await;
    let report = result?;

    println!("{}", report);

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn load_features<S: SpatialStore>(
    store: S,
    config: &IngestConfig,
    source_id: &str,
    features: &[CanonicalFeature],
) -> Result<ExitCode> {
    let loader = SpatialLoader::new(store, config.table.clone());

    let result = async {
        loader.ensure_ready().await?;
        loader.load(source_id, features).await
    }
    .await;
    loader.close().await;

    let outcome = result?;
    println!(
        "{}: {} inserted, {} failed, {} rows in {}",
        source_id,
        outcome.inserted,
        outcome.failed,
        outcome
            .total_rows
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string()),
        config.table
    );
    Ok(ExitCode::SUCCESS)
}

fn inspect(archive: &Path) -> Result<()> {
    let staged = StagedArchive::from_local("local", archive)?;
    let sha256 = staged.sha256.clone();
    let size_bytes = staged.size_bytes;

    let document = ArchiveExtractor::new().extract(staged)?;
    let raws = KmlParser::new().parse(&document)?;
    let placemarks = raws.len();
    let features = FeatureNormalizer::new().normalize_all(raws, "local");

    let mut by_kind: BTreeMap<GeometryKind, usize> = BTreeMap::new();
    for feature in &features {
        *by_kind.entry(feature.geometry_kind).or_default() += 1;
    }

    if features.is_empty() {
        warn!(document = %document.locator.display(), "No loadable features found");
    }

    println!("Archive:    {}", archive.display());
    println!("Size:       {} bytes", size_bytes);
    println!("SHA-256:    {}", sha256);
    println!("Document:   {}", document.locator.display());
    println!("Placemarks: {}", placemarks);
    println!("Features:   {}", features.len());
    for kind in GeometryKind::ALL {
        println!("  {:<10}  {}", kind.as_str(), by_kind.get(&kind).copied().unwrap_or(0));
    }

    Ok(())
}
