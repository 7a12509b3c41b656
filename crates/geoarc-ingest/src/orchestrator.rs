//! Ingestion orchestrator
//!
//! Runs the store readiness checks once, then drives each configured source
//! through fetch, extract, parse, normalize and load, strictly one after
//! another in catalog order. A failure in any stage ends that source only;
//! the next source starts from a clean slate.

use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SourceDescriptor;
use crate::error::Result;
use crate::extractor::ArchiveExtractor;
use crate::fetcher::ArchiveFetcher;
use crate::loader::{LoadOutcome, SpatialLoader};
use crate::normalizer::FeatureNormalizer;
use crate::parser::KmlParser;
use crate::report::{RunReport, SourceReport};
use crate::store::SpatialStore;

pub struct IngestOrchestrator<S> {
    fetcher: ArchiveFetcher,
    extractor: ArchiveExtractor,
    parser: KmlParser,
    normalizer: FeatureNormalizer,
    loader: SpatialLoader<S>,
}

impl<S: SpatialStore> IngestOrchestrator<S> {
    pub fn new(fetcher: ArchiveFetcher, loader: SpatialLoader<S>) -> Self {
        Self {
            fetcher,
            extractor: ArchiveExtractor::new(),
            parser: KmlParser::new(),
            normalizer: FeatureNormalizer::new(),
            loader,
        }
    }

    /// Process every source and report per-source outcomes
    ///
    /// Returns `Err` only when the store is not ready; in that case no
    /// source has been fetched.
    pub async fn run(&self, sources: &[SourceDescriptor]) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let mut report = RunReport::new(run_id);

        info!(run_id = %run_id, sources = sources.len(), table = %self.loader.table(), "Starting ingestion run");

        if let Err(e) = self.loader.ensure_ready().await {
            error!(run_id = %run_id, error = %e, "Spatial store is not ready, aborting run");
            return Err(e);
        }

        if sources.is_empty() {
            warn!(run_id = %run_id, "No sources configured");
        }

        for source in sources {
            let span = info_span!("source", source_id = %source.id, run_id = %run_id);

            let source_report = async {
                info!(name = %source.name, url = %source.archive_url, "Processing source");
                match self.process_source(source).await {
                    Ok(outcome) => SourceReport::succeeded(&source.id, &source.name, outcome),
                    Err(e) => {
                        error!(stage = %e.stage(), error = %e, "Source failed");
                        SourceReport::failed(&source.id, &source.name, &e)
                    },
                }
            }
            .instrument(span)
            .await;

            report.push(source_report);
        }

        report.log_summary();
        Ok(report)
    }

    async fn process_source(&self, source: &SourceDescriptor) -> Result<LoadOutcome> {
        let staged = self.fetcher.fetch(source).await?;
        let document = self.extractor.extract(staged)?;
        let raws = self.parser.parse(&document)?;
        let placemarks = raws.len();
        let features = self.normalizer.normalize_all(raws, &source.id);

        info!(
            document = %document.locator.display(),
            placemarks,
            features = features.len(),
            "Parsed features"
        );

        self.loader.load(&source.id, &features).await
    }

    /// Release the store's connections
    pub async fn shutdown(self) {
        self.loader.close().await;
    }
}
