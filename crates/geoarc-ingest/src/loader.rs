//! Spatial loader
//!
//! Writes one source's canonical features into the feature table inside a
//! single transaction. Each insert runs under its own savepoint so a bad
//! record is rolled back alone and the rest of the batch still commits.

use geoarc_common::{CanonicalFeature, GeometryKind};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::store::{FeatureRow, LoadTransaction, SpatialStore};

/// Rows fetched for the post-load sample log
const SAMPLE_ROW_LIMIT: i64 = 3;

/// Record failures kept on the outcome
pub const MAX_FAILURE_SAMPLES: usize = 5;

/// Wrap coordinate text in the KML element for its geometry kind
pub fn kml_fragment(kind: GeometryKind, coordinates: &str) -> String {
    match kind {
        GeometryKind::Point => format!("<Point><coordinates>{}</coordinates></Point>", coordinates),
        GeometryKind::LineString => format!(
            "<LineString><coordinates>{}</coordinates></LineString>",
            coordinates
        ),
        GeometryKind::Polygon => format!(
            "<Polygon><outerBoundaryIs><LinearRing><coordinates>{}</coordinates></LinearRing></outerBoundaryIs></Polygon>",
            coordinates
        ),
    }
}

/// What happened when one source was loaded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    pub source_id: String,
    pub attempted: usize,
    pub inserted: usize,
    pub failed: usize,
    /// Table row count after the load; `None` when verification failed
    pub total_rows: Option<i64>,
    /// The first few record failures, rendered
    pub failure_samples: Vec<String>,
}

impl LoadOutcome {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Self::default()
        }
    }

    fn record_failure(&mut self, err: &PipelineError) {
        self.failed += 1;
        if self.failure_samples.len() < MAX_FAILURE_SAMPLES {
            self.failure_samples.push(err.to_string());
        }
    }
}

pub struct SpatialLoader<S> {
    store: S,
    table: String,
}

impl<S: SpatialStore> SpatialLoader<S> {
    pub fn new(store: S, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Verify store prerequisites: connectivity, the spatial extension
    /// (installing it when missing) and the destination table.
    ///
    /// Every error here is fatal for the whole run.
    pub async fn ensure_ready(&self) -> Result<()> {
        self.store.ping().await?;

        match self.store.spatial_version().await {
            Ok(version) => info!(version = %version, "Spatial extension available"),
            Err(probe_err) => {
                warn!(error = %probe_err, "Spatial extension not available, creating it");

                self.store.create_spatial_extension().await.map_err(|e| {
                    PipelineError::ExtensionUnavailable {
                        reason: format!("could not create extension: {}", e),
                    }
                })?;

                let version = self.store.spatial_version().await.map_err(|e| {
                    PipelineError::ExtensionUnavailable {
                        reason: format!("extension created but still not usable: {}", e),
                    }
                })?;
                info!(version = %version, "Spatial extension created");
            },
        }

        if !self.store.table_exists(&self.table).await? {
            return Err(PipelineError::MissingSchema {
                table: self.table.clone(),
            });
        }

        debug!(table = %self.table, "Destination table present");
        Ok(())
    }

    /// Load one source's features
    ///
    /// Individual record failures are counted, never returned. An `Err`
    /// means the transaction itself became unusable and nothing from this
    /// source was committed.
    pub async fn load(&self, source_id: &str, features: &[CanonicalFeature]) -> Result<LoadOutcome> {
        let mut outcome = LoadOutcome::new(source_id);

        if features.is_empty() {
            info!("No features to load");
        } else {
            let mut tx = self
                .store
                .begin()
                .await
                .map_err(|source| PipelineError::Load {
                    source_id: source_id.to_string(),
                    source,
                })?;

            self.insert_all(tx.as_mut(), source_id, features, &mut outcome)
                .await?;

            if outcome.inserted > 0 {
                tx.commit().await.map_err(|source| PipelineError::Load {
                    source_id: source_id.to_string(),
                    source,
                })?;
                info!(
                    inserted = outcome.inserted,
                    failed = outcome.failed,
                    "Committed features"
                );
            } else {
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "Rollback of empty load failed");
                }
                warn!(failed = outcome.failed, "No features inserted; transaction rolled back");
            }
        }

        self.verify(&mut outcome).await;
        Ok(outcome)
    }

    async fn insert_all(
        &self,
        tx: &mut dyn LoadTransaction,
        source_id: &str,
        features: &[CanonicalFeature],
        outcome: &mut LoadOutcome,
    ) -> Result<()> {
        let abort = |source| PipelineError::Load {
            source_id: source_id.to_string(),
            source,
        };

        for (index, feature) in features.iter().enumerate() {
            outcome.attempted += 1;

            let record_error = |reason: String| PipelineError::RecordInsert {
                source_id: source_id.to_string(),
                index,
                name: feature.name.clone(),
                reason,
            };

            let metadata = match feature.metadata.to_json() {
                Ok(metadata) => metadata,
                Err(e) => {
                    let err = record_error(e.to_string());
                    error!(error = %err, "Failed to serialize feature metadata");
                    outcome.record_failure(&err);
                    continue;
                },
            };
            let row = FeatureRow::new(
                feature,
                metadata,
                kml_fragment(feature.geometry_kind, &feature.coordinates),
            );

            // Create a savepoint before each record to isolate failures
            if let Err(e) = tx.savepoint().await {
                error!(error = %e, "Failed to create savepoint, aborting load");
                return Err(abort(e));
            }

            match tx.insert_feature(&self.table, &row).await {
                Ok(id) => {
                    tx.release_savepoint().await.map_err(abort)?;
                    outcome.inserted += 1;
                    debug!(
                        id,
                        index,
                        kind = %feature.geometry_kind,
                        name = feature.name.as_deref().unwrap_or("<unnamed>"),
                        "Inserted feature"
                    );
                },
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback_to_savepoint().await {
                        error!(
                            rollback_error = %rollback_err,
                            "Failed to rollback savepoint, aborting load"
                        );
                        return Err(abort(rollback_err));
                    }

                    let err = record_error(e.to_string());
                    error!(
                        error = %err,
                        kind = %feature.geometry_kind,
                        coordinates = %feature.coordinates,
                        "Failed to insert feature (isolated with savepoint)"
                    );
                    outcome.record_failure(&err);
                },
            }
        }

        Ok(())
    }

    /// Post-load row count, samples and statistics refresh; never fails the load
    async fn verify(&self, outcome: &mut LoadOutcome) {
        let count = match self.store.count_rows(&self.table).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Post-load row count failed");
                return;
            },
        };
        outcome.total_rows = Some(count);
        info!(table = %self.table, total_rows = count, "Post-load verification");

        if count == 0 {
            return;
        }

        match self.store.sample_rows(&self.table, SAMPLE_ROW_LIMIT).await {
            Ok(rows) => {
                for row in rows {
                    debug!(
                        id = row.id,
                        source_id = %row.source_id,
                        name = row.name.as_deref().unwrap_or("<unnamed>"),
                        wkt = row.wkt.as_deref().unwrap_or(""),
                        "Sample row"
                    );
                }
            },
            Err(e) => warn!(error = %e, "Failed to sample rows"),
        }

        if let Err(e) = self.store.analyze(&self.table).await {
            warn!(error = %e, "Failed to analyze table");
        }
    }

    /// Close the underlying store
    pub async fn close(&self) {
        self.store.close().await;
    }
}
