//! Spatial store interface
//!
//! The loader talks to the database only through [`SpatialStore`] and the
//! [`LoadTransaction`] it hands out. [`postgres::PgSpatialStore`] is the
//! production adapter; [`memory::MemoryStore`] backs dry runs and tests.

use async_trait::async_trait;
use geoarc_common::CanonicalFeature;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{ExtensionState, MemoryStore, StoreCall};
pub use postgres::PgSpatialStore;

/// Store operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQL query or connection error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The store refused the statement (invalid geometry, unknown relation, ...)
    #[error("{0}")]
    Rejected(String),

    /// The transaction was already committed or rolled back
    #[error("transaction already finished")]
    TransactionFinished,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One insert destined for the feature table
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow<'a> {
    pub source_id: &'a str,
    pub name: Option<&'a str>,
    pub description: Option<&'a str>,
    pub metadata: serde_json::Value,
    /// Geometry as a KML fragment, handed to the store's KML constructor
    pub kml_fragment: String,
}

impl<'a> FeatureRow<'a> {
    pub fn new(
        feature: &'a CanonicalFeature,
        metadata: serde_json::Value,
        kml_fragment: String,
    ) -> Self {
        Self {
            source_id: &feature.source_id,
            name: feature.name.as_deref(),
            description: feature.description.as_deref(),
            metadata,
            kml_fragment,
        }
    }
}

/// A stored row as read back for post-load sampling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRow {
    pub id: i64,
    pub source_id: String,
    pub name: Option<String>,
    /// Geometry rendered as WKT
    pub wkt: Option<String>,
}

/// Spatial database seam used by the loader
#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Round-trip a trivial statement to prove connectivity
    async fn ping(&self) -> StoreResult<()>;

    /// Version of the spatial extension; errors when the extension is missing
    async fn spatial_version(&self) -> StoreResult<String>;

    /// Install the spatial extension if it is not already present
    async fn create_spatial_extension(&self) -> StoreResult<()>;

    async fn table_exists(&self, table: &str) -> StoreResult<bool>;

    /// Open a transaction for one source's load
    async fn begin(&self) -> StoreResult<Box<dyn LoadTransaction>>;

    async fn count_rows(&self, table: &str) -> StoreResult<i64>;

    async fn sample_rows(&self, table: &str, limit: i64) -> StoreResult<Vec<SampleRow>>;

    /// Refresh planner statistics for the table
    async fn analyze(&self, table: &str) -> StoreResult<()>;

    /// Release connections; the store is unusable afterwards
    async fn close(&self);
}

/// One open load transaction with single-level savepoint support
///
/// Dropping an unfinished transaction discards its pending writes.
#[async_trait]
pub trait LoadTransaction: Send {
    async fn savepoint(&mut self) -> StoreResult<()>;

    async fn release_savepoint(&mut self) -> StoreResult<()>;

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()>;

    /// Insert one row and return its generated identifier
    async fn insert_feature(&mut self, table: &str, row: &FeatureRow<'_>) -> StoreResult<i64>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}
