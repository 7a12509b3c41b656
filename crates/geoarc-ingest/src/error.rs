//! Pipeline error taxonomy
//!
//! Stage errors (fetch, extract, parse, load) are isolated per source by the
//! orchestrator. Readiness errors abort the whole run. Record insert errors
//! never leave the loader.

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline stage an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Store prerequisites, checked once per run
    Readiness,
    Fetch,
    Extract,
    Parse,
    Load,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Readiness => write!(f, "readiness"),
            Stage::Fetch => write!(f, "fetch"),
            Stage::Extract => write!(f, "extract"),
            Stage::Parse => write!(f, "parse"),
            Stage::Load => write!(f, "load"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to fetch archive for source '{source_id}' from {url}: {reason}")]
    Fetch {
        source_id: String,
        url: String,
        reason: String,
    },

    #[error("archive for source '{source_id}' is not a readable ZIP container: {reason}")]
    CorruptArchive { source_id: String, reason: String },

    #[error("archive for source '{source_id}' contains no .kml document")]
    NoMarkupFound { source_id: String },

    #[error("markup document '{document}' for source '{source_id}' is malformed: {reason}")]
    MarkupParse {
        source_id: String,
        document: String,
        reason: String,
    },

    #[error("failed to insert record #{index} ({name}) for source '{source_id}': {reason}", name = .name.as_deref().unwrap_or("<unnamed>"))]
    RecordInsert {
        source_id: String,
        index: usize,
        name: Option<String>,
        reason: String,
    },

    #[error("destination table '{table}' does not exist; run the schema migrations first")]
    MissingSchema { table: String },

    #[error("spatial extension is unavailable: {reason}")]
    ExtensionUnavailable { reason: String },

    #[error("failed to stage files for source '{source_id}' during {stage}: {source}")]
    Staging {
        source_id: String,
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("load for source '{source_id}' aborted: {source}")]
    Load {
        source_id: String,
        #[source]
        source: StoreError,
    },

    #[error("spatial store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// The stage this error belongs to
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Fetch { .. } => Stage::Fetch,
            PipelineError::CorruptArchive { .. } | PipelineError::NoMarkupFound { .. } => {
                Stage::Extract
            },
            PipelineError::MarkupParse { .. } => Stage::Parse,
            PipelineError::RecordInsert { .. } | PipelineError::Load { .. } => Stage::Load,
            PipelineError::Staging { stage, .. } => *stage,
            PipelineError::MissingSchema { .. }
            | PipelineError::ExtensionUnavailable { .. }
            | PipelineError::Store(_) => Stage::Readiness,
        }
    }

    /// Whether this error blocks every source, not just the current one
    pub fn is_run_fatal(&self) -> bool {
        self.stage() == Stage::Readiness
    }
}
