//! Per-run outcome reporting

use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Stage};
use crate::loader::LoadOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    /// The load completed; individual records may still have failed
    Succeeded(LoadOutcome),
    Failed { stage: Stage, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub name: String,
    pub status: SourceStatus,
}

impl SourceReport {
    pub fn succeeded(source_id: &str, name: &str, outcome: LoadOutcome) -> Self {
        Self {
            source_id: source_id.to_string(),
            name: name.to_string(),
            status: SourceStatus::Succeeded(outcome),
        }
    }

    pub fn failed(source_id: &str, name: &str, err: &PipelineError) -> Self {
        Self {
            source_id: source_id.to_string(),
            name: name.to_string(),
            status: SourceStatus::Failed {
                stage: err.stage(),
                reason: err.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, SourceStatus::Succeeded(_))
    }
}

/// Outcome of one orchestrator run, one entry per source in processing order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            sources: Vec::new(),
        }
    }

    pub fn push(&mut self, report: SourceReport) {
        self.sources.push(report);
    }

    pub fn succeeded_count(&self) -> usize {
        self.sources.iter().filter(|s| s.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.sources.len() - self.succeeded_count()
    }

    /// Total rows inserted across all succeeded sources
    pub fn inserted_count(&self) -> usize {
        self.sources
            .iter()
            .filter_map(|s| match &s.status {
                SourceStatus::Succeeded(outcome) => Some(outcome.inserted),
                SourceStatus::Failed { .. } => None,
            })
            .sum()
    }

    /// A run fails only when every source failed; an empty run succeeds
    pub fn is_success(&self) -> bool {
        self.sources.is_empty() || self.succeeded_count() > 0
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceReport> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    /// Emit the run summary through tracing
    pub fn log_summary(&self) {
        for source in &self.sources {
            match &source.status {
                SourceStatus::Succeeded(outcome) => {
                    info!(
                        source_id = %source.source_id,
                        attempted = outcome.attempted,
                        inserted = outcome.inserted,
                        failed = outcome.failed,
                        total_rows = ?outcome.total_rows,
                        "Source loaded"
                    );
                    for sample in &outcome.failure_samples {
                        warn!(source_id = %source.source_id, failure = %sample, "Record failed");
                    }
                },
                SourceStatus::Failed { stage, reason } => error!(
                    source_id = %source.source_id,
                    stage = %stage,
                    reason = %reason,
                    "Source failed"
                ),
            }
        }

        if self.sources.is_empty() {
            warn!(run_id = %self.run_id, "Run finished with no sources");
        } else {
            info!(
                run_id = %self.run_id,
                succeeded = self.succeeded_count(),
                failed = self.failed_count(),
                inserted = self.inserted_count(),
                "Run finished"
            );
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        for source in &self.sources {
            match &source.status {
                SourceStatus::Succeeded(outcome) => {
                    writeln!(
                        f,
                        "  [ok]     {} ({}): {} attempted, {} inserted, {} failed, {} rows in table",
                        source.source_id,
                        source.name,
                        outcome.attempted,
                        outcome.inserted,
                        outcome.failed,
                        outcome
                            .total_rows
                            .map(|n| n.to_string())
                            .unwrap_or_else(|| "?".to_string())
                    )?;
                    for sample in &outcome.failure_samples {
                        writeln!(f, "           - {}", sample)?;
                    }
                },
                SourceStatus::Failed { stage, reason } => writeln!(
                    f,
                    "  [failed] {} ({}): {} stage: {}",
                    source.source_id, source.name, stage, reason
                )?,
            }
        }
        write!(
            f,
            "{} succeeded, {} failed, {} features inserted",
            self.succeeded_count(),
            self.failed_count(),
            self.inserted_count()
        )
    }
}
