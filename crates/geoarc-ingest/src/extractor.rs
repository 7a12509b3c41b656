//! Archive extraction and primary document selection
//!
//! A KMZ is a ZIP container holding one or more `.kml` documents plus
//! assets. The whole container is unpacked into a temporary directory, the
//! tree is walked in a deterministic order (files before subdirectories,
//! each sorted by name), and the primary document is chosen:
//!
//! 1. the first file whose base name is exactly `doc.kml`, wherever it sits
//! 2. otherwise the first `.kml` file in walk order

use std::cmp::Ordering;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::error::{PipelineError, Result, Stage};
use crate::fetcher::StagedArchive;

pub const MARKUP_EXTENSION: &str = ".kml";
pub const PRIMARY_DOCUMENT_NAME: &str = "doc.kml";

/// The selected markup document of one archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub source_id: String,
    /// Path of the document relative to the archive root
    pub locator: PathBuf,
    pub content: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Unpack a staged archive and return its primary document
    ///
    /// Consumes the staged archive; its temporary directory is removed on
    /// return together with the extraction directory.
    pub fn extract(&self, archive: StagedArchive) -> Result<ExtractedDocument> {
        self.extract_file(&archive.source_id, &archive.path)
    }

    /// Unpack the archive at `path` and return its primary document
    pub fn extract_file(&self, source_id: &str, path: &Path) -> Result<ExtractedDocument> {
        let staging = |source| PipelineError::Staging {
            source_id: source_id.to_string(),
            stage: Stage::Extract,
            source,
        };
        let corrupt = |reason: String| PipelineError::CorruptArchive {
            source_id: source_id.to_string(),
            reason,
        };

        let file = File::open(path).map_err(staging)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;

        let dir = tempfile::Builder::new()
            .prefix("geoarc-extract-")
            .tempdir()
            .map_err(staging)?;

        archive.extract(dir.path()).map_err(|e| match e {
            zip::result::ZipError::Io(io_err) => staging(io_err),
            other => corrupt(other.to_string()),
        })?;

        debug!(entries = archive.len(), "Archive unpacked");

        let candidates = find_markup_files(dir.path()).map_err(staging)?;
        let primary = select_primary(&candidates).ok_or_else(|| PipelineError::NoMarkupFound {
            source_id: source_id.to_string(),
        })?;

        let locator = primary
            .strip_prefix(dir.path())
            .unwrap_or(primary)
            .to_path_buf();

        let bytes = std::fs::read(primary).map_err(staging)?;
        let content = String::from_utf8(bytes).map_err(|e| PipelineError::MarkupParse {
            source_id: source_id.to_string(),
            document: locator.display().to_string(),
            reason: format!("document is not valid UTF-8: {}", e),
        })?;

        info!(
            document = %locator.display(),
            candidates = candidates.len(),
            size_bytes = content.len(),
            "Selected markup document"
        );

        Ok(ExtractedDocument {
            source_id: source_id.to_string(),
            locator,
            content,
        })
    }
}

fn walk_order(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}

/// All `.kml` files under `root`, in walk order
pub fn find_markup_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).sort_by(walk_order) {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry
                .file_name()
                .to_string_lossy()
                .ends_with(MARKUP_EXTENSION)
        {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

/// Pick the primary document out of walk-ordered candidates
pub fn select_primary(candidates: &[PathBuf]) -> Option<&PathBuf> {
    candidates
        .iter()
        .find(|path| path.file_name().is_some_and(|name| name == PRIMARY_DOCUMENT_NAME))
        .or_else(|| candidates.first())
}
