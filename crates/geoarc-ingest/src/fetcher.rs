//! Archive fetcher
//!
//! Streams a source's archive into a private temporary directory. The
//! directory lives as long as the returned [`StagedArchive`] and is removed
//! when it is dropped, whether the source succeeds or fails.

use futures::StreamExt;
use geoarc_common::checksum::StreamingChecksum;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::config::{FetchConfig, SourceDescriptor};
use crate::error::{PipelineError, Result, Stage};

/// Staged file name when the URL path has no usable final segment
pub const DEFAULT_ARCHIVE_NAME: &str = "downloaded.kmz";
pub const ARCHIVE_EXTENSION: &str = ".kmz";

/// A downloaded archive on local disk
#[derive(Debug)]
pub struct StagedArchive {
    pub source_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the archive bytes
    pub sha256: String,
    _dir: TempDir,
}

impl StagedArchive {
    /// Wrap an archive that is already on disk, e.g. a local file under inspection
    ///
    /// The file is copied into a fresh temporary directory so the staged copy
    /// can be cleaned up like a downloaded one.
    pub fn from_local(source_id: &str, path: &Path) -> Result<Self> {
        let staging = |source| PipelineError::Staging {
            source_id: source_id.to_string(),
            stage: Stage::Fetch,
            source,
        };

        let dir = tempfile::Builder::new()
            .prefix("geoarc-fetch-")
            .tempdir()
            .map_err(staging)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string());
        let staged = dir.path().join(file_name);
        std::fs::copy(path, &staged).map_err(staging)?;
        let size_bytes = std::fs::metadata(&staged).map_err(staging)?.len();
        let sha256 = geoarc_common::checksum::compute_file_checksum(&staged)
            .map_err(|e| staging(std::io::Error::other(e)))?;

        Ok(Self {
            source_id: source_id.to_string(),
            path: staged,
            size_bytes,
            sha256,
            _dir: dir,
        })
    }
}

/// Derive the staged file name from the archive URL
///
/// Uses the last path segment, falling back to [`DEFAULT_ARCHIVE_NAME`], and
/// appends `.kmz` when the name does not already end with it.
pub fn archive_file_name(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty() && *s != "." && *s != "..");

    match segment {
        Some(name) if name.ends_with(ARCHIVE_EXTENSION) => name.to_string(),
        Some(name) => format!("{}{}", name, ARCHIVE_EXTENSION),
        None => DEFAULT_ARCHIVE_NAME.to_string(),
    }
}

/// Downloads source archives over HTTP(S)
pub struct ArchiveFetcher {
    client: reqwest::Client,
    show_progress: bool,
}

impl ArchiveFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            show_progress: config.show_progress,
        })
    }

    /// Download the source's archive into a fresh temporary directory
    ///
    /// Any non-2xx status or transport error is a fetch failure.
    pub async fn fetch(&self, source: &SourceDescriptor) -> Result<StagedArchive> {
        let url = &source.archive_url;
        let fetch_error = |reason: String| PipelineError::Fetch {
            source_id: source.id.clone(),
            url: url.to_string(),
            reason,
        };
        let staging = |e: std::io::Error| PipelineError::Staging {
            source_id: source.id.clone(),
            stage: Stage::Fetch,
            source: e,
        };

        info!(url = %url, "Downloading archive");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("HTTP status {}", status)));
        }

        let dir = tempfile::Builder::new()
            .prefix("geoarc-fetch-")
            .tempdir()
            .map_err(staging)?;
        let path = dir.path().join(archive_file_name(url));
        let mut file = tokio::fs::File::create(&path).await.map_err(staging)?;

        let pb = self.progress_bar(response.content_length(), &source.id);
        let mut checksum = StreamingChecksum::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fetch_error(format!("transfer interrupted: {}", e)))?;
            file.write_all(&chunk).await.map_err(staging)?;
            checksum.update(&chunk);
            pb.set_position(checksum.bytes());
        }

        file.flush().await.map_err(staging)?;
        pb.finish_and_clear();

        let size_bytes = checksum.bytes();
        let sha256 = checksum.finalize_hex();

        debug!(path = %path.display(), "Archive staged");
        info!(size_bytes, sha256 = %sha256, "Download complete");

        Ok(StagedArchive {
            source_id: source.id.clone(),
            path,
            size_bytes,
            sha256,
            _dir: dir,
        })
    }

    fn progress_bar(&self, total: Option<u64>, source_id: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = match total {
            Some(len) => ProgressBar::new(len),
            None => ProgressBar::new_spinner(),
        };
        let style = ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message(format!("Downloading {}", source_id));
        pb
    }
}
