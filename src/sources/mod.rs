//! # Sources Module
//!
//! Turns a user supplied URL into a locally available audio file.
//!
//! - [`ytdlp`] - downloads audio with `yt-dlp`, deduplicated through the
//!   persisted [`DownloadArchive`](crate::storage::DownloadArchive)
//! - [`share`] - the download-and-share path used by `/download`
//!
//! The playback engine only sees the [`TrackFetcher`] trait and the opaque
//! [`TrackRef`] it returns; it never opens the file itself.

pub mod share;
pub mod ytdlp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::FetchError;

pub use ytdlp::YtDlpFetcher;

/// Immutable reference to a downloaded track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRef {
    source_url: String,
    file_id: String,
    file_path: PathBuf,
}

impl TrackRef {
    pub fn new(source_url: impl Into<String>, file_id: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            file_id: file_id.into(),
            file_path: file_path.into(),
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

/// Resolves a source URL to a local audio file.
///
/// Implementations must be idempotent for URLs they already downloaded and
/// must bound the time they spend on a single fetch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<TrackRef, FetchError>;
}
