use std::time::Duration;
use thiserror::Error;

/// Errors reported by the playback engine to command callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("You are not connected to a voice channel")]
    NotInVoice,
    #[error("Not connected to a voice channel in this server")]
    NotConnected,
    #[error("Failed to fetch track: {0}")]
    FetchFailed(String),
    #[error("Fetching the track timed out after {}s", .0.as_secs())]
    FetchTimeout(Duration),
    #[error("Queue is empty")]
    QueueEmpty,
    #[error("Something is already playing")]
    AlreadyPlaying,
    #[error("Reconnect failed: {0}")]
    ReconnectFailed(String),
    #[error("Voice transport error: {0}")]
    Transport(String),
}

impl PlaybackError {
    /// `AlreadyPlaying` and `QueueEmpty` describe a state rather than a failure.
    pub fn is_informational(&self) -> bool {
        matches!(self, PlaybackError::AlreadyPlaying | PlaybackError::QueueEmpty)
    }
}

/// Errors produced by a [`TrackFetcher`](crate::sources::TrackFetcher).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
    #[error("downloader exited with {status}: {stderr}")]
    ExitStatus { status: String, stderr: String },
    #[error("downloader produced no output file for {0}")]
    MissingOutput(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io(err.to_string())
    }
}

impl From<FetchError> for PlaybackError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout(after) => PlaybackError::FetchTimeout(after),
            other => PlaybackError::FetchFailed(other.to_string()),
        }
    }
}

/// Errors produced by an [`Uploader`](crate::sources::share::Uploader).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("upload timed out after {0:?}")]
    Timeout(Duration),
    #[error("upload service unavailable: {0}")]
    Unavailable(String),
}

/// Failure of the download-and-share path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShareError {
    #[error("Download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),
}
