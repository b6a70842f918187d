//! Download-and-share: fetch a source, push the file to a hosting service
//! and hand back a link. Independent of playback.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use super::TrackFetcher;
use crate::error::{ShareError, UploadError};

/// Longest link lifetime a caller may ask for.
pub const MAX_LIFETIME_DAYS: u32 = 30;

/// Pushes a local file to a file-hosting service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Returns a share link valid for `lifetime_days`.
    async fn upload(&self, path: &Path, lifetime_days: u32) -> Result<String, UploadError>;
}

pub async fn download_and_share(
    fetcher: &dyn TrackFetcher,
    uploader: &dyn Uploader,
    url: &str,
    lifetime_days: u32,
    timeout: Duration,
) -> Result<String, ShareError> {
    let days = lifetime_days.clamp(1, MAX_LIFETIME_DAYS);
    let track = fetcher.fetch(url).await?;

    info!("📤 Uploading {} ({} day link)", track.file_path().display(), days);
    let link = tokio::time::timeout(timeout, uploader.upload(track.file_path(), days))
        .await
        .map_err(|_| {
            error!("⏰ Upload of {} timed out", track.file_path().display());
            UploadError::Timeout(timeout)
        })??;

    info!("🔗 Shared {} as {}", url, link);
    Ok(link)
}
