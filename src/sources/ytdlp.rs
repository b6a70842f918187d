use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{TrackFetcher, TrackRef};
use crate::{
    error::FetchError,
    storage::{ArchiveEntry, DownloadArchive},
};

/// Downloads audio with `yt-dlp` and keeps the result in a local directory.
pub struct YtDlpFetcher {
    program: String,
    download_dir: PathBuf,
    timeout: Duration,
    archive: Mutex<DownloadArchive>,
}

impl YtDlpFetcher {
    pub async fn new(download_dir: PathBuf, data_dir: &Path, timeout: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(&download_dir).await?;
        let archive = DownloadArchive::open(data_dir).await?;

        Ok(Self {
            program: "yt-dlp".to_string(),
            download_dir,
            timeout,
            archive: Mutex::new(archive),
        })
    }

    /// Overrides the downloader executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Drops archive entries whose files were removed from the download dir.
    pub async fn prune_archive(&self) -> Result<usize> {
        self.archive.lock().await.prune_missing().await
    }

    fn command(&self, url: &Url) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "--no-playlist",
            "--extract-audio",
            "--audio-format",
            "wav",
            "--format",
            "bestaudio",
            "--quiet",
            "--no-warnings",
            "--no-simulate",
            "--print",
            "after_move:%(id)s|%(filepath)s",
            "--output",
            "%(id)s.%(ext)s",
            "--paths",
        ])
        .arg(&self.download_dir)
        .arg("--")
        .arg(url.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        cmd
    }

    async fn archived(&self, url: &str) -> Option<TrackRef> {
        let mut archive = self.archive.lock().await;
        let entry = archive.lookup(url).cloned()?;
        if tokio::fs::metadata(&entry.file_path).await.is_err() {
            debug!("Archived file for {} is missing, downloading again", url);
            if let Err(e) = archive.forget(url).await {
                warn!("Could not drop stale archive entry for {}: {}", url, e);
            }
            return None;
        }
        Some(TrackRef::new(url, entry.file_id, entry.file_path))
    }

    async fn download(&self, url: &Url) -> Result<TrackRef, FetchError> {
        info!("⬇️ Downloading {}", url);

        // The child is killed when the timed-out future is dropped.
        let output = tokio::time::timeout(self.timeout, self.command(url).output())
            .await
            .map_err(|_| {
                error!("⏰ Download of {} timed out after {}s", url, self.timeout.as_secs());
                FetchError::Timeout(self.timeout)
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(FetchError::ExitStatus {
                status: output.status.to_string(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (file_id, file_path) =
            parse_printed_file(&stdout).ok_or_else(|| FetchError::MissingOutput(url.to_string()))?;
        if tokio::fs::metadata(&file_path).await.is_err() {
            return Err(FetchError::MissingOutput(url.to_string()));
        }

        Ok(TrackRef::new(url.as_str(), file_id, file_path))
    }
}

#[async_trait]
impl TrackFetcher for YtDlpFetcher {
    async fn fetch(&self, url: &str) -> Result<TrackRef, FetchError> {
        let url = validate_url(url)?;

        if let Some(track) = self.archived(url.as_str()).await {
            info!("📦 Already downloaded: {}", url);
            return Ok(track);
        }

        let track = self.download(&url).await?;
        info!("✅ Downloaded {} to {}", url, track.file_path().display());

        let entry = ArchiveEntry {
            file_id: track.file_id().to_string(),
            file_path: track.file_path().to_path_buf(),
            downloaded_at: Utc::now(),
        };
        if let Err(e) = self.archive.lock().await.record(url.as_str(), entry).await {
            warn!("Could not update download archive: {}", e);
        }
        Ok(track)
    }
}

/// Accepts absolute http(s) URLs only.
pub fn validate_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim()).map_err(|_| FetchError::InvalidUrl(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(FetchError::InvalidUrl(raw.to_string())),
    }
}

/// Reads the last `id|path` line printed by the downloader.
fn parse_printed_file(stdout: &str) -> Option<(String, PathBuf)> {
    let line = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    let (id, path) = line.split_once('|')?;
    if id.is_empty() || path.is_empty() {
        return None;
    }
    Some((id.to_string(), PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_http_urls_are_accepted() {
        assert!(validate_url("https://www.youtube.com/watch?v=abc").is_ok());
        assert!(validate_url(" http://youtu.be/abc ").is_ok());
        assert_eq!(
            validate_url("ftp://example.com/a"),
            Err(FetchError::InvalidUrl("ftp://example.com/a".into()))
        );
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn printed_file_uses_last_line() {
        let stdout = "noise\nabc|/tmp/dl/abc.wav\n\n";
        assert_eq!(
            parse_printed_file(stdout),
            Some(("abc".to_string(), PathBuf::from("/tmp/dl/abc.wav")))
        );
        assert_eq!(parse_printed_file(""), None);
        assert_eq!(parse_printed_file("no separator"), None);
    }

    async fn fetcher(dir: &Path, program: &str, timeout: Duration) -> YtDlpFetcher {
        YtDlpFetcher::new(dir.join("downloads"), &dir.join("data"), timeout)
            .await
            .unwrap()
            .with_program(program)
    }

    #[tokio::test]
    async fn archive_hit_skips_the_downloader() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("abc.wav");
        std::fs::write(&file, b"audio").unwrap();

        let fetcher = fetcher(dir.path(), "/nonexistent/yt-dlp", Duration::from_secs(5)).await;
        fetcher
            .archive
            .lock()
            .await
            .record(
                "https://youtu.be/abc",
                ArchiveEntry {
                    file_id: "abc".into(),
                    file_path: file.clone(),
                    downloaded_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let track = fetcher.fetch("https://youtu.be/abc").await.unwrap();

        assert_eq!(track, TrackRef::new("https://youtu.be/abc", "abc", file));
    }

    #[tokio::test]
    async fn archive_entry_for_deleted_file_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path(), "/nonexistent/yt-dlp", Duration::from_secs(5)).await;
        fetcher
            .archive
            .lock()
            .await
            .record(
                "https://youtu.be/gone",
                ArchiveEntry {
                    file_id: "gone".into(),
                    file_path: dir.path().join("gone.wav"),
                    downloaded_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let result = fetcher.fetch("https://youtu.be/gone").await;

        assert!(matches!(result, Err(FetchError::Io(_))));
        assert!(fetcher.archive.lock().await.lookup("https://youtu.be/gone").is_none());
    }

    #[tokio::test]
    async fn missing_downloader_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path(), "/nonexistent/yt-dlp", Duration::from_secs(5)).await;

        let result = fetcher.fetch("https://youtu.be/abc").await;

        assert!(matches!(result, Err(FetchError::Io(_))));
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ytdlp.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_download_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("xyz.wav");
        let program = script(
            dir.path(),
            &format!("touch '{0}'\necho 'xyz|{0}'", target.display()),
        );
        let fetcher = fetcher(dir.path(), &program, Duration::from_secs(5)).await;

        let track = fetcher.fetch("https://youtu.be/xyz").await.unwrap();

        assert_eq!(track.file_id(), "xyz");
        assert_eq!(track.file_path(), target.as_path());
        assert!(fetcher.archive.lock().await.lookup("https://youtu.be/xyz").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "echo 'video unavailable' >&2\nexit 1");
        let fetcher = fetcher(dir.path(), &program, Duration::from_secs(5)).await;

        match fetcher.fetch("https://youtu.be/gone").await {
            Err(FetchError::ExitStatus { stderr, .. }) => assert_eq!(stderr, "video unavailable"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_download_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "sleep 5");
        let fetcher = fetcher(dir.path(), &program, Duration::from_millis(100)).await;

        let result = fetcher.fetch("https://youtu.be/slow").await;

        assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(100))));
    }
}
