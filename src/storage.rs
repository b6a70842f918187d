use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

const ARCHIVE_FILE: &str = "download_archive.json";

/// One downloaded source, keyed by its URL in the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub file_id: String,
    pub file_path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
}

/// Persisted record of every URL already fetched, stored as pretty JSON.
pub struct DownloadArchive {
    path: PathBuf,
    entries: HashMap<String, ArchiveEntry>,
}

impl DownloadArchive {
    /// Opens the archive under `data_dir`, creating the directory if needed.
    /// A corrupt archive file is logged and replaced on the next write.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(ARCHIVE_FILE);

        let entries = match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("⚠️ Download archive at {} is unreadable, starting empty: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!("📁 Download archive loaded from {} ({} entries)", path.display(), entries.len());
        Ok(Self { path, entries })
    }

    pub fn lookup(&self, url: &str) -> Option<&ArchiveEntry> {
        self.entries.get(url)
    }

    pub async fn record(&mut self, url: &str, entry: ArchiveEntry) -> Result<()> {
        self.entries.insert(url.to_string(), entry);
        self.save().await
    }

    pub async fn forget(&mut self, url: &str) -> Result<bool> {
        let removed = self.entries.remove(url).is_some();
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Drops entries whose file no longer exists on disk.
    pub async fn prune_missing(&mut self) -> Result<usize> {
        let mut missing = Vec::new();
        for (url, entry) in &self.entries {
            if fs::metadata(&entry.file_path).await.is_err() {
                missing.push(url.clone());
            }
        }

        for url in &missing {
            debug!("🗑️ Archived file for {} is gone", url);
            self.entries.remove(url);
        }
        if !missing.is_empty() {
            self.save().await?;
            info!("🧹 Pruned {} stale archive entries", missing.len());
        }
        Ok(missing.len())
    }

    async fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(dir: &Path, id: &str) -> ArchiveEntry {
        ArchiveEntry {
            file_id: id.to_string(),
            file_path: dir.join(format!("{id}.wav")),
            downloaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let recorded = entry(dir.path(), "abc");

        let mut archive = DownloadArchive::open(dir.path()).await.unwrap();
        assert!(archive.entries.is_empty());
        archive.record("https://youtu.be/abc", recorded.clone()).await.unwrap();

        let reopened = DownloadArchive::open(dir.path()).await.unwrap();
        assert_eq!(reopened.entries.len(), 1);
        assert_eq!(reopened.lookup("https://youtu.be/abc"), Some(&recorded));
    }

    #[tokio::test]
    async fn corrupt_archive_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ARCHIVE_FILE), "{ not json").unwrap();

        let archive = DownloadArchive::open(dir.path()).await.unwrap();

        assert!(archive.entries.is_empty());
    }

    #[tokio::test]
    async fn prune_drops_entries_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let kept = entry(dir.path(), "kept");
        std::fs::write(&kept.file_path, b"audio").unwrap();

        let mut archive = DownloadArchive::open(dir.path()).await.unwrap();
        archive.record("https://youtu.be/kept", kept).await.unwrap();
        archive.record("https://youtu.be/gone", entry(dir.path(), "gone")).await.unwrap();

        assert_eq!(archive.prune_missing().await.unwrap(), 1);
        assert!(archive.lookup("https://youtu.be/kept").is_some());
        assert!(archive.lookup("https://youtu.be/gone").is_none());
    }

    #[tokio::test]
    async fn forget_removes_a_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = DownloadArchive::open(dir.path()).await.unwrap();
        archive.record("https://youtu.be/a", entry(dir.path(), "a")).await.unwrap();

        assert!(archive.forget("https://youtu.be/a").await.unwrap());
        assert!(!archive.forget("https://youtu.be/a").await.unwrap());
        assert!(archive.entries.is_empty());
    }
}
