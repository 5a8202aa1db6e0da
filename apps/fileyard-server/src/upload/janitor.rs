//! Temp Janitor
//!
//! Reclaims abandoned chunk, merged and spooled files from the temp root.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::types::UploadError;

#[derive(Clone)]
pub struct TempJanitor {
    temp_root: PathBuf,
}

impl TempJanitor {
    pub fn new(temp_root: PathBuf) -> Self {
        Self { temp_root }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Delete regular files in the temp root older than `retention`.
    /// Returns how many were removed. Entries that cannot be inspected or
    /// removed are logged and skipped.
    pub async fn sweep(&self, retention: Duration) -> Result<usize, UploadError> {
        let stale = self.stale_files(retention).await?;
        let removed = self.remove_files(stale).await;

        if removed > 0 {
            tracing::info!(removed = removed, "Temp sweep complete");
        }

        Ok(removed)
    }

    /// Regular files in the temp root older than `retention`
    async fn stale_files(&self, retention: Duration) -> Result<Vec<PathBuf>, UploadError> {
        let mut entries = match tokio::fs::read_dir(&self.temp_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut stale = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable temp entry");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let Some(stamp) = metadata.created().or_else(|_| metadata.modified()).ok() else {
                tracing::warn!(path = %path.display(), "Temp entry has no timestamp");
                continue;
            };
            // Timestamps in the future count as age zero
            let age = now.duration_since(stamp).unwrap_or_default();
            if age > retention {
                stale.push(path);
            }
        }

        Ok(stale)
    }

    /// Remove each path, carrying on past failures. Returns how many went.
    async fn remove_files(&self, paths: Vec<PathBuf>) -> usize {
        let mut removed = 0;

        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(path = %path.display(), "Removed stale temp file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale temp file");
                }
            }
        }

        removed
    }

    /// Sweep every `interval` in the background
    pub fn start_sweep_task(self, interval: Duration, retention: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep(retention).await {
                    tracing::error!(error = %e, "Temp sweep failed");
                }
            }
        })
    }
}
