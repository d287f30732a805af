//! Append-only JSON-lines memory backend
//!
//! Each line holds one complete [`MemoryItem`]. Inserts append a whole line
//! in a single write; deletes rewrite the file through a temporary sibling
//! that is renamed over the original, so readers never see a truncated log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::{matches_needle, BackendKind, MemoryBackend, MemoryError, MemoryItem};

pub struct LogBackend {
    path: PathBuf,
    /// Writers take this exclusively; readers share it
    lock: RwLock<()>,
}

impl LogBackend {
    /// Open the log, creating it and its directory if absent
    pub async fn open(path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            path: path.to_path_buf(),
            lock: RwLock::new(()),
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// All readable items in insertion order. Caller holds the lock.
    async fn read_items(&self) -> Result<Vec<MemoryItem>, MemoryError> {
        let content = fs::read_to_string(&self.path).await?;
        Ok(content.lines().filter_map(parse_line).collect())
    }

    async fn newest_first<F>(&self, limit: usize, keep: F) -> Result<Vec<MemoryItem>, MemoryError>
    where
        F: Fn(&MemoryItem) -> bool,
    {
        let _read = self.lock.read().await;
        let items = self.read_items().await?;
        Ok(items.into_iter().rev().filter(|i| keep(i)).take(limit).collect())
    }
}

fn parse_line(line: &str) -> Option<MemoryItem> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<MemoryItem>(line) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::warn!(error = %e, "skipping unreadable memory log line");
            None
        }
    }
}

#[async_trait]
impl MemoryBackend for LogBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Log
    }

    async fn insert(&self, item: &MemoryItem) -> Result<(), MemoryError> {
        let mut line = serde_json::to_string(item)?;
        line.push('\n');

        let _write = self.lock.write().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(())
    }

    async fn search(&self, needle: &str, limit: usize) -> Result<Vec<MemoryItem>, MemoryError> {
        self.newest_first(limit, |item| matches_needle(item, needle))
            .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<MemoryItem>, MemoryError> {
        self.newest_first(limit, |_| true).await
    }

    async fn delete_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, MemoryError> {
        let _write = self.lock.write().await;
        let content = fs::read_to_string(&self.path).await?;

        let mut removed = 0u64;
        let mut kept = String::with_capacity(content.len());
        for line in content.lines() {
            let doomed = parse_line(line)
                .map(|item| item.created_at >= start && item.created_at < end)
                .unwrap_or(false);
            if doomed {
                removed += 1;
            } else if !line.trim().is_empty() {
                // Unreadable lines survive the rewrite untouched
                kept.push_str(line);
                kept.push('\n');
            }
        }

        if removed == 0 {
            return Ok(0);
        }

        let temp = self.temp_path();
        let mut file = fs::File::create(&temp).await?;
        file.write_all(kept.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, &self.path).await?;

        Ok(removed)
    }
}
