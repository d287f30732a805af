//! Daily conversation journal
//!
//! Every completed exchange is appended to a markdown file named after its
//! UTC day (`2026-10-16.md`) under the journal directory.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One exchange as it appears in the journal
#[derive(Debug, Clone)]
pub struct JournalEntry<'a> {
    pub user_message: &'a str,
    pub reply: &'a str,
    pub tools_used: Vec<&'a str>,
}

pub struct Journal {
    dir: PathBuf,
    /// Label for the assistant's lines
    speaker: String,
    /// Serializes appends so a day's header is written exactly once
    lock: Mutex<()>,
}

impl Journal {
    pub fn new(dir: impl Into<PathBuf>, speaker: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            speaker: speaker.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `entry` to the file for `at`'s day, returning that file's path
    pub async fn record(&self, entry: &JournalEntry<'_>, at: DateTime<Utc>) -> std::io::Result<PathBuf> {
        let path = self.dir.join(format!("{}.md", at.format("%Y-%m-%d")));

        let _guard = self.lock.lock().await;
        fs::create_dir_all(&self.dir).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let mut text = String::new();
        if file.metadata().await?.len() == 0 {
            text.push_str(&format!("# Journal - {}\n\n", at.format("%A, %B %d, %Y")));
        }
        text.push_str(&self.render(entry, at));

        file.write_all(text.as_bytes()).await?;
        file.flush().await?;

        Ok(path)
    }

    fn render(&self, entry: &JournalEntry<'_>, at: DateTime<Utc>) -> String {
        let mut text = format!(
            "\n## {}\n\n**User:** {}\n\n**{}:** {}\n",
            at.format("%H:%M"),
            entry.user_message,
            self.speaker,
            entry.reply
        );
        if !entry.tools_used.is_empty() {
            text.push_str(&format!("\n*[Used tool: {}]*\n", entry.tools_used.join(", ")));
        }
        text.push_str("\n---\n");
        text
    }
}
