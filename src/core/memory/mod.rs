//! Persistent key/value memory
//!
//! The store keeps user-supplied notes in one of two backends:
//!
//! - **SQLite** (`memory.db`): a single `memories` table, preferred.
//! - **Log** (`memory.jsonl`): an append-only JSON-lines file, used when the
//!   SQLite backend cannot be opened.
//!
//! The backend is chosen once by [`MemoryStore::open`] and never changes for
//! the lifetime of the store. Callers never learn which one is active except
//! through [`MemoryStore::backend_kind`].

mod jsonl;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub use jsonl::LogBackend;
pub use sqlite::SqliteBackend;

/// Default number of results for [`MemoryStore::search`]
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Default (and maximum) number of results for [`MemoryStore::list_all`]
pub const DEFAULT_LIST_LIMIT: usize = 200;

const DATABASE_FILE: &str = "memory.db";
const LOG_FILE: &str = "memory.jsonl";

/// A stored note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of [`MemoryStore::forget_today`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgetOutcome {
    pub removed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Log,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite => f.write_str("sqlite"),
            BackendKind::Log => f.write_str("log"),
        }
    }
}

/// Errors from the memory store
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

/// Storage operations every backend provides.
///
/// Results are most-recent-first. `needle` passed to `search` is already
/// ASCII-lowercased and non-empty.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn insert(&self, item: &MemoryItem) -> Result<(), MemoryError>;

    async fn search(&self, needle: &str, limit: usize) -> Result<Vec<MemoryItem>, MemoryError>;

    async fn list(&self, limit: usize) -> Result<Vec<MemoryItem>, MemoryError>;

    /// Delete items with `start <= created_at < end`, returning how many went
    async fn delete_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, MemoryError>;
}

/// Source of "now" for timestamps and the purge day boundary
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Where each backend keeps its data
#[derive(Debug, Clone)]
pub struct MemoryPaths {
    pub database: PathBuf,
    pub log: PathBuf,
}

impl MemoryPaths {
    /// Standard layout under a data directory
    pub fn under(data_dir: &Path) -> Self {
        Self {
            database: data_dir.join(DATABASE_FILE),
            log: data_dir.join(LOG_FILE),
        }
    }
}

/// Memory store shared by the tool registry and HTTP handlers
pub struct MemoryStore {
    backend: Box<dyn MemoryBackend>,
    clock: Clock,
    /// Timestamp of the newest item; also serializes writers
    last_created: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryStore {
    /// Open the store, probing SQLite first and falling back to the log.
    ///
    /// The fallback happens at most once and is not retried later. Fails only
    /// if neither backend can be opened.
    pub async fn open(paths: &MemoryPaths) -> Result<Self, MemoryError> {
        let backend: Box<dyn MemoryBackend> = match SqliteBackend::probe(&paths.database).await {
            Ok(sqlite) => {
                tracing::info!(path = %paths.database.display(), "memory backend: sqlite");
                Box::new(sqlite)
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    fallback = %paths.log.display(),
                    "SQLite memory backend unavailable, falling back to log"
                );
                let log = LogBackend::open(&paths.log).await?;
                tracing::info!(path = %paths.log.display(), "memory backend: log");
                Box::new(log)
            }
        };

        Self::with_backend(backend).await
    }

    /// Wrap an already-opened backend
    pub async fn with_backend(backend: Box<dyn MemoryBackend>) -> Result<Self, MemoryError> {
        let newest = backend.list(1).await?.into_iter().next().map(|i| i.created_at);
        Ok(Self {
            backend,
            clock: Arc::new(Utc::now),
            last_created: Mutex::new(newest),
        })
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Store a new note. The write is durable when this returns.
    pub async fn save(&self, key: &str, value: &str) -> Result<MemoryItem, MemoryError> {
        let mut last = self.last_created.lock().await;

        let mut created_at = (self.clock)().trunc_subsecs(6);
        if let Some(previous) = *last {
            // A wall clock stepping backwards must not reorder history
            created_at = created_at.max(previous);
        }

        let item = MemoryItem {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            value: value.to_string(),
            created_at,
        };

        self.backend.insert(&item).await?;
        *last = Some(created_at);

        tracing::debug!(id = %item.id, key = %item.key, "memory saved");
        Ok(item)
    }

    /// Case-insensitive substring match on key or value, newest first.
    ///
    /// A blank query matches nothing. Otherwise the query is matched as
    /// given, surrounding whitespace included.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryItem>, MemoryError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        self.backend.search(&query.to_ascii_lowercase(), limit).await
    }

    pub async fn list_all(&self, limit: usize) -> Result<Vec<MemoryItem>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.backend.list(limit).await
    }

    /// Delete everything created on the current UTC calendar day
    pub async fn forget_today(&self) -> Result<ForgetOutcome, MemoryError> {
        let _writer = self.last_created.lock().await;

        let (start, end) = utc_day_bounds((self.clock)());
        let removed = self.backend.delete_created_between(start, end).await?;

        tracing::info!(removed, day = %start.date_naive(), "forgot today's memories");
        Ok(ForgetOutcome { removed })
    }
}

/// `[midnight, next midnight)` of the UTC day containing `now`
fn utc_day_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now);
    (start, start + Duration::days(1))
}

/// Canonical textual timestamp. Fixed width, so it also sorts lexically.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemoryError::CorruptRecord(format!("bad timestamp '{}': {}", raw, e)))
}

/// ASCII case-insensitive containment used by the log backend
pub(crate) fn matches_needle(item: &MemoryItem, needle: &str) -> bool {
    item.key.to_ascii_lowercase().contains(needle)
        || item.value.to_ascii_lowercase().contains(needle)
}
