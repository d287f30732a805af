//! SQLite memory backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{
    format_timestamp, parse_timestamp, BackendKind, MemoryBackend, MemoryError, MemoryItem,
};

type MemoryRow = (String, String, String, String);

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `db_path` and make sure the
    /// schema exists. Any failure is reported as `BackendUnavailable`.
    pub async fn probe(db_path: &Path) -> Result<Self, MemoryError> {
        Self::connect(db_path)
            .await
            .map_err(|e| MemoryError::BackendUnavailable(e.to_string()))
    }

    async fn connect(db_path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// In-memory database for tests
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, MemoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_memories_created_at
            ON memories(created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn into_items(rows: Vec<MemoryRow>) -> Result<Vec<MemoryItem>, MemoryError> {
    rows.into_iter()
        .map(|(id, key, value, created_at)| {
            Ok(MemoryItem {
                id,
                key,
                value,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .collect()
}

/// Escape LIKE wildcards so the needle is matched literally
fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for ch in needle.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn insert(&self, item: &MemoryItem) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            INSERT INTO memories (id, key, value, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.key)
        .bind(&item.value)
        .bind(format_timestamp(&item.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn search(&self, needle: &str, limit: usize) -> Result<Vec<MemoryItem>, MemoryError> {
        let pattern = like_pattern(needle);

        // SQLite's LIKE folds ASCII case only, same as the log backend
        let rows: Vec<MemoryRow> = sqlx::query_as(
            r#"
            SELECT id, key, value, created_at
            FROM memories
            WHERE key LIKE ? ESCAPE '\' OR value LIKE ? ESCAPE '\'
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_items(rows)
    }

    async fn list(&self, limit: usize) -> Result<Vec<MemoryItem>, MemoryError> {
        let rows: Vec<MemoryRow> = sqlx::query_as(
            r#"
            SELECT id, key, value, created_at
            FROM memories
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_items(rows)
    }

    async fn delete_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, MemoryError> {
        let result = sqlx::query("DELETE FROM memories WHERE created_at >= ? AND created_at < ?")
            .bind(format_timestamp(&start))
            .bind(format_timestamp(&end))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(id: &str, key: &str, value: &str) -> MemoryItem {
        MemoryItem {
            id: id.into(),
            key: key.into(),
            value: value.into(),
            created_at: Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off"), r"%50\%\_off%");
        assert_eq!(like_pattern(r"a\b"), r"%a\\b%");
    }

    #[tokio::test]
    async fn test_wildcards_match_literally() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.insert(&item("1", "discount", "100% refund")).await.unwrap();
        backend.insert(&item("2", "count", "1000 refunds")).await.unwrap();

        let found = backend.search("0%", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "1");

        let found = backend.search("_", 10).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.insert(&item("same", "a", "b")).await.unwrap();

        let err = backend.insert(&item("same", "c", "d")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Database(_)));
        assert_eq!(backend.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_range_is_half_open() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let mut at_end = item("edge", "k", "v");
        at_end.created_at = Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap();
        backend.insert(&item("inside", "k", "v")).await.unwrap();
        backend.insert(&at_end).await.unwrap();

        let removed = backend
            .delete_created_between(
                Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(removed, 1);
        let left = backend.list(10).await.unwrap();
        assert_eq!(left[0].id, "edge");
    }
}
