//! File metadata records and their repository

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::upload::UploadError;

/// Canonical metadata for one stored content blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    /// Path of the blob relative to the storage root, `/`-separated
    pub relative_path: String,
    /// Uppercase hex SHA-256 of the content
    pub content_hash: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

/// Lookup/insert/update contract the upload core relies on
#[async_trait::async_trait]
pub trait MetadataRepository: Send + Sync {
    /// Oldest record carrying `content_hash`
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<FileRecord>, UploadError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>, UploadError>;

    /// Any record whose blob lives at `relative_path`
    async fn find_by_path(&self, relative_path: &str) -> Result<Option<FileRecord>, UploadError>;

    async fn insert(&self, record: &FileRecord) -> Result<(), UploadError>;

    /// Repoint every record with `content_hash` at `relative_path`.
    /// Returns the number of rows updated.
    async fn update_path_by_hash(
        &self,
        content_hash: &str,
        relative_path: &str,
    ) -> Result<u64, UploadError>;
}

/// SQLite-backed file repository
#[derive(Clone)]
pub struct SqliteFileRepository {
    pool: SqlitePool,
}

impl SqliteFileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of records carrying `content_hash`
    pub async fn count_by_hash(&self, content_hash: &str) -> Result<i64, UploadError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(UploadError::from)
    }
}

#[async_trait::async_trait]
impl MetadataRepository for SqliteFileRepository {
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<FileRecord>, UploadError> {
        sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, name, relative_path, content_hash, content_type, created_at
            FROM files
            WHERE content_hash = ?
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(UploadError::from)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<FileRecord>, UploadError> {
        sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, name, relative_path, content_hash, content_type, created_at
            FROM files
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(UploadError::from)
    }

    async fn find_by_path(&self, relative_path: &str) -> Result<Option<FileRecord>, UploadError> {
        sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, name, relative_path, content_hash, content_type, created_at
            FROM files
            WHERE relative_path = ?
            LIMIT 1
            "#,
        )
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(UploadError::from)
    }

    async fn insert(&self, record: &FileRecord) -> Result<(), UploadError> {
        sqlx::query(
            r#"
            INSERT INTO files (id, name, relative_path, content_hash, content_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.relative_path)
        .bind(&record.content_hash)
        .bind(&record.content_type)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_path_by_hash(
        &self,
        content_hash: &str,
        relative_path: &str,
    ) -> Result<u64, UploadError> {
        let result = sqlx::query("UPDATE files SET relative_path = ? WHERE content_hash = ?")
            .bind(relative_path)
            .bind(content_hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use chrono::{Duration, SubsecRound};

    fn record(id: &str, hash: &str, path: &str) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            name: format!("{}.txt", id),
            relative_path: path.to_string(),
            content_hash: hash.to_string(),
            content_type: "text/plain".to_string(),
            created_at: Utc::now().trunc_subsecs(3),
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let repo = SqliteFileRepository::new(memory_pool().await);
        let rec = record("a1", "HASH1", "202401/0112/a1.txt");

        repo.insert(&rec).await.unwrap();

        assert_eq!(repo.find_by_id("a1").await.unwrap(), Some(rec.clone()));
        assert_eq!(repo.find_by_hash("HASH1").await.unwrap(), Some(rec));
        assert!(repo.find_by_id("missing").await.unwrap().is_none());
        assert!(repo.find_by_hash("OTHER").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_hash_returns_oldest() {
        let repo = SqliteFileRepository::new(memory_pool().await);
        let mut older = record("old", "H", "p/old.txt");
        older.created_at = Utc::now() - Duration::hours(1);
        let newer = record("new", "H", "p/new.txt");

        repo.insert(&newer).await.unwrap();
        repo.insert(&older).await.unwrap();

        let found = repo.find_by_hash("H").await.unwrap().unwrap();
        assert_eq!(found.id, "old");
        assert_eq!(repo.count_by_hash("H").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_path_by_hash() {
        let repo = SqliteFileRepository::new(memory_pool().await);
        repo.insert(&record("a1", "H", "old/path.txt")).await.unwrap();
        repo.insert(&record("b2", "OTHER", "keep.txt")).await.unwrap();

        let updated = repo.update_path_by_hash("H", "new/path.txt").await.unwrap();
        assert_eq!(updated, 1);

        let rec = repo.find_by_id("a1").await.unwrap().unwrap();
        assert_eq!(rec.relative_path, "new/path.txt");
        assert_eq!(
            repo.find_by_path("new/path.txt").await.unwrap().map(|r| r.id),
            Some("a1".to_string())
        );
        assert!(repo.find_by_path("old/path.txt").await.unwrap().is_none());
        assert_eq!(rec.content_hash, "H");
        assert_eq!(
            repo.find_by_id("b2").await.unwrap().unwrap().relative_path,
            "keep.txt"
        );
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let repo = SqliteFileRepository::new(memory_pool().await);
        repo.insert(&record("a1", "H", "p.txt")).await.unwrap();

        let result = repo.insert(&record("a1", "H2", "q.txt")).await;
        let err = result.unwrap_err();
        assert!(matches!(err, UploadError::Metadata(_)));
        // The driver error stays reachable as the source
        assert!(std::error::Error::source(&err).is_some());
    }
}
