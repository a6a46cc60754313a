//! SQLite 状态后端

use super::StateBackend;
use crate::error::SyncResult;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

const STATE_KEY: &str = "sync_state";

/// 将状态文档保存在 `kv_state` 表中
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// 打开（必要时创建）数据库文件
    pub async fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        info!("状态数据库: {}", path.display());
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> SyncResult<Self> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS kv_state (
                   key TEXT PRIMARY KEY,
                   value BLOB NOT NULL,
                   updated_at INTEGER NOT NULL
               )"#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    async fn load(&self) -> SyncResult<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_state WHERE key = ?")
            .bind(STATE_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn save(&self, data: &[u8]) -> SyncResult<()> {
        sqlx::query(
            r#"INSERT INTO kv_state (key, value, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at"#,
        )
        .bind(STATE_KEY)
        .bind(data)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let backend = SqliteBackend::open(&path).await.unwrap();
        assert!(backend.load().await.unwrap().is_none());
        backend.save(b"first").await.unwrap();
        backend.save(b"second").await.unwrap();
        assert_eq!(backend.load().await.unwrap().unwrap(), b"second");
        drop(backend);

        // 重新打开后数据仍在
        let backend = SqliteBackend::open(&path).await.unwrap();
        assert_eq!(backend.load().await.unwrap().unwrap(), b"second");
    }
}
