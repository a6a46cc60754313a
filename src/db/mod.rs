//! 同步状态持久化后端
//!
//! 状态以单个 JSON 文档的形式保存，后端只负责读写字节。

pub mod sqlite;

pub use sqlite::SqliteBackend;

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// 状态持久化接口
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// 读取已保存的状态，不存在时返回 None
    async fn load(&self) -> SyncResult<Option<Vec<u8>>>;

    /// 覆盖保存状态
    async fn save(&self, data: &[u8]) -> SyncResult<()>;

    fn name(&self) -> &str;
}

/// 内存后端（测试和临时使用）
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Option<Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置状态内容
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(Some(data)),
        }
    }

    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn load(&self) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.snapshot())
    }

    async fn save(&self, data: &[u8]) -> SyncResult<()> {
        *self
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(data.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// JSON 文件后端
///
/// 先写临时文件再重命名，避免写到一半的状态文件。
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateBackend for JsonFileBackend {
    async fn load(&self) -> SyncResult<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Persistence(format!(
                "读取状态文件失败 {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, data: &[u8]) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| SyncError::Persistence(format!("写入临时状态文件失败: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SyncError::Persistence(format!("替换状态文件失败: {}", e)))?;

        debug!("状态已保存: {} ({} 字节)", self.path.display(), data.len());
        Ok(())
    }

    fn name(&self) -> &str {
        "json"
    }
}
