pub mod local;
pub mod retry;
pub mod s3;
pub mod sigv4;
pub mod webdav;

use crate::config::{BackendKind, CacheConfig, SyncSettings};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use local::LocalStorage;
pub use retry::RetryPolicy;
pub use s3::S3Storage;
pub use webdav::WebDavStorage;

// ============ 公共常量 ============

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 30;
/// IO 操作超时（秒）- 上传、下载等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 批量上传的最大并发数
pub const MAX_CONCURRENT_UPLOADS: usize = 5;
/// 不超过该数量的批量上传按顺序执行
pub const SEQUENTIAL_UPLOAD_THRESHOLD: usize = 3;

/// 远程对象信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    /// 远程文件名（不含前缀/基础路径）
    pub name: String,
    /// 修改时间（毫秒）
    pub last_modified: i64,
    pub size: u64,
}

/// 批量上传条目
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub local_path: String,
    pub ciphertext: Vec<u8>,
    pub remote_name: String,
}

/// 本地文件元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// 修改时间（毫秒）
    pub mtime: i64,
    pub size: u64,
}

/// 远程存储接口
///
/// 只存放密文，名称为不透明的远程文件名。
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 检查连接和凭证，必要时创建基础目录/标记对象；失败时返回 false
    async fn test_connection(&self) -> bool;

    /// 列出所有远程对象
    async fn list_files(&self) -> SyncResult<Vec<RemoteObject>>;

    /// 上传密文，`local_path` 仅用于日志
    async fn upload_file(
        &self,
        local_path: &str,
        ciphertext: Vec<u8>,
        remote_name: &str,
    ) -> SyncResult<()>;

    async fn download_file(&self, remote_name: &str) -> SyncResult<Vec<u8>>;

    /// 删除远程对象，对象不存在时视为成功
    async fn delete_file(&self, remote_name: &str) -> SyncResult<()>;

    /// 批量上传
    ///
    /// 少量文件按顺序上传，否则最多 5 个并发。所有上传结束后返回第一个错误。
    /// 同步引擎不走这里：它逐个上传，失败按文件记录。
    async fn upload_files(&self, items: Vec<UploadItem>) -> SyncResult<()> {
        let results: Vec<SyncResult<()>> = if items.len() <= SEQUENTIAL_UPLOAD_THRESHOLD {
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                results.push(
                    self.upload_file(&item.local_path, item.ciphertext, &item.remote_name)
                        .await,
                );
            }
            results
        } else {
            stream::iter(items)
                .map(|item| async move {
                    self.upload_file(&item.local_path, item.ciphertext, &item.remote_name)
                        .await
                })
                .buffer_unordered(MAX_CONCURRENT_UPLOADS)
                .collect()
                .await
        };

        results.into_iter().collect::<SyncResult<Vec<()>>>()?;
        Ok(())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 本地文件树接口（路径为相对于仓库根目录、以 `/` 分隔的字符串）
#[async_trait]
pub trait LocalTree: Send + Sync {
    async fn read_binary(&self, path: &str) -> SyncResult<Vec<u8>>;

    /// 写入文件，自动创建父目录
    async fn write_binary(&self, path: &str, data: &[u8]) -> SyncResult<()>;

    /// 删除文件，不存在时视为成功
    async fn delete(&self, path: &str) -> SyncResult<()>;

    async fn exists(&self, path: &str) -> SyncResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    async fn create_folder(&self, path: &str) -> SyncResult<()>;

    /// 文件元数据；不存在或为目录时返回 None
    async fn stat(&self, path: &str) -> SyncResult<Option<FileStat>>;

    /// 递归列出所有文件
    async fn list_all_files(&self) -> SyncResult<Vec<String>>;

    fn name(&self) -> &str;
}

/// 构造带统一超时的 HTTP 客户端
pub(crate) fn http_client() -> SyncResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(IO_TIMEOUT_SECS))
        .build()
        .map_err(|e| SyncError::Configuration(format!("HTTP 客户端初始化失败: {}", e)))
}

/// 非 2xx 响应转换为错误；404 统一为 `NotFound`
pub(crate) async fn error_for_status(
    resp: reqwest::Response,
    what: &str,
) -> SyncResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(SyncError::NotFound(what.to_string()));
    }

    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(200).collect();
    Err(SyncError::Http {
        status: status.as_u16(),
        message: format!("{}: {}", what, body.trim()),
    })
}

/// 根据配置创建远程存储实例
pub fn create_remote(
    settings: &SyncSettings,
    cache: &CacheConfig,
) -> SyncResult<Arc<dyn RemoteStore>> {
    if settings.endpoint.trim().is_empty() {
        return Err(SyncError::Configuration("远程地址不能为空".to_string()));
    }

    match settings.backend_kind {
        BackendKind::WebDav => {
            tracing::info!(
                "创建WebDAV存储: endpoint={}, base={:?}",
                settings.endpoint,
                settings.bucket_or_base_path
            );
            Ok(Arc::new(WebDavStorage::new(
                &settings.endpoint,
                &settings.credentials.username,
                &settings.credentials.secret,
                settings.bucket_or_base_path.clone(),
            )?) as Arc<dyn RemoteStore>)
        }
        BackendKind::ObjectStore => {
            let bucket = settings
                .bucket_or_base_path
                .as_deref()
                .filter(|b| !b.trim().is_empty())
                .ok_or_else(|| SyncError::Configuration("对象存储需要 bucket".to_string()))?;
            let region = settings.region.as_deref().unwrap_or(s3::DEFAULT_REGION);
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(S3Storage::new(
                &settings.endpoint,
                bucket,
                region,
                &settings.credentials.username,
                &settings.credentials.secret,
                &settings.object_prefix,
                Duration::from_secs(cache.listing_ttl),
            )?) as Arc<dyn RemoteStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 记录上传顺序和最大并发数
    #[derive(Default)]
    struct CountingRemote {
        active: AtomicUsize,
        peak: AtomicUsize,
        uploaded: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl RemoteStore for CountingRemote {
        async fn test_connection(&self) -> bool {
            true
        }

        async fn list_files(&self) -> SyncResult<Vec<RemoteObject>> {
            Ok(Vec::new())
        }

        async fn upload_file(&self, _: &str, _: Vec<u8>, remote_name: &str) -> SyncResult<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_on.as_deref() == Some(remote_name) {
                return Err(SyncError::Http {
                    status: 403,
                    message: "denied".into(),
                });
            }
            self.uploaded.lock().unwrap().push(remote_name.to_string());
            Ok(())
        }

        async fn download_file(&self, name: &str) -> SyncResult<Vec<u8>> {
            Err(SyncError::NotFound(name.to_string()))
        }

        async fn delete_file(&self, _: &str) -> SyncResult<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn items(n: usize) -> Vec<UploadItem> {
        (0..n)
            .map(|i| UploadItem {
                local_path: format!("{}.md", i),
                ciphertext: vec![0u8; 4],
                remote_name: format!("r{}", i),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_small_batch_is_sequential() {
        let remote = CountingRemote::default();
        remote.upload_files(items(3)).await.unwrap();
        assert_eq!(remote.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*remote.uploaded.lock().unwrap(), vec!["r0", "r1", "r2"]);
    }

    #[tokio::test]
    async fn test_large_batch_is_bounded() {
        let remote = CountingRemote::default();
        remote.upload_files(items(12)).await.unwrap();
        let peak = remote.peak.load(Ordering::SeqCst);
        assert!(peak > 1 && peak <= MAX_CONCURRENT_UPLOADS, "peak = {}", peak);
        assert_eq!(remote.uploaded.lock().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_batch_error_after_all_settle() {
        let remote = CountingRemote {
            fail_on: Some("r2".into()),
            ..Default::default()
        };
        let err = remote.upload_files(items(8)).await.unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert_eq!(remote.uploaded.lock().unwrap().len(), 7);
    }

    #[test]
    fn test_create_remote_requires_bucket() {
        let settings = SyncSettings {
            backend_kind: BackendKind::ObjectStore,
            endpoint: "https://s3.example.com".into(),
            ..Default::default()
        };
        let err = create_remote(&settings, &CacheConfig::default()).err().unwrap();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
