//! 同步状态管理 - 用于增量同步
//!
//! 记录每个已同步文件的远程名称、nonce 和同步时的本地 mtime/size，
//! 以及加密盐和上次同步时间。每次修改后立即持久化。

use crate::crypto::Salt;
use crate::db::StateBackend;
use crate::error::{SyncError, SyncResult};
use crate::storage::FileStat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// 当前状态格式版本
pub const STATE_VERSION: u32 = 1;

/// 已同步文件的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub remote_name: String,
    /// 同步时的本地修改时间（毫秒）
    pub last_modified: i64,
    pub size: u64,
    pub nonce: [u8; 12],
    /// 上次同步时远程列表中的修改时间（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_modified: Option<i64>,
}

impl FileRecord {
    /// 判断远程版本是否比记录更新
    pub fn remote_is_newer(&self, remote_last_modified: i64) -> bool {
        remote_last_modified > self.remote_modified.unwrap_or(self.last_modified)
    }
}

/// 持久化的同步状态
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<Salt>,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<i64>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            salt: None,
            files: BTreeMap::new(),
            last_sync_time: None,
        }
    }
}

/// 升级旧版本状态；比当前版本新的状态直接拒绝
fn migrate(mut state: SyncState) -> SyncResult<SyncState> {
    if state.version > STATE_VERSION {
        return Err(SyncError::Persistence(format!(
            "状态版本 {} 高于支持的版本 {}",
            state.version, STATE_VERSION
        )));
    }
    if state.version < STATE_VERSION {
        // v0 与 v1 字段相同，只是缺少 version
        info!("迁移同步状态: v{} -> v{}", state.version, STATE_VERSION);
        state.version = STATE_VERSION;
    }
    Ok(state)
}

/// 排除规则：以 `*` 结尾为前缀匹配，否则完全匹配
fn matches_pattern(path: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => path == pattern,
    }
}

/// 同步状态存储
pub struct SyncStateStore {
    backend: Arc<dyn StateBackend>,
    state: RwLock<SyncState>,
    /// 串行化保存，保证落盘顺序与修改顺序一致
    save_lock: tokio::sync::Mutex<()>,
    excluded_paths: Vec<String>,
}

impl SyncStateStore {
    /// 从后端加载状态；没有已保存状态时使用空状态
    ///
    /// 损坏的状态返回错误，不会被静默丢弃。
    pub async fn load(
        backend: Arc<dyn StateBackend>,
        excluded_paths: Vec<String>,
    ) -> SyncResult<Self> {
        let state = match backend.load().await? {
            Some(data) => {
                let state: SyncState = serde_json::from_slice(&data).map_err(|e| {
                    SyncError::Persistence(format!("同步状态已损坏 ({}): {}", backend.name(), e))
                })?;
                let state = migrate(state)?;
                info!(
                    "加载同步状态: {} 个文件记录 ({})",
                    state.files.len(),
                    backend.name()
                );
                state
            }
            None => {
                debug!("没有已保存的同步状态，使用空状态");
                SyncState::default()
            }
        };

        Ok(Self {
            backend,
            state: RwLock::new(state),
            save_lock: tokio::sync::Mutex::new(()),
            excluded_paths,
        })
    }

    fn read<T>(&self, f: impl FnOnce(&SyncState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// 修改状态并立即持久化
    async fn mutate(&self, f: impl FnOnce(&mut SyncState)) -> SyncResult<()> {
        let _guard = self.save_lock.lock().await;
        let data = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut state);
            serde_json::to_vec_pretty(&*state)?
        };
        self.backend.save(&data).await
    }

    /// 将当前状态写入后端
    pub async fn save(&self) -> SyncResult<()> {
        self.mutate(|_| {}).await
    }

    /// 当前状态快照
    pub fn snapshot(&self) -> SyncState {
        self.read(|s| s.clone())
    }

    pub fn get_salt(&self) -> Option<Salt> {
        self.read(|s| s.salt)
    }

    pub async fn store_salt(&self, salt: Salt) -> SyncResult<()> {
        self.mutate(|s| s.salt = Some(salt)).await
    }

    pub fn get_file_record(&self, path: &str) -> Option<FileRecord> {
        self.read(|s| s.files.get(path).cloned())
    }

    pub async fn store_file_record(&self, path: &str, record: FileRecord) -> SyncResult<()> {
        self.mutate(|s| {
            s.files.insert(path.to_string(), record);
        })
        .await
    }

    pub async fn remove_file_record(&self, path: &str) -> SyncResult<()> {
        self.mutate(|s| {
            s.files.remove(path);
        })
        .await
    }

    /// 所有文件记录的副本
    pub fn get_all_files(&self) -> BTreeMap<String, FileRecord> {
        self.read(|s| s.files.clone())
    }

    /// 根据远程名称反查本地路径
    pub fn find_path_by_remote_name(&self, remote_name: &str) -> Option<String> {
        self.read(|s| {
            s.files
                .iter()
                .find(|(_, r)| r.remote_name == remote_name)
                .map(|(p, _)| p.clone())
        })
    }

    pub fn get_last_sync_time(&self) -> Option<i64> {
        self.read(|s| s.last_sync_time)
    }

    pub async fn update_last_sync_time(&self) -> SyncResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.mutate(|s| s.last_sync_time = Some(now)).await
    }

    /// 清空文件记录和上次同步时间，保留盐
    pub async fn reset_state(&self) -> SyncResult<()> {
        warn!("重置同步状态（保留加密盐）");
        self.mutate(|s| {
            let salt = s.salt;
            *s = SyncState {
                salt,
                ..SyncState::default()
            };
        })
        .await
    }

    /// 路径是否被排除
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths
            .iter()
            .any(|pattern| matches_pattern(path, pattern))
    }

    /// 与同步记录相比文件是否变化；没有记录时视为已变化
    pub fn has_file_changed(&self, path: &str, stat: &FileStat) -> bool {
        match self.get_file_record(path) {
            Some(record) => record.last_modified != stat.mtime || record.size != stat.size,
            None => true,
        }
    }
}
