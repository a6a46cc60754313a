//! 本地变更记录
//!
//! 合并自上次成功同步以来的本地创建/修改/删除/重命名事件。
//! 同步过程只处理快照，事件回调可以在同步进行中继续写入。

use super::file_state::SyncStateStore;
use super::scanner::ScanResult;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

/// 待同步的变更
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChange {
    pub kind: ChangeKind,
    /// 记录序号，用于判断同步期间是否又有新事件
    pub seq: u64,
}

pub struct ChangeLedger {
    store: Arc<SyncStateStore>,
    pending: Mutex<BTreeMap<String, PendingChange>>,
    next_seq: AtomicU64,
}

impl ChangeLedger {
    pub fn new(store: Arc<SyncStateStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, PendingChange>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, pending: &mut BTreeMap<String, PendingChange>, path: &str, kind: ChangeKind) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        pending.insert(path.to_string(), PendingChange { kind, seq });
    }

    pub fn on_create(&self, path: &str) {
        if self.store.is_excluded(path) {
            debug!("已排除，忽略创建: {}", path);
            return;
        }
        debug!("文件创建: {}", path);
        let mut pending = self.lock();
        self.record(&mut pending, path, ChangeKind::Create);
    }

    /// 已标记为创建的路径不会降级为修改
    pub fn on_modify(&self, path: &str) {
        if self.store.is_excluded(path) {
            debug!("已排除，忽略修改: {}", path);
            return;
        }
        debug!("文件修改: {}", path);
        let mut pending = self.lock();
        let kind = match pending.get(path) {
            Some(change) if change.kind == ChangeKind::Create => ChangeKind::Create,
            _ => ChangeKind::Modify,
        };
        self.record(&mut pending, path, kind);
    }

    /// 未跟踪的路径只移除待处理项，不记录删除
    pub fn on_delete(&self, path: &str) {
        if self.store.is_excluded(path) {
            debug!("已排除，忽略删除: {}", path);
            return;
        }
        debug!("文件删除: {}", path);
        let tracked = self.store.get_file_record(path).is_some();
        let mut pending = self.lock();
        if tracked {
            self.record(&mut pending, path, ChangeKind::Delete);
        } else {
            pending.remove(path);
        }
    }

    /// 重命名 = 删除旧路径 + 创建新路径
    pub fn on_rename(&self, path: &str, old_path: &str) {
        let old_excluded = self.store.is_excluded(old_path);
        let new_excluded = self.store.is_excluded(path);
        if old_excluded && new_excluded {
            debug!("新旧路径均已排除，忽略重命名: {} -> {}", old_path, path);
            return;
        }

        debug!("文件重命名: {} -> {}", old_path, path);
        if !old_excluded {
            self.on_delete(old_path);
        }
        if !new_excluded {
            self.on_create(path);
        }
    }

    /// 合并一次全量扫描的结果
    pub fn apply_scan(&self, scan: &ScanResult) {
        for path in &scan.to_create {
            self.on_create(path);
        }
        for path in &scan.to_update {
            self.on_modify(path);
        }
        for path in &scan.to_delete {
            self.on_delete(path);
        }
    }

    /// 当前待处理变更的快照
    pub fn get_pending_changes(&self) -> BTreeMap<String, PendingChange> {
        self.lock().clone()
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 确认已处理的变更；同步期间被重新记录的不会被移除
    pub fn acknowledge(&self, path: &str, change: &PendingChange) -> bool {
        let mut pending = self.lock();
        match pending.get(path) {
            Some(current) if current.seq == change.seq => {
                pending.remove(path);
                true
            }
            _ => false,
        }
    }

    pub fn clear_pending_changes(&self) {
        self.lock().clear();
    }
}
