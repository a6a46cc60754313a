//! 文件系统监听
//!
//! 把 notify 事件转换为 ChangeLedger 的创建/修改/删除/重命名记录。
//! 引擎自己写入的文件也会触发事件，与同步记录一致的创建/修改会被忽略。

use super::file_state::SyncStateStore;
use super::ledger::ChangeLedger;
use crate::error::{SyncError, SyncResult};
use crate::storage::{LocalStorage, LocalTree};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 仓库目录监听器，drop 时停止监听
pub struct VaultWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl VaultWatcher {
    pub fn start(
        local: Arc<LocalStorage>,
        ledger: Arc<ChangeLedger>,
        store: Arc<SyncStateStore>,
    ) -> SyncResult<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!("文件监听错误: {}", e),
        })
        .map_err(|e| SyncError::Configuration(format!("无法创建文件监听: {}", e)))?;

        watcher
            .watch(local.base_path(), RecursiveMode::Recursive)
            .map_err(|e| SyncError::Configuration(format!("无法监听目录: {}", e)))?;
        info!("开始监听目录: {}", local.base_path().display());

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch_event(&event, &local, &ledger, &store).await;
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for VaultWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 处理单个 notify 事件
pub(crate) async fn dispatch_event(
    event: &Event,
    local: &LocalStorage,
    ledger: &ChangeLedger,
    store: &SyncStateStore,
) {
    let paths: Vec<String> = event
        .paths
        .iter()
        .filter_map(|p| local.relative_path(p))
        .filter(|p| !p.ends_with(".cryptsync-tmp"))
        .collect();

    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // 移入/移出仓库时只有一端在仓库内
            let from = event.paths.first().and_then(|p| local.relative_path(p));
            let to = event.paths.get(1).and_then(|p| local.relative_path(p));
            match (from, to) {
                (Some(from), Some(to)) => {
                    if is_changed_file(local, store, &to).await {
                        ledger.on_rename(&to, &from);
                    } else {
                        ledger.on_delete(&from);
                    }
                }
                (Some(from), None) => ledger.on_delete(&from),
                (None, Some(to)) => {
                    if is_changed_file(local, store, &to).await {
                        ledger.on_create(&to);
                    }
                }
                (None, None) => {}
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            for path in &paths {
                ledger.on_delete(path);
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Create(_) => {
            for path in &paths {
                if is_changed_file(local, store, path).await {
                    ledger.on_create(path);
                }
            }
        }
        EventKind::Modify(_) => {
            for path in &paths {
                if is_changed_file(local, store, path).await {
                    ledger.on_modify(path);
                }
            }
        }
        _ => {}
    }
}

/// 是普通文件且与同步记录不一致
async fn is_changed_file(local: &LocalStorage, store: &SyncStateStore, path: &str) -> bool {
    match local.stat(path).await {
        Ok(Some(stat)) => {
            let changed = store.has_file_changed(path, &stat);
            if !changed {
                debug!("与同步记录一致，忽略事件: {}", path);
            }
            changed
        }
        Ok(None) => false,
        Err(e) => {
            debug!("无法读取文件信息 {}: {}", path, e);
            false
        }
    }
}
