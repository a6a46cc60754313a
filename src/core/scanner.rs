//! 本地全量扫描
//!
//! 对比本地文件树与同步记录，找出离线期间的新增、修改和删除。

use super::file_state::SyncStateStore;
use crate::error::SyncResult;
use crate::storage::LocalTree;
use std::collections::HashSet;
use tracing::info;

/// 扫描结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub to_create: Vec<String>,
    pub to_update: Vec<String>,
    pub to_delete: Vec<String>,
}

impl ScanResult {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

pub async fn scan_local_tree(
    local: &dyn LocalTree,
    store: &SyncStateStore,
) -> SyncResult<ScanResult> {
    let tracked = store.get_all_files();
    let mut seen = HashSet::new();
    let mut result = ScanResult::default();

    let mut files = local.list_all_files().await?;
    files.sort();

    for path in files {
        if store.is_excluded(&path) {
            continue;
        }
        if !tracked.contains_key(&path) {
            result.to_create.push(path.clone());
        } else if let Some(stat) = local.stat(&path).await? {
            if store.has_file_changed(&path, &stat) {
                result.to_update.push(path.clone());
            }
        }
        seen.insert(path);
    }

    result.to_delete = tracked
        .keys()
        .filter(|p| !seen.contains(*p) && !store.is_excluded(p))
        .cloned()
        .collect();

    info!(
        "扫描完成 ({}): 新增 {}, 修改 {}, 删除 {}",
        local.name(),
        result.to_create.len(),
        result.to_update.len(),
        result.to_delete.len()
    );
    Ok(result)
}
