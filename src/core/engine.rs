//! 对账引擎
//!
//! 一轮同步分两个阶段，顺序不能调换：
//! 1. 本地 -> 远程：处理待同步变更的快照（上传/删除）
//! 2. 远程 -> 本地：列出远程对象，与同步记录对比（下载/本地删除/导入新文件）
//!
//! 有本地待处理变更的路径在第二阶段不会被覆盖或删除。

use super::file_state::FileRecord;
use super::ledger::{ChangeKind, PendingChange};
use super::scanner::{scan_local_tree, ScanResult};
use crate::crypto::seal_blob;
use crate::error::{SyncError, SyncResult};
use crate::storage::RemoteObject;
use crate::SyncContext;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// 同步状态
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Completed,
    Failed,
}

/// 同步报告
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub start_time: i64,
    pub end_time: i64,
    pub status: SyncStatus,
    pub files_uploaded: u32,
    pub files_deleted_remote: u32,
    pub files_downloaded: u32,
    pub files_deleted_local: u32,
    /// 无法还原路径、导入到隔离目录的远程新文件
    pub files_imported: u32,
    pub files_skipped: u32,
    pub files_failed: u32,
    pub bytes_transferred: u64,
    /// 耗时（毫秒）
    pub duration: u64,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn started() -> Self {
        Self {
            start_time: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    fn record_failure(&mut self, path: &str, err: &SyncError) {
        error!("同步文件失败 {}: {}", path, err);
        self.files_failed += 1;
        self.errors.push(format!("{}: {}", path, err));
    }

    fn finish(&mut self, started: Instant) {
        self.end_time = chrono::Utc::now().timestamp_millis();
        self.duration = started.elapsed().as_millis() as u64;
        self.status = if self.files_failed > 0 {
            SyncStatus::Failed
        } else {
            SyncStatus::Completed
        };
    }

    /// 本轮是否没有任何网络写入或本地落地
    pub fn is_noop(&self) -> bool {
        self.files_uploaded == 0
            && self.files_deleted_remote == 0
            && self.files_downloaded == 0
            && self.files_deleted_local == 0
            && self.files_imported == 0
    }
}

/// 上传阶段单个文件的结果
enum PushOutcome {
    Uploaded,
    Skipped,
}

/// 同步引擎
pub struct SyncEngine {
    ctx: SyncContext,
    syncing: Arc<AtomicBool>,
    last_report: Mutex<Option<SyncReport>>,
}

impl SyncEngine {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            syncing: Arc::new(AtomicBool::new(false)),
            last_report: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn test_connection(&self) -> bool {
        self.ctx.remote.test_connection().await
    }

    /// 全量扫描本地，把离线期间的变更并入待同步记录
    pub async fn rescan(&self) -> SyncResult<ScanResult> {
        let result = scan_local_tree(self.ctx.local.as_ref(), &self.ctx.store).await?;
        self.ctx.ledger.apply_scan(&result);
        Ok(result)
    }

    /// 重置同步状态（保留盐），同步进行中时拒绝
    pub async fn reset_state(&self) -> SyncResult<()> {
        if self.is_syncing() {
            return Err(SyncError::AlreadySyncing);
        }
        self.ctx.store.reset_state().await
    }

    /// 执行一轮同步
    ///
    /// 已有同步在进行时立即返回 `AlreadySyncing`。
    /// 有文件失败时返回 `Incomplete`，失败的变更保留到下一轮。
    pub async fn perform_sync(&self) -> SyncResult<SyncReport> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            warn!("同步正在进行中，忽略本次请求");
            return Err(SyncError::AlreadySyncing);
        }
        let _guard = scopeguard::guard(self.syncing.clone(), |flag| {
            flag.store(false, Ordering::SeqCst);
        });

        let started = Instant::now();
        let mut report = SyncReport::started();
        info!(
            "开始同步: {} <-> {}",
            self.ctx.local.name(),
            self.ctx.remote.name()
        );

        if let Err(e) = self.ctx.crypto.ensure_ready().await {
            error!("加密模块初始化失败: {}", e);
            return Err(e);
        }

        // 阶段 1: 本地 -> 远程
        let snapshot = self.ctx.ledger.get_pending_changes();
        let (processed, uploaded) = self.push_local_changes(&snapshot, &mut report).await;

        // 阶段 2: 远程 -> 本地
        let remote_objects = match self.ctx.remote.list_files().await {
            Ok(objects) => objects,
            Err(e) => {
                error!("获取远程文件列表失败: {}", e);
                return Err(e);
            }
        };
        self.pull_remote_changes(&remote_objects, &uploaded, &mut report)
            .await;

        // 阶段 3: 记录同步时间，确认已处理的变更
        self.ctx.store.update_last_sync_time().await?;
        for (path, change) in &processed {
            self.ctx.ledger.acknowledge(path, change);
        }

        report.finish(started);
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());

        if report.files_failed > 0 {
            warn!(
                "同步未完成: {} 个文件失败，{} 个变更待重试",
                report.files_failed,
                self.ctx.ledger.len()
            );
            return Err(SyncError::Incomplete {
                failed: report.files_failed as usize,
                errors: report.errors.clone(),
            });
        }

        info!(
            "同步完成: 上传 {}, 远程删除 {}, 下载 {}, 本地删除 {}, 导入 {}, 跳过 {} ({}ms)",
            report.files_uploaded,
            report.files_deleted_remote,
            report.files_downloaded,
            report.files_deleted_local,
            report.files_imported,
            report.files_skipped,
            report.duration
        );
        Ok(report)
    }

    /// 按路径顺序处理快照中的变更，单个文件失败不影响其他文件
    ///
    /// 返回成功处理的变更（用于最后确认）和本轮实际上传的路径。
    async fn push_local_changes(
        &self,
        snapshot: &std::collections::BTreeMap<String, PendingChange>,
        report: &mut SyncReport,
    ) -> (Vec<(String, PendingChange)>, HashSet<String>) {
        let mut processed = Vec::with_capacity(snapshot.len());
        let mut uploaded = HashSet::new();

        for (path, change) in snapshot {
            let result = match change.kind {
                ChangeKind::Create | ChangeKind::Modify => {
                    let outcome = self.push_file(path, report).await;
                    outcome.map(|outcome| match outcome {
                        PushOutcome::Uploaded => {
                            report.files_uploaded += 1;
                            uploaded.insert(path.clone());
                        }
                        PushOutcome::Skipped => report.files_skipped += 1,
                    })
                }
                ChangeKind::Delete => self.delete_remote(path, report).await,
            };

            match result {
                Ok(()) => processed.push((path.clone(), *change)),
                Err(e) => report.record_failure(path, &e),
            }
        }

        (processed, uploaded)
    }

    async fn push_file(&self, path: &str, report: &mut SyncReport) -> SyncResult<PushOutcome> {
        let Some(stat) = self.ctx.local.stat(path).await? else {
            debug!("文件已不存在，跳过上传: {}", path);
            return Ok(PushOutcome::Skipped);
        };

        let existing = self.ctx.store.get_file_record(path);
        if existing.is_some() && !self.ctx.store.has_file_changed(path, &stat) {
            // 与记录一致（例如刚下载的文件触发的事件）
            debug!("文件未变化，跳过上传: {}", path);
            return Ok(PushOutcome::Skipped);
        }

        let data = self.ctx.local.read_binary(path).await?;
        let encrypted = self.ctx.crypto.encrypt_file(&data, path).await?;

        // 已跟踪的路径沿用原远程名称
        let remote_name = existing
            .map(|r| r.remote_name)
            .unwrap_or(encrypted.remote_name);
        let blob = seal_blob(&encrypted.nonce, &encrypted.ciphertext);
        let bytes = blob.len() as u64;

        self.ctx
            .remote
            .upload_file(path, blob, &remote_name)
            .await?;
        self.ctx
            .store
            .store_file_record(
                path,
                FileRecord {
                    remote_name,
                    last_modified: stat.mtime,
                    size: stat.size,
                    nonce: encrypted.nonce,
                    remote_modified: None,
                },
            )
            .await?;

        report.bytes_transferred += bytes;
        info!("已上传: {} ({} 字节)", path, bytes);
        Ok(PushOutcome::Uploaded)
    }

    async fn delete_remote(&self, path: &str, report: &mut SyncReport) -> SyncResult<()> {
        let Some(record) = self.ctx.store.get_file_record(path) else {
            debug!("未跟踪的文件，无需删除远程: {}", path);
            report.files_skipped += 1;
            return Ok(());
        };

        self.ctx.remote.delete_file(&record.remote_name).await?;
        self.ctx.store.remove_file_record(path).await?;
        report.files_deleted_remote += 1;
        info!("已删除远程文件: {}", path);
        Ok(())
    }

    async fn pull_remote_changes(
        &self,
        remote_objects: &[RemoteObject],
        uploaded: &HashSet<String>,
        report: &mut SyncReport,
    ) {
        let by_name: HashMap<&str, &RemoteObject> = remote_objects
            .iter()
            .map(|o| (o.name.as_str(), o))
            .collect();

        let records = self.ctx.store.get_all_files();
        let matched: HashSet<&str> = records.values().map(|r| r.remote_name.as_str()).collect();

        for (path, record) in &records {
            let pending = self.ctx.ledger.is_pending(path);
            let result = match by_name.get(record.remote_name.as_str()) {
                // 本地优先：有待处理变更时不下载。
                // 只有本轮真正上传过的路径才记录远程时间戳，跳过的路径留到下一轮比较
                Some(obj) if pending => {
                    if uploaded.contains(path.as_str()) {
                        self.note_remote_modified(path, record, obj).await
                    } else {
                        Ok(())
                    }
                }
                Some(obj) if record.remote_is_newer(obj.last_modified) => {
                    let downloaded = self.download_into(path, obj, report).await;
                    if downloaded.is_ok() {
                        report.files_downloaded += 1;
                        info!("已下载: {}", path);
                    }
                    downloaded
                }
                Some(obj) => self.note_remote_modified(path, record, obj).await,
                None if pending => Ok(()),
                None => self.apply_remote_deletion(path, report).await,
            };

            if let Err(e) = result {
                report.record_failure(path, &e);
            }
        }

        // 没有记录对应的远程对象：新文件，落地到隔离目录
        for obj in remote_objects {
            if matched.contains(obj.name.as_str()) {
                continue;
            }
            let path = self.quarantine_path(&obj.name);
            if self.ctx.ledger.is_pending(&path) {
                continue;
            }
            let imported = self.download_into(&path, obj, report).await;
            match imported {
                Ok(()) => {
                    report.files_imported += 1;
                    info!("导入远程新文件: {}", path);
                }
                Err(e) => report.record_failure(&path, &e),
            }
        }
    }

    fn quarantine_path(&self, remote_name: &str) -> String {
        format!(
            "{}/{}",
            self.ctx.settings.quarantine_dir.trim_end_matches('/'),
            remote_name
        )
    }

    /// 记录观察到的远程修改时间，保证下一轮不会重复下载
    async fn note_remote_modified(
        &self,
        path: &str,
        record: &FileRecord,
        obj: &RemoteObject,
    ) -> SyncResult<()> {
        if record.remote_modified == Some(obj.last_modified) {
            return Ok(());
        }
        // 读取最新记录，避免覆盖本轮刚写入的 nonce/mtime
        let Some(current) = self.ctx.store.get_file_record(path) else {
            return Ok(());
        };
        self.ctx
            .store
            .store_file_record(
                path,
                FileRecord {
                    remote_modified: Some(obj.last_modified),
                    ..current
                },
            )
            .await
    }

    /// 下载、解密并写入本地，然后刷新记录
    async fn download_into(
        &self,
        path: &str,
        obj: &RemoteObject,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let blob = self.ctx.remote.download_file(&obj.name).await?;
        let (plaintext, nonce) = self.ctx.crypto.open_blob(&blob).await?;

        if let Some((parent, _)) = path.rsplit_once('/') {
            self.ctx.local.create_folder(parent).await?;
        }
        self.ctx.local.write_binary(path, &plaintext).await?;

        let stat = self.ctx.local.stat(path).await?.ok_or_else(|| {
            SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("写入后找不到文件: {}", path),
            ))
        })?;

        self.ctx
            .store
            .store_file_record(
                path,
                FileRecord {
                    remote_name: obj.name.clone(),
                    last_modified: stat.mtime,
                    size: stat.size,
                    nonce,
                    remote_modified: Some(obj.last_modified),
                },
            )
            .await?;

        report.bytes_transferred += blob.len() as u64;
        Ok(())
    }

    /// 远程已删除：删除本地文件并移除记录
    async fn apply_remote_deletion(&self, path: &str, report: &mut SyncReport) -> SyncResult<()> {
        if self.ctx.local.exists(path).await? {
            self.ctx.local.delete(path).await?;
        }
        self.ctx.store.remove_file_record(path).await?;
        report.files_deleted_local += 1;
        info!("远程已删除，删除本地文件: {}", path);
        Ok(())
    }
}

/// 启动定时自动同步；第一次触发在一个周期之后
pub fn spawn_auto_sync(engine: Arc<SyncEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(interval);

        info!("自动同步已启动，间隔 {:?}", period);
        while ticks.next().await.is_some() {
            match engine.perform_sync().await {
                Ok(report) => debug!("自动同步完成 ({}ms)", report.duration),
                Err(SyncError::AlreadySyncing) => debug!("上一次同步尚未结束，跳过本次自动同步"),
                Err(e) => warn!("自动同步失败: {}", e),
            }
        }
    })
}
