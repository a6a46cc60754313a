use std::path::PathBuf;
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod crypto;
pub mod db;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::{BackendKind, CacheConfig, Credentials, SyncSettings};
pub use crate::core::{SyncEngine, SyncReport, SyncStatus};
pub use crate::error::{SyncError, SyncResult};

use crate::core::{ChangeLedger, SyncStateStore};
use crate::crypto::kdf::KdfParams;
use crate::crypto::CryptoEngine;
use crate::db::StateBackend;
use crate::storage::{LocalTree, RemoteStore};

/// 同步上下文，在各组件之间共享
///
/// 所有共享状态都通过它显式传递，不使用全局单例。
#[derive(Clone)]
pub struct SyncContext {
    pub settings: Arc<SyncSettings>,
    pub store: Arc<SyncStateStore>,
    pub crypto: Arc<CryptoEngine>,
    pub ledger: Arc<ChangeLedger>,
    pub remote: Arc<dyn RemoteStore>,
    pub local: Arc<dyn LocalTree>,
}

impl SyncContext {
    pub async fn new(
        settings: SyncSettings,
        backend: Arc<dyn StateBackend>,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalTree>,
    ) -> SyncResult<Self> {
        Self::with_kdf_params(settings, backend, remote, local, KdfParams::default()).await
    }

    /// 使用指定的 Argon2 参数（测试中使用低成本参数）
    pub async fn with_kdf_params(
        settings: SyncSettings,
        backend: Arc<dyn StateBackend>,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalTree>,
        params: KdfParams,
    ) -> SyncResult<Self> {
        tracing::debug!("加载同步状态: {}", backend.name());
        let store = Arc::new(
            SyncStateStore::load(backend, settings.excluded_paths.clone()).await?,
        );
        let crypto = Arc::new(CryptoEngine::with_params(
            &settings.encryption_password,
            store.clone(),
            params,
        ));
        let ledger = Arc::new(ChangeLedger::new(store.clone()));

        Ok(Self {
            settings: Arc::new(settings),
            store,
            crypto,
            ledger,
            remote,
            local,
        })
    }
}

/// 配置目录：`$CRYPTSYNC_CONFIG_DIR`，否则为系统配置目录下的 cryptsync
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CRYPTSYNC_CONFIG_DIR").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .map(|p| p.join("cryptsync"))
        .unwrap_or_else(|| PathBuf::from(".cryptsync"))
}

// 平台配置目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
