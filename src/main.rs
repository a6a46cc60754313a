use anyhow::Context;
use cryptsync_lib::config::{CacheConfig, SyncSettings};
use cryptsync_lib::core::{spawn_auto_sync, VaultWatcher};
use cryptsync_lib::db::JsonFileBackend;
use cryptsync_lib::logging::init_logging;
use cryptsync_lib::storage::{create_remote, LocalStorage, LocalTree};
use cryptsync_lib::{config_dir, SyncContext, SyncEngine, SyncError};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let once = std::env::args().skip(1).any(|a| a == "--once");

    let config_dir = config_dir();
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("无法创建配置目录 {}", config_dir.display()))?;
    let _log_guard = init_logging(&config_dir);

    let settings = SyncSettings::load(&config_dir);
    settings.validate()?;
    let vault = settings
        .vault_path
        .clone()
        .context("未配置 vaultPath")?;

    let remote = create_remote(&settings, &CacheConfig::load(&config_dir))?;
    let local = Arc::new(LocalStorage::new(&vault)?);
    let backend = Arc::new(JsonFileBackend::new(config_dir.join("state.json")));
    let auto_sync = settings.auto_sync_interval();

    let ctx = SyncContext::new(settings, backend, remote, local.clone() as Arc<dyn LocalTree>).await?;
    let engine = Arc::new(SyncEngine::new(ctx.clone()));

    if !engine.test_connection().await {
        anyhow::bail!("无法连接远程存储 {}", ctx.remote.name());
    }

    let scan = engine.rescan().await?;
    tracing::info!(
        "启动扫描: 新增 {}, 修改 {}, 删除 {}",
        scan.to_create.len(),
        scan.to_update.len(),
        scan.to_delete.len()
    );

    match engine.perform_sync().await {
        Ok(_) => {}
        Err(e @ SyncError::Incomplete { .. }) if !once => tracing::warn!("{}", e),
        Err(e) => return Err(e.into()),
    }
    if once {
        return Ok(());
    }

    let _watcher = VaultWatcher::start(local, ctx.ledger.clone(), ctx.store.clone())?;
    let auto = auto_sync.map(|period| spawn_auto_sync(engine.clone(), period));

    tokio::signal::ctrl_c().await?;
    tracing::info!("收到退出信号，正在停止...");
    if let Some(handle) = auto {
        handle.abort();
    }
    Ok(())
}
