//! 应用配置模块

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// 远程后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    WebDav,
    ObjectStore,
}

/// 后端凭证：WebDAV 为用户名/密码，对象存储为 access key/secret key
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// 同步配置
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default)]
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub credentials: Credentials,
    /// 对象存储为 bucket；WebDAV 为可选的基础路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_or_base_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// 对象存储中存放密文的前缀
    #[serde(default = "default_object_prefix")]
    pub object_prefix: String,
    #[serde(default)]
    pub encryption_password: String,
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,
    /// 无法还原原始路径的远程新文件落地目录
    #[serde(default = "default_quarantine_dir")]
    pub quarantine_dir: String,
    #[serde(default)]
    pub auto_sync_enabled: bool,
    #[serde(default = "default_auto_sync_interval")]
    pub auto_sync_interval_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_path: Option<PathBuf>,
}

fn default_object_prefix() -> String {
    "cryptsync/".to_string()
}

fn default_excluded_paths() -> Vec<String> {
    vec![".trash*".to_string()]
}

fn default_quarantine_dir() -> String {
    "cryptsync-incoming".to_string()
}

fn default_auto_sync_interval() -> u64 {
    30 // 默认 30 分钟
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            backend_kind: BackendKind::default(),
            endpoint: String::new(),
            credentials: Credentials::default(),
            bucket_or_base_path: None,
            region: None,
            object_prefix: default_object_prefix(),
            encryption_password: String::new(),
            excluded_paths: default_excluded_paths(),
            quarantine_dir: default_quarantine_dir(),
            auto_sync_enabled: false,
            auto_sync_interval_minutes: default_auto_sync_interval(),
            vault_path: None,
        }
    }
}

impl fmt::Debug for SyncSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSettings")
            .field("backend_kind", &self.backend_kind)
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("bucket_or_base_path", &self.bucket_or_base_path)
            .field("region", &self.region)
            .field("object_prefix", &self.object_prefix)
            .field("encryption_password", &"<redacted>")
            .field("excluded_paths", &self.excluded_paths)
            .field("quarantine_dir", &self.quarantine_dir)
            .field("auto_sync_enabled", &self.auto_sync_enabled)
            .field("auto_sync_interval_minutes", &self.auto_sync_interval_minutes)
            .field("vault_path", &self.vault_path)
            .finish()
    }
}

impl SyncSettings {
    /// 从配置文件加载同步配置
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "sync").unwrap_or_default()
    }

    /// 保存同步配置
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        write_section(config_dir, "sync", self)
    }

    /// 检查后端和密码配置是否完整
    pub fn validate(&self) -> SyncResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(SyncError::Configuration("远程地址不能为空".to_string()));
        }
        if self.credentials.username.is_empty() || self.credentials.secret.is_empty() {
            return Err(SyncError::Configuration("远程凭证不完整".to_string()));
        }
        if self.backend_kind == BackendKind::ObjectStore
            && self
                .bucket_or_base_path
                .as_deref()
                .map_or(true, |b| b.trim().is_empty())
        {
            return Err(SyncError::Configuration("对象存储需要 bucket".to_string()));
        }
        if self.encryption_password.is_empty() {
            return Err(SyncError::Configuration("加密密码不能为空".to_string()));
        }
        Ok(())
    }

    /// 自动同步间隔（None 表示未启用）
    pub fn auto_sync_interval(&self) -> Option<std::time::Duration> {
        if self.auto_sync_enabled && self.auto_sync_interval_minutes > 0 {
            Some(std::time::Duration::from_secs(
                self.auto_sync_interval_minutes * 60,
            ))
        } else {
            None
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// 远程文件列表缓存 TTL（秒），0 表示不缓存
    #[serde(default = "default_listing_ttl")]
    pub listing_ttl: u64,
}

fn default_listing_ttl() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            listing_ttl: default_listing_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn load(config_dir: &Path) -> Self {
        read_section(config_dir, "cache").unwrap_or_default()
    }
}

/// 读取 config.json 中的某个配置段
pub(crate) fn read_section<T: serde::de::DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    let section = config.get(key)?;
    match serde_json::from_value::<T>(section.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("配置段 {} 解析失败，使用默认值: {}", key, e);
            None
        }
    }
}

/// 更新 config.json 中的某个配置段，保留其余内容
pub(crate) fn write_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    let config_file = config_dir.join("config.json");

    // 读取现有配置
    let mut config: serde_json::Value = if config_file.exists() {
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
    } else {
        serde_json::json!({})
    };

    config[key] = serde_json::to_value(value)?;

    fs::create_dir_all(config_dir)?;
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)
}
