//! 同步错误类型

use thiserror::Error;

/// 同步操作结果
pub type SyncResult<T> = Result<T, SyncError>;

/// 同步过程中可能出现的错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 后端或密码配置缺失/不完整，不重试
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("密钥派生失败: {0}")]
    KeyDerivation(String),

    /// 未设置加密密码，加密模块未初始化
    #[error("加密模块未初始化，请检查加密密码")]
    NotInitialized,

    #[error("加密失败: {0}")]
    Encryption(String),

    /// 认证失败（密钥或 nonce 错误，或数据被篡改）
    #[error("解密失败: {0}")]
    Decryption(String),

    /// 网络层失败（没有 HTTP 状态码）
    #[error("网络错误: {0}")]
    TransientNetwork(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("远程文件不存在: {0}")]
    NotFound(String),

    /// 远程响应无法解析
    #[error("响应解析失败: {0}")]
    Protocol(String),

    #[error("状态持久化失败: {0}")]
    Persistence(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 已有同步在进行中，本次请求被忽略
    #[error("同步正在进行中")]
    AlreadySyncing,

    /// 部分文件同步失败，未完成的变更会在下次同步时重试
    #[error("同步未完成: {failed} 个文件失败")]
    Incomplete { failed: usize, errors: Vec<String> },
}

impl SyncError {
    /// 是否可以重试：无状态码的网络错误，或 500/502/503/504
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::TransientNetwork(_) => true,
            SyncError::Http { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// HTTP 状态码（如果有）
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } => Some(*status),
            SyncError::NotFound(_) => Some(404),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => SyncError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => SyncError::TransientNetwork(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Persistence(e.to_string())
    }
}
