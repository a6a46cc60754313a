//! 加密模块
//!
//! 密钥由用户密码经 Argon2id 派生，盐保存在同步状态中。
//! 文件内容使用 AES-256-GCM 加密，每次加密生成新的 12 字节 nonce。
//! 远程文件名为原始相对路径的 SHA-256 十六进制摘要。

pub mod kdf;

pub use kdf::{derive_key, generate_salt, EncryptionKey, KdfParams, Salt};

use crate::core::file_state::SyncStateStore;
use crate::error::{SyncError, SyncResult};
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const NONCE_LEN: usize = 12;
/// GCM 认证标签长度
pub const TAG_LEN: usize = 16;

/// 远程对象的最小长度：nonce + 空明文的认证标签
pub const MIN_BLOB_LEN: usize = NONCE_LEN + TAG_LEN;

/// 加密后的文件
#[derive(Debug, Clone)]
pub struct EncryptedFile {
    pub ciphertext: Vec<u8>,
    pub remote_name: String,
    pub nonce: [u8; NONCE_LEN],
}

/// 加密模块状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoState {
    Uninitialized,
    Initializing,
    Ready,
}

/// 根据相对路径计算远程文件名
pub fn remote_name_for(path: &str) -> String {
    hex::encode(Sha256::digest(path.as_bytes()))
}

/// 组装远程对象：nonce ‖ 密文（含认证标签）
pub fn seal_blob(nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(nonce);
    blob.extend_from_slice(ciphertext);
    blob
}

/// 拆分远程对象为 nonce 和密文
pub fn split_blob(blob: &[u8]) -> SyncResult<([u8; NONCE_LEN], &[u8])> {
    if blob.len() < MIN_BLOB_LEN {
        return Err(SyncError::Decryption(format!(
            "远程对象过短: {} 字节",
            blob.len()
        )));
    }
    let (head, ciphertext) = blob.split_at(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(head);
    Ok((nonce, ciphertext))
}

/// 加密引擎
///
/// 首次加密/解密时惰性派生密钥，之后在进程生命周期内复用。
pub struct CryptoEngine {
    password: Zeroizing<String>,
    params: KdfParams,
    store: Arc<SyncStateStore>,
    key: RwLock<Option<Arc<EncryptionKey>>>,
    init_lock: tokio::sync::Mutex<()>,
    initializing: AtomicBool,
}

impl CryptoEngine {
    pub fn new(password: &str, store: Arc<SyncStateStore>) -> Self {
        Self::with_params(password, store, KdfParams::default())
    }

    pub fn with_params(password: &str, store: Arc<SyncStateStore>, params: KdfParams) -> Self {
        Self {
            password: Zeroizing::new(password.to_string()),
            params,
            store,
            key: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            initializing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CryptoState {
        if self.current_key().is_some() {
            CryptoState::Ready
        } else if self.initializing.load(Ordering::SeqCst) {
            CryptoState::Initializing
        } else {
            CryptoState::Uninitialized
        }
    }

    fn current_key(&self) -> Option<Arc<EncryptionKey>> {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 派生密钥
    ///
    /// 密码为空时保持未初始化状态（仅记录警告）。
    /// 状态中没有盐时生成新盐并持久化，之后不再更换。
    pub async fn initialize(&self) -> SyncResult<()> {
        let _guard = self.init_lock.lock().await;

        if self.password.is_empty() {
            warn!("未设置加密密码，加密模块保持未初始化");
            *self.key.write().unwrap_or_else(PoisonError::into_inner) = None;
            return Ok(());
        }

        self.initializing.store(true, Ordering::SeqCst);
        let _reset = scopeguard::guard(&self.initializing, |flag| {
            flag.store(false, Ordering::SeqCst);
        });

        let stored_salt = self.store.get_salt();
        let password = self.password.clone();
        let params = self.params.clone();

        let (key, salt) = tokio::task::spawn_blocking(move || {
            derive_key(password.as_bytes(), stored_salt, &params)
        })
        .await
        .map_err(|e| SyncError::KeyDerivation(format!("派生任务异常: {}", e)))??;

        if stored_salt.is_none() {
            info!("首次初始化加密，生成新盐");
            self.store.store_salt(salt).await?;
        }

        *self.key.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(key));
        info!("加密密钥已就绪");
        Ok(())
    }

    /// 确保密钥可用，必要时触发派生
    pub async fn ensure_ready(&self) -> SyncResult<Arc<EncryptionKey>> {
        if let Some(key) = self.current_key() {
            return Ok(key);
        }
        self.initialize().await?;
        self.current_key().ok_or(SyncError::NotInitialized)
    }

    pub fn get_encrypted_name(&self, path: &str) -> String {
        remote_name_for(path)
    }

    /// 加密文件内容，返回密文、远程文件名和 nonce
    pub async fn encrypt_file(&self, data: &[u8], path: &str) -> SyncResult<EncryptedFile> {
        let key = self.ensure_ready().await?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = key
            .cipher()
            .encrypt(&nonce, data)
            .map_err(|e| SyncError::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce.as_slice());

        Ok(EncryptedFile {
            ciphertext,
            remote_name: remote_name_for(path),
            nonce: nonce_bytes,
        })
    }

    /// 解密文件内容；密钥或 nonce 不匹配、数据被篡改时返回 `Decryption`
    pub async fn decrypt_file(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> SyncResult<Vec<u8>> {
        let key = self.ensure_ready().await?;
        key.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SyncError::Decryption("认证失败".to_string()))
    }

    /// 解密远程对象（nonce ‖ 密文），同时返回其中的 nonce
    pub async fn open_blob(&self, blob: &[u8]) -> SyncResult<(Vec<u8>, [u8; NONCE_LEN])> {
        let (nonce, ciphertext) = split_blob(blob)?;
        let plaintext = self.decrypt_file(ciphertext, &nonce).await?;
        Ok((plaintext, nonce))
    }
}
