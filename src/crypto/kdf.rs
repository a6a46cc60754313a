//! Argon2id 密钥派生
//!
//! 默认参数：
//! - 时间成本 3
//! - 内存成本 64 MiB
//! - 并行度 1
//! - 输出 32 字节（AES-256 密钥）
//! - 盐 16 字节

use crate::error::{SyncError, SyncResult};
use aes_gcm::{Aes256Gcm, KeyInit};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// 盐：生成一次后永久保存，不能更换
pub type Salt = [u8; SALT_LEN];

/// Argon2id 参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// 迭代次数
    pub time_cost: u32,
    /// 内存成本（KiB）
    pub mem_cost_kib: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time_cost: 3,
            mem_cost_kib: 64 * 1024, // 64 MiB
            parallelism: 1,
        }
    }
}

/// 派生得到的加密密钥，只能用于加密/解密，原始密钥材料不保留
#[derive(Clone)]
pub struct EncryptionKey {
    cipher: Aes256Gcm,
}

impl EncryptionKey {
    pub(crate) fn cipher(&self) -> &Aes256Gcm {
        &self.cipher
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// 生成随机盐
pub fn generate_salt() -> Salt {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// 从密码派生密钥；未提供盐时生成新盐
///
/// 这是 CPU/内存密集操作，异步上下文中应放到 `spawn_blocking` 中执行。
pub fn derive_key(
    password: &[u8],
    salt: Option<Salt>,
    params: &KdfParams,
) -> SyncResult<(EncryptionKey, Salt)> {
    let salt = salt.unwrap_or_else(generate_salt);

    let argon_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| SyncError::KeyDerivation(format!("参数无效: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut material = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password, &salt, &mut material)
        .map_err(|e| SyncError::KeyDerivation(e.to_string()))?;

    let cipher = Aes256Gcm::new_from_slice(&material);
    material.zeroize();
    let cipher = cipher.map_err(|e| SyncError::KeyDerivation(e.to_string()))?;

    Ok((EncryptionKey { cipher }, salt))
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        time_cost: 1,
        mem_cost_kib: 1024,
        parallelism: 1,
    }
}
