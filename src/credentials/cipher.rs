//! # 记录加密
//!
//! Argon2id 派生 32 字节密钥，XChaCha20-Poly1305 加密单条凭据。
//! 每条记录都有独立的盐与随机数；凭据键名作为关联数据参与认证，
//! 因此把两条记录互换位置同样会解密失败。

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::AppError;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// 从文件读取的 KDF 参数上限，超出即视为记录损坏
pub const MAX_KDF_MEM_KIB: u32 = 1024 * 1024;
pub const MAX_KDF_ITERS: u32 = 16;
pub const MAX_KDF_PARALLELISM: u32 = 16;

/// Argon2id 参数，随记录一起保存
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub mem_kib: u32,
    pub iters: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_kib: 19 * 1024,
            iters: 2,
            parallelism: 1,
        }
    }
}

/// 文件中保存的单条密文记录（字节字段均为 base64）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedRecord {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
    #[serde(default)]
    pub kdf: KdfParams,
}

impl KdfParams {
    /// 检查取值范围并转换为 argon2 参数；内存下限为每条 lane 8 KiB
    fn to_argon2(&self) -> Result<Params, String> {
        if !(1..=MAX_KDF_PARALLELISM).contains(&self.parallelism) {
            return Err(format!("parallelism={} 超出 1..={}", self.parallelism, MAX_KDF_PARALLELISM));
        }
        if !(1..=MAX_KDF_ITERS).contains(&self.iters) {
            return Err(format!("iters={} 超出 1..={}", self.iters, MAX_KDF_ITERS));
        }
        let min_mem = 8 * self.parallelism;
        if !(min_mem..=MAX_KDF_MEM_KIB).contains(&self.mem_kib) {
            return Err(format!(
                "mem_kib={} 超出 {}..={}",
                self.mem_kib, min_mem, MAX_KDF_MEM_KIB
            ));
        }
        Params::new(self.mem_kib, self.iters, self.parallelism, Some(KEY_LEN)).map_err(|e| e.to_string())
    }
}

fn derive_key(
    passphrase: &[u8],
    salt: &[u8],
    params: Params,
) -> Result<Zeroizing<[u8; KEY_LEN]>, AppError> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase, salt, &mut key[..])
        .map_err(|e| AppError::CredentialDecryptionFailed(format!("密钥派生失败: {}", e)))?;
    Ok(key)
}

/// 用新的盐和随机数加密一条凭据。
pub fn seal(
    passphrase: &[u8],
    key_name: &str,
    plaintext: &[u8],
    params: &KdfParams,
) -> Result<SealedRecord, AppError> {
    let mut rng = rand::rng();
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let argon2_params = params
        .to_argon2()
        .map_err(|e| AppError::CredentialBackendUnavailable(format!("KDF 参数无效: {}", e)))?;
    let key = derive_key(passphrase, &salt, argon2_params)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
        .map_err(|_| AppError::CredentialBackendUnavailable("加密密钥长度无效".to_string()))?;
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: key_name.as_bytes(),
            },
        )
        .map_err(|_| AppError::CredentialBackendUnavailable("加密凭据失败".to_string()))?;

    Ok(SealedRecord {
        salt: STANDARD.encode(salt),
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
        kdf: *params,
    })
}

/// 解密一条凭据；口令错误、记录损坏或被篡改都返回 `CredentialDecryptionFailed`。
/// KDF 参数越界同样按损坏处理，不会据此分配内存。
pub fn open(
    passphrase: &[u8],
    key_name: &str,
    record: &SealedRecord,
) -> Result<Zeroizing<Vec<u8>>, AppError> {
    let corrupt = |what: &str| {
        AppError::CredentialDecryptionFailed(format!("凭据 '{}' 的 {} 已损坏", key_name, what))
    };

    let salt = STANDARD.decode(&record.salt).map_err(|_| corrupt("salt"))?;
    let nonce = STANDARD.decode(&record.nonce).map_err(|_| corrupt("nonce"))?;
    let ciphertext = STANDARD
        .decode(&record.ciphertext)
        .map_err(|_| corrupt("ciphertext"))?;
    if salt.len() != SALT_LEN {
        return Err(corrupt("salt"));
    }
    if nonce.len() != NONCE_LEN {
        return Err(corrupt("nonce"));
    }

    let argon2_params = record.kdf.to_argon2().map_err(|e| {
        AppError::CredentialDecryptionFailed(format!("凭据 '{}' 的 KDF 参数无效: {}", key_name, e))
    })?;
    let key = derive_key(passphrase, &salt, argon2_params)?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
        .map_err(|_| AppError::CredentialBackendUnavailable("加密密钥长度无效".to_string()))?;
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad: key_name.as_bytes(),
            },
        )
        .map_err(|_| {
            AppError::CredentialDecryptionFailed(format!(
                "凭据 '{}' 认证失败（主密码错误或记录被篡改）",
                key_name
            ))
        })?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
pub(crate) fn test_kdf_params() -> KdfParams {
    KdfParams {
        mem_kib: 32,
        iters: 1,
        parallelism: 1,
    }
}
