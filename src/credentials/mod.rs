//! # 凭据保险库模块
//!
//! ## 设计思路
//!
//! `CredentialStore` 对上层提供统一的 get / set / delete / list_keys，
//! 底层是两种能力之一：系统钥匙串，或自管的认证加密文件。
//! 后端在构造时按配置选定一次，之后所有调用都走同一个后端，不会在同一命名空间内混用。
//!
//! 保险库是显式构造、显式传递的实例，没有进程级全局状态。
//!
//! ## 实现思路
//!
//! - `SecretBackend` 是能力接口，`SystemKeychain` 与 `EncryptedFileBackend` 各实现一份。
//! - 主密码只从环境变量读取，包装在 `Zeroizing` 中，`Debug` 输出脱敏，从不写日志。
//! - 系统钥匙串探测失败且允许加密文件时，构造阶段回退到加密文件，并打印一次警告。

pub mod cipher;
pub mod encrypted_file;
pub mod keychain;

use std::fmt;
use std::path::PathBuf;

use zeroize::Zeroizing;

use crate::config::SecurityConfig;
use crate::error::AppError;

pub use cipher::KdfParams;
pub use encrypted_file::EncryptedFileBackend;
pub use keychain::SystemKeychain;

/// 主密码环境变量名
pub const MASTER_PASSPHRASE_ENV: &str = "CLIPSHOT_MASTER_PASSPHRASE";

/// 解密后的凭据字节，离开作用域时清零
pub type Secret = Zeroizing<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    SystemKeychain,
    EncryptedFile,
}

/// 凭据存储能力接口
pub trait SecretBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn get(&self, key: &str) -> Result<Secret, AppError>;
    /// 幂等写入（存在则覆盖）
    fn set(&self, key: &str, secret: &[u8]) -> Result<(), AppError>;
    /// 删除不存在的键不是错误
    fn delete(&self, key: &str) -> Result<(), AppError>;
    fn list_keys(&self) -> Result<Vec<String>, AppError>;
    fn clear_all(&self) -> Result<(), AppError>;
}

/// 加密文件后端使用的主密码
#[derive(Clone)]
pub struct MasterPassphrase(Zeroizing<String>);

impl MasterPassphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(Zeroizing::new(passphrase.into()))
    }

    /// 从 `CLIPSHOT_MASTER_PASSPHRASE` 读取；未设置或为空时返回 `None`。
    pub fn from_env() -> Option<Self> {
        std::env::var(MASTER_PASSPHRASE_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for MasterPassphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterPassphrase(***)")
    }
}

/// 统一凭据入口
pub struct CredentialStore {
    backend: Box<dyn SecretBackend>,
}

impl CredentialStore {
    pub fn with_backend(backend: Box<dyn SecretBackend>) -> Self {
        log::info!("🔐 凭据后端: {:?}", backend.kind());
        Self { backend }
    }

    /// 按安全配置选择后端。
    ///
    /// `use_system_keychain` 为真时优先连接系统钥匙串；连接失败且
    /// `encrypt_credentials` 为真、同时提供了主密码，则回退到加密文件。
    pub fn from_config(
        security: &SecurityConfig,
        credentials_file: PathBuf,
        passphrase: Option<MasterPassphrase>,
    ) -> Result<Self, AppError> {
        if security.use_system_keychain {
            match SystemKeychain::<keychain::RealBackend>::connect() {
                Ok(keychain) => return Ok(Self::with_backend(Box::new(keychain))),
                Err(e) if security.encrypt_credentials && passphrase.is_some() => {
                    log::warn!("⚠️ 系统钥匙串不可用，回退到加密文件: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        if !security.encrypt_credentials {
            return Err(AppError::ConfigInvalid(
                "不支持明文保存凭据：请启用系统钥匙串或加密文件".to_string(),
            ));
        }

        let passphrase = passphrase.ok_or_else(|| {
            AppError::CredentialBackendUnavailable(format!(
                "加密文件后端需要设置环境变量 {}",
                MASTER_PASSPHRASE_ENV
            ))
        })?;
        Ok(Self::with_backend(Box::new(EncryptedFileBackend::new(
            credentials_file,
            passphrase,
        ))))
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn get(&self, key: &str) -> Result<Secret, AppError> {
        validate_key(key)?;
        self.backend.get(key)
    }

    /// 以 UTF-8 字符串读取（密码、口令）
    pub fn get_string(&self, key: &str) -> Result<Zeroizing<String>, AppError> {
        let secret = self.get(key)?;
        let text = std::str::from_utf8(&secret).map_err(|_| {
            AppError::CredentialDecryptionFailed(format!("凭据 '{}' 不是有效的 UTF-8", key))
        })?;
        Ok(Zeroizing::new(text.to_string()))
    }

    pub fn set(&self, key: &str, secret: &[u8]) -> Result<(), AppError> {
        validate_key(key)?;
        self.backend.set(key, secret)?;
        log::info!("🔐 已保存凭据: {}", key);
        Ok(())
    }

    pub fn set_string(&self, key: &str, secret: &str) -> Result<(), AppError> {
        self.set(key, secret.as_bytes())
    }

    pub fn delete(&self, key: &str) -> Result<(), AppError> {
        validate_key(key)?;
        self.backend.delete(key)?;
        log::info!("🗑️ 已删除凭据: {}", key);
        Ok(())
    }

    pub fn list_keys(&self) -> Result<Vec<String>, AppError> {
        self.backend.list_keys()
    }

    pub fn clear_all(&self) -> Result<(), AppError> {
        self.backend.clear_all()?;
        log::warn!("🗑️ 已清空全部凭据");
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), AppError> {
    if key.trim().is_empty() {
        return Err(AppError::ConfigInvalid("凭据键名不能为空".to_string()));
    }
    if key == keychain::INDEX_KEY {
        return Err(AppError::ConfigInvalid(format!("凭据键名 '{}' 为保留名称", key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::keychain::tests::MemoryKeyring;

    #[test]
    fn debug_output_hides_passphrase() {
        let passphrase = MasterPassphrase::new("hunter2");
        assert_eq!(format!("{:?}", passphrase), "MasterPassphrase(***)");
    }

    #[test]
    fn empty_and_reserved_keys_are_rejected() {
        let store = CredentialStore::with_backend(Box::new(SystemKeychain::with_backend(
            MemoryKeyring::default(),
        )));
        assert!(matches!(store.set("", b"x"), Err(AppError::ConfigInvalid(_))));
        assert!(matches!(
            store.get(keychain::INDEX_KEY),
            Err(AppError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn string_helpers_roundtrip() {
        let store = CredentialStore::with_backend(Box::new(SystemKeychain::with_backend(
            MemoryKeyring::default(),
        )));
        store.set_string("ssh_password_prod", "p@ss").expect("set");
        assert_eq!(store.get_string("ssh_password_prod").expect("get").as_str(), "p@ss");
        assert_eq!(store.kind(), BackendKind::SystemKeychain);
    }

    #[test]
    fn plaintext_mode_is_refused() {
        let security = SecurityConfig {
            use_system_keychain: false,
            encrypt_credentials: false,
        };
        let result = CredentialStore::from_config(
            &security,
            std::env::temp_dir().join("clipshot_unused.json"),
            Some(MasterPassphrase::new("pw")),
        );
        assert!(matches!(result, Err(AppError::ConfigInvalid(_))));
    }

    #[test]
    fn fallback_without_passphrase_is_unavailable() {
        let security = SecurityConfig {
            use_system_keychain: false,
            encrypt_credentials: true,
        };
        let result = CredentialStore::from_config(
            &security,
            std::env::temp_dir().join("clipshot_unused.json"),
            None,
        );
        assert!(matches!(
            result,
            Err(AppError::CredentialBackendUnavailable(_))
        ));
    }
}
