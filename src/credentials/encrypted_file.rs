//! # 加密文件凭据后端
//!
//! ## 设计思路
//!
//! 没有系统钥匙串时，凭据保存在单个 JSON 文件中，每个键对应一条
//! `{salt, nonce, ciphertext}` 记录。该文件是每个用户唯一的共享资源。
//!
//! ## 实现思路
//!
//! - 写操作在进程内互斥锁下完成整表的读-改-写。
//! - 落盘先写 `*.tmp` 再 `rename`，跨进程竞争也不会留下半个文件。
//! - 条目以 `serde_json::Value` 原样保存、按需解析：一条记录损坏只影响它自己。
//! - 顶层 JSON 损坏时拒绝覆盖，返回 `StorageInconsistent`。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::cipher::{self, KdfParams, SealedRecord};
use super::{BackendKind, MasterPassphrase, Secret, SecretBackend};
use crate::error::AppError;

const FILE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default = "file_version")]
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, serde_json::Value>,
}

fn file_version() -> u32 {
    FILE_VERSION
}

pub struct EncryptedFileBackend {
    path: PathBuf,
    passphrase: MasterPassphrase,
    kdf: KdfParams,
    write_lock: Mutex<()>,
}

impl EncryptedFileBackend {
    pub fn new(path: impl Into<PathBuf>, passphrase: MasterPassphrase) -> Self {
        Self::with_kdf_params(path, passphrase, KdfParams::default())
    }

    pub fn with_kdf_params(
        path: impl Into<PathBuf>,
        passphrase: MasterPassphrase,
        kdf: KdfParams,
    ) -> Self {
        Self {
            path: path.into(),
            passphrase,
            kdf,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CredentialFile, AppError> {
        if !self.path.exists() {
            return Ok(CredentialFile {
                version: FILE_VERSION,
                entries: BTreeMap::new(),
            });
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| AppError::StorageIo(format!("读取凭据文件失败: {}", e)))?;
        if content.trim().is_empty() {
            return Ok(CredentialFile::default());
        }
        let file: CredentialFile = serde_json::from_str(&content).map_err(|e| {
            AppError::StorageInconsistent(format!(
                "凭据文件 '{}' 格式损坏: {}",
                self.path.display(),
                e
            ))
        })?;
        if file.version > FILE_VERSION {
            return Err(AppError::StorageInconsistent(format!(
                "凭据文件版本 {} 高于当前支持的 {}",
                file.version, FILE_VERSION
            )));
        }
        Ok(file)
    }

    fn store(&self, file: &CredentialFile) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            crate::storage::ensure_dir(parent)?;
        }
        let content = serde_json::to_string_pretty(file)
            .map_err(|e| AppError::StorageIo(format!("序列化凭据文件失败: {}", e)))?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .map_err(|e| AppError::StorageIo(format!("写入临时凭据文件失败: {}", e)))?;
        restrict_permissions(&tmp_path);
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| AppError::StorageIo(format!("替换凭据文件失败: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, AppError> {
        self.write_lock
            .lock()
            .map_err(|e| AppError::CredentialBackendUnavailable(format!("获取凭据文件锁失败: {}", e)))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        log::warn!("⚠️ 设置凭据文件权限失败: {}", e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

impl SecretBackend for EncryptedFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::EncryptedFile
    }

    fn get(&self, key: &str) -> Result<Secret, AppError> {
        let file = self.load()?;
        let value = file
            .entries
            .get(key)
            .ok_or_else(|| AppError::CredentialNotFound(key.to_string()))?;
        let record: SealedRecord = serde_json::from_value(value.clone()).map_err(|e| {
            AppError::CredentialDecryptionFailed(format!("凭据 '{}' 记录结构损坏: {}", key, e))
        })?;
        cipher::open(self.passphrase.as_bytes(), key, &record)
    }

    fn set(&self, key: &str, secret: &[u8]) -> Result<(), AppError> {
        let _guard = self.lock()?;
        let mut file = self.load()?;
        let record = cipher::seal(self.passphrase.as_bytes(), key, secret, &self.kdf)?;
        let value = serde_json::to_value(record)
            .map_err(|e| AppError::StorageIo(format!("序列化凭据记录失败: {}", e)))?;
        file.entries.insert(key.to_string(), value);
        file.version = FILE_VERSION;
        self.store(&file)?;
        log::debug!("🔐 已写入加密凭据: {}", key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), AppError> {
        let _guard = self.lock()?;
        let mut file = self.load()?;
        if file.entries.remove(key).is_some() {
            self.store(&file)?;
            log::debug!("🗑️ 已删除加密凭据: {}", key);
        }
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>, AppError> {
        Ok(self.load()?.entries.into_keys().collect())
    }

    fn clear_all(&self) -> Result<(), AppError> {
        let _guard = self.lock()?;
        match fs::remove_file(&self.path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::StorageIo(format!("删除凭据文件失败: {}", e))),
        }
    }
}
