//! # 系统钥匙串后端
//!
//! 存储交给平台密钥服务（macOS Keychain / Windows Credential Manager / Linux keyutils）。
//! 平台接口不支持枚举，因此额外维护一个索引条目保存键名列表。
//! 对 `keyring` 的调用收敛在 `KeyringBackend` 之后，测试用内存实现替换。

use std::sync::Mutex;

use keyring::Entry;

use super::{BackendKind, Secret, SecretBackend};
use crate::error::AppError;

pub const SERVICE_NAME: &str = "clipshot";
pub const INDEX_KEY: &str = "__clipshot_index__";

pub trait KeyringEntryOps {
    fn get_secret(&self) -> Result<Vec<u8>, keyring::Error>;
    fn set_secret(&self, secret: &[u8]) -> Result<(), keyring::Error>;
    fn delete_credential(&self) -> Result<(), keyring::Error>;
}

pub trait KeyringBackend: Send + Sync {
    type Entry: KeyringEntryOps;
    fn new_entry(&self, service: &str, username: &str) -> Result<Self::Entry, keyring::Error>;
}

pub struct RealBackend;

pub struct RealEntry {
    inner: Entry,
}

impl KeyringEntryOps for RealEntry {
    fn get_secret(&self) -> Result<Vec<u8>, keyring::Error> {
        self.inner.get_secret()
    }

    fn set_secret(&self, secret: &[u8]) -> Result<(), keyring::Error> {
        self.inner.set_secret(secret)
    }

    fn delete_credential(&self) -> Result<(), keyring::Error> {
        self.inner.delete_credential()
    }
}

impl KeyringBackend for RealBackend {
    type Entry = RealEntry;

    fn new_entry(&self, service: &str, username: &str) -> Result<Self::Entry, keyring::Error> {
        Entry::new(service, username).map(|inner| RealEntry { inner })
    }
}

fn map_keyring_error(key: &str, e: keyring::Error) -> AppError {
    match e {
        keyring::Error::NoEntry => AppError::CredentialNotFound(key.to_string()),
        keyring::Error::NoStorageAccess(inner) => {
            AppError::CredentialBackendUnavailable(format!("无法访问系统钥匙串: {}", inner))
        }
        keyring::Error::PlatformFailure(inner) => {
            AppError::CredentialBackendUnavailable(format!("系统钥匙串调用失败: {}", inner))
        }
        keyring::Error::BadEncoding(_) => {
            AppError::CredentialDecryptionFailed(format!("凭据 '{}' 编码无效", key))
        }
        other => AppError::CredentialBackendUnavailable(format!("系统钥匙串错误: {}", other)),
    }
}

/// 系统钥匙串后端
pub struct SystemKeychain<B: KeyringBackend = RealBackend> {
    backend: B,
    index_lock: Mutex<()>,
}

impl SystemKeychain<RealBackend> {
    /// 连接系统钥匙串，并通过读取索引条目确认服务可用。
    pub fn connect() -> Result<Self, AppError> {
        let keychain = Self::with_backend(RealBackend);
        keychain.read_index()?;
        Ok(keychain)
    }
}

impl<B: KeyringBackend> SystemKeychain<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            index_lock: Mutex::new(()),
        }
    }

    fn entry(&self, key: &str) -> Result<B::Entry, AppError> {
        self.backend
            .new_entry(SERVICE_NAME, key)
            .map_err(|e| map_keyring_error(key, e))
    }

    fn read_index(&self) -> Result<Vec<String>, AppError> {
        match self.entry(INDEX_KEY)?.get_secret() {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                AppError::StorageInconsistent(format!("钥匙串索引条目损坏: {}", e))
            }),
            Err(keyring::Error::NoEntry) => Ok(Vec::new()),
            Err(e) => Err(map_keyring_error(INDEX_KEY, e)),
        }
    }

    fn write_index(&self, keys: &[String]) -> Result<(), AppError> {
        let raw = serde_json::to_vec(keys)
            .map_err(|e| AppError::StorageIo(format!("序列化钥匙串索引失败: {}", e)))?;
        self.entry(INDEX_KEY)?
            .set_secret(&raw)
            .map_err(|e| map_keyring_error(INDEX_KEY, e))
    }

    fn update_index(&self, key: &str, present: bool) -> Result<(), AppError> {
        let _guard = self.index_lock.lock().map_err(|e| {
            AppError::CredentialBackendUnavailable(format!("获取钥匙串索引锁失败: {}", e))
        })?;
        let mut keys = self.read_index()?;
        let exists = keys.iter().any(|k| k == key);
        match (present, exists) {
            (true, false) => {
                keys.push(key.to_string());
                keys.sort();
            }
            (false, true) => keys.retain(|k| k != key),
            _ => return Ok(()),
        }
        self.write_index(&keys)
    }
}

impl<B: KeyringBackend> SecretBackend for SystemKeychain<B> {
    fn kind(&self) -> BackendKind {
        BackendKind::SystemKeychain
    }

    fn get(&self, key: &str) -> Result<Secret, AppError> {
        self.entry(key)?
            .get_secret()
            .map(Secret::new)
            .map_err(|e| map_keyring_error(key, e))
    }

    fn set(&self, key: &str, secret: &[u8]) -> Result<(), AppError> {
        self.entry(key)?
            .set_secret(secret)
            .map_err(|e| map_keyring_error(key, e))?;
        self.update_index(key, true)
    }

    fn delete(&self, key: &str) -> Result<(), AppError> {
        match self.entry(key)?.delete_credential() {
            Ok(_) | Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(map_keyring_error(key, e)),
        }
        self.update_index(key, false)
    }

    fn list_keys(&self) -> Result<Vec<String>, AppError> {
        self.read_index()
    }

    fn clear_all(&self) -> Result<(), AppError> {
        for key in self.read_index()? {
            match self.entry(&key)?.delete_credential() {
                Ok(_) | Err(keyring::Error::NoEntry) => {}
                Err(e) => return Err(map_keyring_error(&key, e)),
            }
        }
        match self.entry(INDEX_KEY)?.delete_credential() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(map_keyring_error(INDEX_KEY, e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 内存版钥匙串，`locked` 置位时模拟服务不可用
    #[derive(Clone, Default)]
    pub(crate) struct MemoryKeyring {
        pub store: Arc<Mutex<HashMap<(String, String), Vec<u8>>>>,
        pub locked: Arc<AtomicBool>,
    }

    pub(crate) struct MemoryEntry {
        id: (String, String),
        keyring: MemoryKeyring,
    }

    fn locked_error() -> keyring::Error {
        keyring::Error::NoStorageAccess(Box::new(std::io::Error::other("keychain locked")))
    }

    impl KeyringEntryOps for MemoryEntry {
        fn get_secret(&self) -> Result<Vec<u8>, keyring::Error> {
            if self.keyring.locked.load(Ordering::SeqCst) {
                return Err(locked_error());
            }
            let store = self.keyring.store.lock().expect("memory keyring lock");
            store.get(&self.id).cloned().ok_or(keyring::Error::NoEntry)
        }

        fn set_secret(&self, secret: &[u8]) -> Result<(), keyring::Error> {
            if self.keyring.locked.load(Ordering::SeqCst) {
                return Err(locked_error());
            }
            let mut store = self.keyring.store.lock().expect("memory keyring lock");
            store.insert(self.id.clone(), secret.to_vec());
            Ok(())
        }

        fn delete_credential(&self) -> Result<(), keyring::Error> {
            let mut store = self.keyring.store.lock().expect("memory keyring lock");
            store.remove(&self.id).map(|_| ()).ok_or(keyring::Error::NoEntry)
        }
    }

    impl KeyringBackend for MemoryKeyring {
        type Entry = MemoryEntry;

        fn new_entry(&self, service: &str, username: &str) -> Result<MemoryEntry, keyring::Error> {
            Ok(MemoryEntry {
                id: (service.to_string(), username.to_string()),
                keyring: self.clone(),
            })
        }
    }

    #[test]
    fn set_get_delete_roundtrip_updates_index() {
        let keychain = SystemKeychain::with_backend(MemoryKeyring::default());
        keychain.set("server_password", b"secret123").expect("set");
        keychain.set("api_token", b"t0k3n").expect("set");

        assert_eq!(keychain.get("server_password").expect("get").as_slice(), b"secret123");
        assert_eq!(
            keychain.list_keys().expect("list"),
            vec!["api_token".to_string(), "server_password".to_string()]
        );

        keychain.delete("server_password").expect("delete");
        assert!(matches!(
            keychain.get("server_password"),
            Err(AppError::CredentialNotFound(_))
        ));
        assert_eq!(keychain.list_keys().expect("list"), vec!["api_token".to_string()]);
    }

    #[test]
    fn overwrite_does_not_duplicate_index_entry() {
        let keychain = SystemKeychain::with_backend(MemoryKeyring::default());
        keychain.set("k", b"one").expect("set");
        keychain.set("k", b"two").expect("overwrite");
        assert_eq!(keychain.get("k").expect("get").as_slice(), b"two");
        assert_eq!(keychain.list_keys().expect("list"), vec!["k".to_string()]);
    }

    #[test]
    fn delete_missing_key_is_not_an_error() {
        let keychain = SystemKeychain::with_backend(MemoryKeyring::default());
        keychain.delete("ghost").expect("delete missing");
    }

    #[test]
    fn locked_service_maps_to_backend_unavailable() {
        let keyring = MemoryKeyring::default();
        keyring.locked.store(true, Ordering::SeqCst);
        let keychain = SystemKeychain::with_backend(keyring);
        assert!(matches!(
            keychain.get("k"),
            Err(AppError::CredentialBackendUnavailable(_))
        ));
        assert!(matches!(
            keychain.list_keys(),
            Err(AppError::CredentialBackendUnavailable(_))
        ));
    }

    #[test]
    fn clear_all_removes_every_indexed_entry() {
        let keyring = MemoryKeyring::default();
        let keychain = SystemKeychain::with_backend(keyring.clone());
        keychain.set("a", b"1").expect("set a");
        keychain.set("b", b"2").expect("set b");
        keychain.clear_all().expect("clear");
        assert!(keyring.store.lock().expect("lock").is_empty());
    }
}
