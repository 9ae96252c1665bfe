use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clipshot::config::SecurityConfig;
use clipshot::credentials::{
    BackendKind, CredentialStore, EncryptedFileBackend, KdfParams, MasterPassphrase,
};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{}_{}", prefix, nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn fast_kdf() -> KdfParams {
    KdfParams {
        mem_kib: 64,
        iters: 1,
        parallelism: 1,
    }
}

fn open_store(path: &PathBuf, passphrase: &str) -> CredentialStore {
    CredentialStore::with_backend(Box::new(EncryptedFileBackend::with_kdf_params(
        path.clone(),
        MasterPassphrase::new(passphrase),
        fast_kdf(),
    )))
}

#[test]
fn wrong_passphrase_fails_decryption() {
    let dir = unique_temp_dir("clipshot_vault_passphrase");
    let path = dir.join("credentials.json");

    let store = open_store(&path, "hunter2");
    store
        .set_string("server_password", "secret123")
        .expect("set secret");
    assert_eq!(
        store.get_string("server_password").expect("get").as_str(),
        "secret123"
    );

    let reopened = open_store(&path, "wrong");
    let err = reopened
        .get_string("server_password")
        .expect_err("wrong passphrase must fail");
    assert_eq!(err.code(), "credential_decryption_failed");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn tampered_ciphertext_is_rejected() {
    let dir = unique_temp_dir("clipshot_vault_tamper");
    let path = dir.join("credentials.json");

    let store = open_store(&path, "hunter2");
    store.set_string("server_password", "secret123").expect("set");
    store.set_string("other", "untouched").expect("set other");

    let raw = fs::read_to_string(&path).expect("read vault");
    let mut json: serde_json::Value = serde_json::from_str(&raw).expect("vault is json");
    let encoded = json["entries"]["server_password"]["ciphertext"]
        .as_str()
        .expect("ciphertext field")
        .to_string();
    let mut bytes = STANDARD.decode(encoded).expect("base64 ciphertext");
    bytes[0] ^= 0x01;
    json["entries"]["server_password"]["ciphertext"] =
        serde_json::Value::String(STANDARD.encode(&bytes));
    fs::write(&path, serde_json::to_string(&json).expect("serialize")).expect("write vault");

    let err = store
        .get("server_password")
        .expect_err("tampered record must fail");
    assert_eq!(err.code(), "credential_decryption_failed");
    // 其他记录不受影响
    assert_eq!(store.get_string("other").expect("get other").as_str(), "untouched");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn tampered_kdf_params_are_rejected() {
    let dir = unique_temp_dir("clipshot_vault_kdf");
    let path = dir.join("credentials.json");

    let store = open_store(&path, "hunter2");
    store.set_string("server_password", "secret123").expect("set");
    store.set_string("other", "untouched").expect("set other");

    let rewrite = |field: &str, value: u64| {
        let raw = fs::read_to_string(&path).expect("read vault");
        let mut json: serde_json::Value = serde_json::from_str(&raw).expect("vault is json");
        json["entries"]["server_password"]["kdf"][field] = serde_json::Value::from(value);
        fs::write(&path, serde_json::to_string(&json).expect("serialize")).expect("write vault");
    };

    rewrite("iters", 0);
    let err = store
        .get("server_password")
        .expect_err("zero iterations must fail");
    assert_eq!(err.code(), "credential_decryption_failed");

    // 超大内存参数在分配前就被拒绝
    rewrite("iters", 1);
    rewrite("mem_kib", u64::from(u32::MAX));
    let err = store
        .get("server_password")
        .expect_err("oversized memory cost must fail");
    assert_eq!(err.code(), "credential_decryption_failed");

    assert_eq!(store.get_string("other").expect("get other").as_str(), "untouched");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn round_trip_and_delete() {
    let dir = unique_temp_dir("clipshot_vault_roundtrip");
    let path = dir.join("credentials.json");
    let store = open_store(&path, "hunter2");

    for (key, secret) in [("a", "1"), ("b", "two"), ("ssh_password_prod", "p@ss")] {
        store.set_string(key, secret).expect("set");
    }
    store.set_string("a", "overwritten").expect("upsert");

    assert_eq!(store.get_string("a").expect("get a").as_str(), "overwritten");
    assert_eq!(
        store.list_keys().expect("keys"),
        vec!["a".to_string(), "b".to_string(), "ssh_password_prod".to_string()]
    );

    store.delete("b").expect("delete");
    store.delete("b").expect("deleting a missing key is fine");
    assert_eq!(store.get("b").expect_err("gone").code(), "credential_not_found");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn backend_selection_follows_security_config() {
    let dir = unique_temp_dir("clipshot_vault_select");
    let path = dir.join("credentials.json");

    let file_only = SecurityConfig {
        use_system_keychain: false,
        encrypt_credentials: true,
    };
    let store = CredentialStore::from_config(&file_only, path.clone(), Some(MasterPassphrase::new("pw")))
        .expect("file backend");
    assert_eq!(store.kind(), BackendKind::EncryptedFile);

    let err = CredentialStore::from_config(&file_only, path.clone(), None)
        .err()
        .expect("missing passphrase");
    assert_eq!(err.code(), "credential_backend_unavailable");

    let plaintext = SecurityConfig {
        use_system_keychain: false,
        encrypt_credentials: false,
    };
    let err = CredentialStore::from_config(&plaintext, path, Some(MasterPassphrase::new("pw")))
        .err()
        .expect("plaintext rejected");
    assert_eq!(err.code(), "config_invalid");

    let _ = fs::remove_dir_all(&dir);
}
