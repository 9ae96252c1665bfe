//! # 配置模块
//!
//! ## 设计思路
//!
//! 配置由外部（前端 / 用户手写）拥有，本核心只负责读取、校验与解析为不可变的
//! `Destination`。每次进程启动都重新从文件构造，不作为可变状态持久化。
//!
//! ## 实现思路
//!
//! - 使用 `serde_json` 读写 `config.json`，所有字段都有 `serde(default)`，
//!   缺省文件等价于默认配置。
//! - 格式错误或内容非法统一返回 `AppError::ConfigInvalid`。
//! - 保存时先写临时文件再原子替换。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::storage::expand_home;
use crate::upload::naming;

pub const DEFAULT_FILENAME_TEMPLATE: &str = "screenshot_{date}_{time}_{random:6}";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// 配置模型
// ============================================================================

/// 顶层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub default_destination: Option<String>,
    #[serde(default = "default_filename_template")]
    pub filename_template: String,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub clipboard: ClipboardConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_destination: None,
            filename_template: default_filename_template(),
            destinations: BTreeMap::new(),
            history: HistoryConfig::default(),
            security: SecurityConfig::default(),
            watch: WatchConfig::default(),
            clipboard: ClipboardConfig::default(),
        }
    }
}

/// 传输类型。目前只支持单流远程拷贝（SFTP over SSH）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[serde(alias = "scp", alias = "ssh")]
    Sftp,
}

/// 单个上传目标的原始配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(rename = "type", default = "default_transport_kind")]
    pub kind: TransportKind,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub remote_path: String,
    #[serde(default)]
    pub base_url_template: Option<String>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// 认证配置：`key_path` 与 `use_stored_secret` 至少设置一个。
///
/// 同时设置时，存储的密钥被当作私钥口令使用。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub use_stored_secret: bool,
    /// 凭据键名，缺省为 `ssh_password_{目标名}`
    #[serde(default)]
    pub secret_key: Option<String>,
}

/// 历史保留模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    MetadataOnly,
    Thumbnails,
    FullCopies,
}

impl HistoryMode {
    pub fn keeps_thumbnail(self) -> bool {
        matches!(self, Self::Thumbnails | Self::FullCopies)
    }

    pub fn keeps_full_copy(self) -> bool {
        matches!(self, Self::FullCopies)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_history_mode")]
    pub mode: HistoryMode,
    /// 0 表示不按时间清理
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// 0 表示不限条数
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub storage_path: Option<String>,
    #[serde(default = "default_true")]
    pub record_failures: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: default_history_mode(),
            retention_days: default_retention_days(),
            max_entries: default_max_entries(),
            storage_path: None,
            record_failures: true,
        }
    }
}

impl HistoryConfig {
    /// 历史目录：配置优先，否则使用给定默认值。
    pub fn resolve_storage_path(&self, fallback: &Path) -> PathBuf {
        match self.storage_path.as_deref() {
            Some(path) if !path.trim().is_empty() => expand_home(path.trim()),
            _ => fallback.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub use_system_keychain: bool,
    #[serde(default = "default_true")]
    pub encrypt_credentials: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            use_system_keychain: true,
            encrypt_credentials: true,
        }
    }
}

/// 监听模式参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default)]
    pub fresh_filename_on_retry: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            fresh_filename_on_retry: false,
        }
    }
}

impl WatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// 上传成功后写回剪贴板的内容
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardCopyMode {
    /// 有 URL 用 URL，否则用远端路径
    #[default]
    Auto,
    /// 只复制 URL；没有 URL 时不复制
    Url,
    /// 总是复制远端路径
    Path,
}

impl ClipboardCopyMode {
    pub fn pick<'a>(self, url: Option<&'a str>, remote_path: &'a str) -> Option<&'a str> {
        match self {
            Self::Auto => Some(url.unwrap_or(remote_path)),
            Self::Url => url,
            Self::Path => Some(remote_path),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardConfig {
    #[serde(default = "default_true")]
    pub copy_after_upload: bool,
    #[serde(default)]
    pub copy_mode: ClipboardCopyMode,
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            copy_after_upload: true,
            copy_mode: ClipboardCopyMode::Auto,
        }
    }
}

fn default_filename_template() -> String {
    DEFAULT_FILENAME_TEMPLATE.to_string()
}
fn default_transport_kind() -> TransportKind {
    TransportKind::Sftp
}
fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_true() -> bool {
    true
}
fn default_history_mode() -> HistoryMode {
    HistoryMode::Thumbnails
}
fn default_retention_days() -> u32 {
    30
}
fn default_max_entries() -> usize {
    1000
}
fn default_interval_ms() -> u64 {
    500
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    8_000
}

// ============================================================================
// 解析后的目标
// ============================================================================

/// 认证方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// 私钥文件；`passphrase_key` 指向保存私钥口令的凭据
    KeyFile {
        path: PathBuf,
        passphrase_key: Option<String>,
    },
    /// 保存在凭据库中的密码
    StoredSecret { key: String },
}

/// 解析完成、在一次操作期间不可变的上传目标
#[derive(Debug, Clone)]
pub struct Destination {
    pub name: String,
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub remote_path: String,
    pub url_template: Option<String>,
    pub auth: AuthMode,
    pub timeout: Duration,
}

/// 目标按名称判等
impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Destination {}

/// 供前端列表展示的目标摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationSummary {
    pub name: String,
    pub kind: TransportKind,
    pub host: String,
    pub remote_path: String,
    pub is_default: bool,
}

pub fn default_secret_key(destination: &str) -> String {
    format!("ssh_password_{}", destination)
}

impl DestinationConfig {
    fn resolve(&self, name: &str) -> Result<Destination, AppError> {
        if self.host.trim().is_empty() {
            return Err(AppError::ConfigInvalid(format!("目标 '{}' 缺少 host", name)));
        }
        if self.username.trim().is_empty() {
            return Err(AppError::ConfigInvalid(format!("目标 '{}' 缺少 username", name)));
        }
        if self.remote_path.trim().is_empty() {
            return Err(AppError::ConfigInvalid(format!("目标 '{}' 缺少 remote_path", name)));
        }
        if self.port == 0 {
            return Err(AppError::ConfigInvalid(format!("目标 '{}' 端口不能为 0", name)));
        }
        if self.timeout_secs == 0 {
            return Err(AppError::ConfigInvalid(format!("目标 '{}' 超时不能为 0", name)));
        }

        let secret_key = || {
            self.auth
                .secret_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .unwrap_or_else(|| default_secret_key(name))
        };

        let auth = match (&self.auth.key_path, self.auth.use_stored_secret) {
            (Some(path), use_secret) if !path.trim().is_empty() => AuthMode::KeyFile {
                path: expand_home(path.trim()),
                passphrase_key: use_secret.then(secret_key),
            },
            (_, true) => AuthMode::StoredSecret { key: secret_key() },
            _ => {
                return Err(AppError::ConfigInvalid(format!(
                    "目标 '{}' 需要配置 auth.key_path 或 auth.use_stored_secret",
                    name
                )));
            }
        };

        Ok(Destination {
            name: name.to_string(),
            kind: self.kind,
            host: self.host.trim().to_string(),
            port: self.port,
            username: self.username.trim().to_string(),
            remote_path: self.remote_path.trim().to_string(),
            url_template: self
                .base_url_template
                .clone()
                .filter(|t| !t.trim().is_empty()),
            auth,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

// ============================================================================
// 校验与查询
// ============================================================================

impl AppConfig {
    /// 按名称解析目标。
    pub fn destination(&self, name: &str) -> Result<Destination, AppError> {
        self.destinations
            .get(name)
            .ok_or_else(|| AppError::ConfigInvalid(format!("未找到上传目标 '{}'", name)))?
            .resolve(name)
    }

    /// 解析指定目标，未指定时回退到 `default_destination`。
    pub fn resolve_destination(&self, name: Option<&str>) -> Result<Destination, AppError> {
        match name.or(self.default_destination.as_deref()) {
            Some(name) => self.destination(name),
            None => Err(AppError::ConfigInvalid("未指定上传目标且没有默认目标".to_string())),
        }
    }

    pub fn list_destinations(&self) -> Vec<DestinationSummary> {
        // BTreeMap 迭代即按名称排序
        self.destinations
            .iter()
            .map(|(name, dest)| DestinationSummary {
                name: name.clone(),
                kind: dest.kind,
                host: dest.host.clone(),
                remote_path: dest.remote_path.clone(),
                is_default: self.default_destination.as_deref() == Some(name.as_str()),
            })
            .collect()
    }

    /// 整体校验，任何一处不合法都返回 `ConfigInvalid`。
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(default) = &self.default_destination {
            if !self.destinations.contains_key(default) {
                return Err(AppError::ConfigInvalid(format!(
                    "默认目标 '{}' 不存在",
                    default
                )));
            }
        }
        for name in self.destinations.keys() {
            self.destination(name)?;
        }

        naming::validate_template(&self.filename_template)?;

        if self.watch.interval_ms == 0 {
            return Err(AppError::ConfigInvalid("watch.interval_ms 不能为 0".to_string()));
        }
        if self.watch.max_attempts == 0 {
            return Err(AppError::ConfigInvalid("watch.max_attempts 不能为 0".to_string()));
        }
        if !self.security.use_system_keychain && !self.security.encrypt_credentials {
            return Err(AppError::ConfigInvalid(
                "不支持明文保存凭据：请启用系统钥匙串或加密文件".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// 读写
// ============================================================================

/// 读取配置文件；文件不存在时返回默认配置。
pub fn load_config_from_path(config_path: &Path) -> Result<AppConfig, AppError> {
    if !config_path.exists() {
        log::info!("ℹ️ 配置文件不存在，使用默认配置: {}", config_path.display());
        return Ok(AppConfig::default());
    }
    let content = fs::read_to_string(config_path).map_err(|e| {
        AppError::ConfigInvalid(format!("读取配置文件 '{}' 失败: {}", config_path.display(), e))
    })?;
    let config: AppConfig = serde_json::from_str(&content).map_err(|e| {
        AppError::ConfigInvalid(format!("解析配置文件 '{}' 失败: {}", config_path.display(), e))
    })?;
    config.validate()?;
    Ok(config)
}

/// 保存配置：写临时文件后原子替换。
pub fn save_config_to_path(config_path: &Path, config: &AppConfig) -> Result<(), AppError> {
    config.validate()?;
    if let Some(parent) = config_path.parent() {
        crate::storage::ensure_dir(parent)?;
    }
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::ConfigInvalid(format!("序列化配置失败: {}", e)))?;
    let tmp_path = config_path.with_extension("json.tmp");
    fs::write(&tmp_path, content)
        .map_err(|e| AppError::StorageIo(format!("写入临时配置文件失败: {}", e)))?;
    fs::rename(&tmp_path, config_path)
        .map_err(|e| AppError::StorageIo(format!("替换配置文件失败: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}", prefix, nanos))
    }

    fn sample_json() -> &'static str {
        r#"{
            "default_destination": "prod",
            "destinations": {
                "prod": {
                    "type": "sftp",
                    "host": "shots.example.com",
                    "username": "deploy",
                    "remote_path": "/var/www/shots",
                    "base_url_template": "https://shots.example.com/{filename}",
                    "auth": { "use_stored_secret": true }
                },
                "backup": {
                    "type": "scp",
                    "host": "10.0.0.2",
                    "port": 2222,
                    "username": "bk",
                    "remote_path": "/srv/bk",
                    "auth": { "key_path": "/keys/id_ed25519" }
                }
            },
            "history": { "mode": "full_copies", "max_entries": 3 }
        }"#
    }

    #[test]
    fn parses_and_resolves_destinations() {
        let config: AppConfig = serde_json::from_str(sample_json()).expect("parse config");
        config.validate().expect("config should be valid");

        let prod = config.resolve_destination(None).expect("default destination");
        assert_eq!(prod.name, "prod");
        assert_eq!(prod.port, DEFAULT_SSH_PORT);
        assert_eq!(
            prod.auth,
            AuthMode::StoredSecret {
                key: "ssh_password_prod".to_string()
            }
        );

        let backup = config.destination("backup").expect("backup destination");
        assert_eq!(backup.port, 2222);
        assert!(backup.url_template.is_none());
        assert_eq!(
            backup.auth,
            AuthMode::KeyFile {
                path: PathBuf::from("/keys/id_ed25519"),
                passphrase_key: None
            }
        );
        assert_eq!(config.history.mode, HistoryMode::FullCopies);
        assert_eq!(config.history.retention_days, 30);
    }

    #[test]
    fn clipboard_copy_defaults_and_modes() {
        let config: AppConfig = serde_json::from_str(sample_json()).expect("parse config");
        assert!(config.clipboard.copy_after_upload);
        assert_eq!(config.clipboard.copy_mode, ClipboardCopyMode::Auto);

        let parsed: ClipboardConfig =
            serde_json::from_str(r#"{ "copy_after_upload": false, "copy_mode": "path" }"#)
                .expect("parse clipboard");
        assert!(!parsed.copy_after_upload);
        assert_eq!(parsed.copy_mode, ClipboardCopyMode::Path);

        let url = Some("https://x.dev/a.png");
        assert_eq!(ClipboardCopyMode::Auto.pick(url, "/r/a.png"), url);
        assert_eq!(ClipboardCopyMode::Auto.pick(None, "/r/a.png"), Some("/r/a.png"));
        assert_eq!(ClipboardCopyMode::Url.pick(None, "/r/a.png"), None);
        assert_eq!(ClipboardCopyMode::Path.pick(url, "/r/a.png"), Some("/r/a.png"));
    }

    #[test]
    fn missing_destination_is_config_invalid() {
        let config: AppConfig = serde_json::from_str(sample_json()).expect("parse config");
        let err = config.destination("nope").expect_err("unknown destination");
        assert!(matches!(err, AppError::ConfigInvalid(_)));
    }

    #[test]
    fn destination_without_auth_is_rejected() {
        let mut config = AppConfig::default();
        config.destinations.insert(
            "bare".to_string(),
            DestinationConfig {
                kind: TransportKind::Sftp,
                host: "h".into(),
                port: 22,
                username: "u".into(),
                remote_path: "/r".into(),
                base_url_template: None,
                auth: AuthConfig::default(),
                timeout_secs: 5,
            },
        );
        assert!(matches!(config.validate(), Err(AppError::ConfigInvalid(_))));
    }

    #[test]
    fn plaintext_credentials_are_rejected() {
        let mut config = AppConfig::default();
        config.security.use_system_keychain = false;
        config.security.encrypt_credentials = false;
        assert!(matches!(config.validate(), Err(AppError::ConfigInvalid(_))));
    }

    #[test]
    fn destinations_are_listed_by_name_with_default_flag() {
        let config: AppConfig = serde_json::from_str(sample_json()).expect("parse config");
        let list = config.list_destinations();
        let names: Vec<_> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["backup", "prod"]);
        assert!(list[1].is_default);
        assert!(!list[0].is_default);
    }

    #[test]
    fn missing_file_yields_defaults_and_malformed_file_is_invalid() {
        let dir = unique_temp_dir("clipshot_config");
        fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("config.json");

        let config = load_config_from_path(&path).expect("defaults");
        assert!(config.destinations.is_empty());
        assert_eq!(config.filename_template, DEFAULT_FILENAME_TEMPLATE);

        fs::write(&path, "{ not json").expect("write garbage");
        assert!(matches!(
            load_config_from_path(&path),
            Err(AppError::ConfigInvalid(_))
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_then_load_preserves_destinations() {
        let dir = unique_temp_dir("clipshot_config_save");
        let path = dir.join("config.json");
        let config: AppConfig = serde_json::from_str(sample_json()).expect("parse config");

        save_config_to_path(&path, &config).expect("save config");
        assert!(!path.with_extension("json.tmp").exists());
        let loaded = load_config_from_path(&path).expect("load config");
        assert_eq!(loaded.destinations.len(), 2);
        assert_eq!(loaded.default_destination.as_deref(), Some("prod"));

        let _ = fs::remove_dir_all(&dir);
    }
}
