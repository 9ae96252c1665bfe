//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 定义全局统一的 `AppError` 枚举，覆盖配置、凭据、历史存储、图片与传输五类失败。
//! 传输层的认证失败、超时、连接失败被刻意拆开，调用方据此选择不同的重试策略。
//!
//! 所有对外调用统一返回 `Result<T, AppError>`，前端（CLI / 托盘 / TUI）
//! 通过 `code()` 映射退出码，通过 `Serialize` 获得可读消息。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 为 `ImageError`、`std::io::Error` 提供 `From` 转换，无需手动 map。
//! - 实现 `Serialize` 将错误序列化为字符串。

use serde::Serialize;

use crate::image_handler::ImageError;

/// 应用级统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 配置缺失或格式错误（包括找不到目标）
    #[error("配置无效: {0}")]
    ConfigInvalid(String),

    /// 凭据不存在
    #[error("未找到凭据: {0}")]
    CredentialNotFound(String),

    /// 主密码不匹配或记录被篡改
    #[error("凭据解密失败: {0}")]
    CredentialDecryptionFailed(String),

    /// 系统钥匙串或主密码不可用
    #[error("凭据后端不可用: {0}")]
    CredentialBackendUnavailable(String),

    /// 历史目录 / 文件读写失败
    #[error("存储 I/O 错误: {0}")]
    StorageIo(String),

    /// 数据库行与磁盘文件不一致
    #[error("历史存储不一致: {0}")]
    StorageInconsistent(String),

    /// 输入不是可解码的图片
    #[error("图片解码失败: {0}")]
    ImageDecodeFailed(String),

    /// 远端拒绝认证
    #[error("传输认证失败: {0}")]
    TransportAuthFailed(String),

    /// 认证或传输超过时限
    #[error("传输超时: {0}")]
    TransportTimeout(String),

    /// 无法建立或维持远端连接
    #[error("传输连接失败: {0}")]
    TransportConnectionFailed(String),

    /// 剪贴板读取失败
    #[error("剪贴板操作失败: {0}")]
    Clipboard(String),

    /// 数据库操作失败
    #[error("数据库错误: {0}")]
    Database(String),

    /// 操作被取消信号中断
    #[error("操作已取消")]
    Cancelled,
}

impl AppError {
    /// 稳定的机器可读错误码，供 CLI 层映射退出码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::CredentialNotFound(_) => "credential_not_found",
            Self::CredentialDecryptionFailed(_) => "credential_decryption_failed",
            Self::CredentialBackendUnavailable(_) => "credential_backend_unavailable",
            Self::StorageIo(_) => "storage_io",
            Self::StorageInconsistent(_) => "storage_inconsistent",
            Self::ImageDecodeFailed(_) => "image_decode_failed",
            Self::TransportAuthFailed(_) => "transport_auth_failed",
            Self::TransportTimeout(_) => "transport_timeout",
            Self::TransportConnectionFailed(_) => "transport_connection_failed",
            Self::Clipboard(_) => "clipboard",
            Self::Database(_) => "database",
            Self::Cancelled => "cancelled",
        }
    }

    /// 是否属于可自动重试的瞬时传输错误。
    ///
    /// 认证失败不重试：同一份凭据再试一次结果不会变。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportTimeout(_) | Self::TransportConnectionFailed(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self::StorageIo(e.to_string())
    }
}

impl From<ImageError> for AppError {
    fn from(e: ImageError) -> Self {
        Self::ImageDecodeFailed(e.to_string())
    }
}

/// 将错误序列化为人类可读的字符串，便于前端直接展示。
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
