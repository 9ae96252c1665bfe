//! # 上传模块
//!
//! ## 设计思路
//!
//! `Uploader` 只负责“打开一个已认证会话”与“把字节写到远端”两件事，
//! 凭据的来源、重试与历史记录都交给编排层。
//!
//! 具体协议藏在 `Transport` / `TransportSession` 两个 trait 之后：
//! 生产环境使用 `SftpTransport`（ssh2），测试中替换为脚本化的假实现。
//!
//! ## 实现思路
//!
//! - ssh2 是阻塞 API，所有调用都放进 `spawn_blocking`，
//!   外层再套 `tokio::time::timeout(destination.timeout)`，任何一步都不会无限挂起。
//! - 超时后不会把阻塞任务丢在后台：先置位 `TransferAbort`，写入循环逐块检查并删除半成品，
//!   等任务真正退出后才返回，重试不会与上一次写入争抢同一个远端文件。
//! - 负载以 `bytes::Bytes` 传递，按 32 KiB 分块写出，不额外复制整段数据。
//! - 进度经 `progress::ThrottledProgress` 节流后再交给观察者。

pub mod naming;
pub mod progress;
pub mod sftp;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Local;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::config::Destination;
use crate::error::AppError;

pub use progress::{ProgressCallback, UploadProgress};
pub use sftp::SftpTransport;

/// 单次写入的分块大小
pub const CHUNK_SIZE: usize = 32 * 1024;

// ============================================================================
// 传输抽象
// ============================================================================

/// 打开会话时使用的认证材料
#[derive(Clone)]
pub enum SessionAuth {
    /// 私钥文件，可选口令
    KeyFile {
        path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
    /// 密码认证
    Password(Zeroizing<String>),
}

impl fmt::Debug for SessionAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// 远端传输协议
pub trait Transport: Send + Sync {
    /// 建立连接并完成认证（阻塞调用）
    fn connect(
        &self,
        destination: &Destination,
        auth: &SessionAuth,
    ) -> Result<Box<dyn TransportSession>, AppError>;
}

/// 已认证的传输会话
pub trait TransportSession: Send {
    /// 把 `payload` 写到 `remote_path`，每写出一块回调一次累计字节数
    ///
    /// 每块写出前调用 `abort.checkpoint()`；被中止时删除已写出的部分并返回错误。
    fn write_file(
        &mut self,
        remote_path: &str,
        payload: &Bytes,
        abort: &TransferAbort,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, AppError>;
}

/// 阻塞传输的中止标记，由外层超时置位
#[derive(Debug, Clone, Default)]
pub struct TransferAbort {
    flag: Arc<AtomicBool>,
}

impl TransferAbort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// 已中止时返回 `TransportTimeout`
    pub fn checkpoint(&self) -> Result<(), AppError> {
        if self.is_aborted() {
            return Err(AppError::TransportTimeout("传输已因超时中止".to_string()));
        }
        Ok(())
    }
}

/// 在阻塞线程上执行 `f`，超时后置位中止标记并等待任务退出
///
/// 任务在超时后仍然成功完成时返回它的结果：数据已经落地，不能再报告为失败。
async fn run_blocking<T, F>(timeout: Duration, operation: &str, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&TransferAbort) -> Result<T, AppError> + Send + 'static,
{
    let abort = TransferAbort::new();
    let task_abort = abort.clone();
    let mut handle = tokio::task::spawn_blocking(move || f(&task_abort));

    let first = tokio::time::timeout(timeout, &mut handle).await;
    let joined = match first {
        Ok(joined) => joined,
        Err(_) => {
            abort.abort();
            log::warn!(
                "⏱️ {}超过 {} 秒，等待阻塞任务退出",
                operation,
                timeout.as_secs_f32()
            );
            // 写入循环逐块检查中止标记，网络调用受套接字超时约束，这里的等待是有界的
            match handle.await {
                Ok(Ok(value)) => {
                    log::warn!("⏱️ {}在中止前已完成", operation);
                    return Ok(value);
                }
                Ok(Err(e)) => log::debug!("{}中止后的结果: {}", operation, e),
                Err(e) => log::debug!("{}任务异常终止: {}", operation, e),
            }
            return Err(AppError::TransportTimeout(format!(
                "{}超过 {} 秒",
                operation,
                timeout.as_secs_f32()
            )));
        }
    };

    match joined {
        Err(e) => Err(AppError::TransportConnectionFailed(format!(
            "{}任务异常终止: {}",
            operation, e
        ))),
        Ok(result) => result,
    }
}

// ============================================================================
// 上传器
// ============================================================================

/// 文件名的确定方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileNameSpec {
    /// 发送时按模板生成
    Template { template: String, extension: String },
    /// 调用方已经确定的名字
    Fixed(String),
}

impl FileNameSpec {
    /// 以当前时间解析出最终文件名
    pub fn render(&self) -> Result<String, AppError> {
        match self {
            Self::Template {
                template,
                extension,
            } => naming::render_filename(template, extension, Local::now()),
            Self::Fixed(name) => naming::validate_filename_override(name),
        }
    }
}

/// 一次成功发送的结果
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub url: Option<String>,
    pub remote_path: String,
    pub filename: String,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

/// 已打开的上传会话，可连续发送多个文件
pub struct UploadSession {
    destination: Destination,
    inner: Arc<Mutex<Box<dyn TransportSession>>>,
}

impl UploadSession {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

#[derive(Clone)]
pub struct Uploader {
    transport: Arc<dyn Transport>,
}

impl Default for Uploader {
    fn default() -> Self {
        Self::new(Arc::new(SftpTransport))
    }
}

impl Uploader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// 打开会话；认证失败返回 `TransportAuthFailed`，与连接失败区分开
    pub async fn open(
        &self,
        destination: &Destination,
        auth: SessionAuth,
    ) -> Result<UploadSession, AppError> {
        log::info!(
            "🔌 连接上传目标 '{}' ({}@{}:{})",
            destination.name,
            destination.username,
            destination.host,
            destination.port
        );

        let transport = self.transport.clone();
        let target = destination.clone();
        let session = run_blocking(destination.timeout, "连接与认证", move |_abort| {
            transport.connect(&target, &auth)
        })
        .await?;

        Ok(UploadSession {
            destination: destination.clone(),
            inner: Arc::new(Mutex::new(session)),
        })
    }

    /// 发送一个文件；文件名在此刻才解析
    pub async fn send(
        &self,
        session: &UploadSession,
        payload: Bytes,
        name: &FileNameSpec,
        progress: Option<ProgressCallback>,
    ) -> Result<UploadReceipt, AppError> {
        let filename = name.render()?;
        let destination = &session.destination;
        let remote_path = naming::remote_file_path(&destination.remote_path, &filename);
        let url = naming::render_url(destination.url_template.as_deref(), &filename, &remote_path);
        let total = payload.len() as u64;

        log::info!("📤 开始上传 {} ({} 字节) -> {}", filename, total, remote_path);

        let started = Instant::now();
        let inner = session.inner.clone();
        let task_path = remote_path.clone();
        let task_name = filename.clone();
        let bytes_sent = run_blocking(destination.timeout, "上传", move |abort| {
            let mut guard = inner.lock().map_err(|_| {
                AppError::TransportConnectionFailed("上传会话已损坏".to_string())
            })?;
            let mut reporter = progress::ThrottledProgress::new(&task_name, total, progress);
            reporter.report(0);
            guard.write_file(&task_path, &payload, abort, &mut |sent| reporter.report(sent))
        })
        .await?;

        let elapsed = started.elapsed();
        log::info!(
            "✅ 上传完成 {} ({} 字节, {} ms)",
            filename,
            bytes_sent,
            elapsed.as_millis()
        );

        Ok(UploadReceipt {
            url,
            remote_path,
            filename,
            bytes_sent,
            elapsed,
        })
    }
}
