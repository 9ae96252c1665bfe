//! # 上传编排（UploadOrchestrator）
//!
//! ## 设计思路
//!
//! 编排层把监视器、上传器、历史库与凭据库串成一条流水线：
//!
//! ```text
//! 解析目标 → 识别格式 → 生成文件名 → 解析凭据 → 打开会话 → 发送 → 记录历史
//! ```
//!
//! - 单次上传 `upload_once` 不做重试，任何错误原样返回给调用方。
//! - 监视模式（`watch` 子模块）在此基础上加上指纹去重与退避重试。
//! - 传输完成（无论成功失败）后才记录历史；传输前的错误（配置、凭据、解码）不记录。
//! - 上传成功后历史写入失败不会吞掉 URL，而是体现在 `UploadReport::history` 中。
//! - 按 `clipboard` 配置把 URL 或远端路径写回剪贴板，写回失败只记日志。
//!
//! ## 实现思路
//!
//! - 历史写入包含 SQLite 与缩略图生成，经 `spawn_blocking` 执行。
//! - 同一编排器内上传严格串行：`upload_gate` 从传输开始一直持有到历史写完，
//!   单次上传与监视循环共用这把锁，历史顺序与完成顺序一致，也不会有两次传输争抢同一个文件名。

mod retry;
pub mod watch;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Local;
use serde::Serialize;

use crate::clipboard::ClipboardSource;
use crate::config::{AppConfig, AuthMode, Destination};
use crate::credentials::CredentialStore;
use crate::db::{HistoryStore, NewHistoryEntry, UploadStatus};
use crate::error::AppError;
use crate::image_handler::ImageProcessor;
use crate::upload::{FileNameSpec, ProgressCallback, SessionAuth, UploadReceipt, Uploader, naming};

pub use watch::{WatchPlan, WatchState, WatchStats, WatchStatus};

/// 历史记录的写入结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// 已写入，附带记录 id
    Recorded(i64),
    /// 未启用历史
    Disabled,
    /// 按配置跳过（例如不记录失败）
    Skipped,
    /// 写入失败，附带原因
    Failed(String),
}

/// 单次上传的完整结果
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub receipt: UploadReceipt,
    pub destination: String,
    pub history: RecordOutcome,
    /// 写回剪贴板的文本
    pub copied: Option<String>,
}

pub struct UploadOrchestrator {
    config: Arc<AppConfig>,
    credentials: Arc<CredentialStore>,
    history: Option<Arc<HistoryStore>>,
    uploader: Uploader,
    processor: ImageProcessor,
    progress: Option<ProgressCallback>,
    clipboard: Option<Arc<Mutex<Box<dyn ClipboardSource>>>>,
    upload_gate: tokio::sync::Mutex<()>,
}

impl UploadOrchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        credentials: Arc<CredentialStore>,
        history: Option<Arc<HistoryStore>>,
        uploader: Uploader,
    ) -> Self {
        Self {
            config,
            credentials,
            history,
            uploader,
            processor: ImageProcessor::default(),
            progress: None,
            clipboard: None,
            upload_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// 设置上传进度观察者
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// 单次上传成功后写回结果所用的剪贴板
    pub fn with_clipboard(mut self, clipboard: Box<dyn ClipboardSource>) -> Self {
        self.clipboard = Some(Arc::new(Mutex::new(clipboard)));
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn history(&self) -> Option<&Arc<HistoryStore>> {
        self.history.as_ref()
    }

    // ========================================================================
    // 凭据
    // ========================================================================

    /// 将目标的认证配置解析为会话认证材料
    pub fn resolve_auth(&self, destination: &Destination) -> Result<SessionAuth, AppError> {
        match &destination.auth {
            AuthMode::KeyFile {
                path,
                passphrase_key,
            } => {
                let passphrase = match passphrase_key {
                    Some(key) => match self.credentials.get_string(key) {
                        Ok(secret) => Some(secret),
                        Err(AppError::CredentialNotFound(_)) => {
                            log::warn!("🔑 未找到私钥口令 '{}'，按无口令私钥处理", key);
                            None
                        }
                        Err(e) => return Err(e),
                    },
                    None => None,
                };
                Ok(SessionAuth::KeyFile {
                    path: path.clone(),
                    passphrase,
                })
            }
            AuthMode::StoredSecret { key } => {
                Ok(SessionAuth::Password(self.credentials.get_string(key)?))
            }
        }
    }

    // ========================================================================
    // 单次上传
    // ========================================================================

    /// 上传一段图片数据；不重试，错误原样返回
    pub async fn upload_once(
        &self,
        bytes: Bytes,
        destination: Option<&str>,
        filename_override: Option<&str>,
    ) -> Result<UploadReport, AppError> {
        let destination = self.config.resolve_destination(destination)?;
        let kind = self.processor.detect_format(&bytes)?;
        let filename = match filename_override {
            Some(name) => naming::validate_filename_override(name)?,
            None => naming::render_filename(&self.config.filename_template, kind.extension, Local::now())?,
        };
        let auth = self.resolve_auth(&destination)?;

        let mut report = {
            let _gate = self.upload_gate.lock().await;
            let result = self.transfer(&destination, auth, bytes.clone(), &filename).await;
            self.finish(&destination, &filename, bytes, result).await?
        };
        report.copied = self.copy_to_clipboard(&report.receipt).await;
        Ok(report)
    }

    /// 打开会话并发送一次
    async fn transfer(
        &self,
        destination: &Destination,
        auth: SessionAuth,
        bytes: Bytes,
        filename: &str,
    ) -> Result<UploadReceipt, AppError> {
        let session = self.uploader.open(destination, auth).await?;
        self.uploader
            .send(
                &session,
                bytes,
                &FileNameSpec::Fixed(filename.to_string()),
                self.progress.clone(),
            )
            .await
    }

    /// 传输结束后的记录阶段：成功带回历史结果，失败在记录后返回原错误
    async fn finish(
        &self,
        destination: &Destination,
        filename: &str,
        bytes: Bytes,
        result: Result<UploadReceipt, AppError>,
    ) -> Result<UploadReport, AppError> {
        match result {
            Ok(receipt) => {
                let entry = NewHistoryEntry::uploaded(
                    receipt.filename.clone(),
                    receipt.remote_path.clone(),
                    receipt.url.clone(),
                    destination.name.clone(),
                    receipt.bytes_sent,
                );
                let history = self.record(entry, bytes).await;
                Ok(UploadReport {
                    receipt,
                    destination: destination.name.clone(),
                    history,
                    copied: None,
                })
            }
            Err(err) => {
                log::warn!("❌ 上传 {} 到 '{}' 失败: {}", filename, destination.name, err);
                let entry = NewHistoryEntry::failed(
                    filename,
                    naming::remote_file_path(&destination.remote_path, filename),
                    destination.name.clone(),
                    bytes.len() as u64,
                    err.to_string(),
                );
                self.record(entry, bytes).await;
                Err(err)
            }
        }
    }

    /// 写入历史；失败只记日志，不影响上传结果
    async fn record(&self, entry: NewHistoryEntry, bytes: Bytes) -> RecordOutcome {
        let Some(history) = self.history.clone() else {
            return RecordOutcome::Disabled;
        };
        if entry.status == UploadStatus::Failed && !self.config.history.record_failures {
            return RecordOutcome::Skipped;
        }

        let joined = tokio::task::spawn_blocking(move || history.add(&entry, Some(&bytes))).await;
        match joined {
            Ok(Ok(id)) => RecordOutcome::Recorded(id),
            Ok(Err(e)) => {
                log::warn!("⚠️ 写入上传历史失败: {}", e);
                RecordOutcome::Failed(e.to_string())
            }
            Err(e) => {
                log::warn!("⚠️ 历史写入任务异常终止: {}", e);
                RecordOutcome::Failed(e.to_string())
            }
        }
    }

    // ========================================================================
    // 剪贴板写回
    // ========================================================================

    /// 按配置选出要写回剪贴板的文本
    fn clipboard_text(&self, receipt: &UploadReceipt) -> Option<String> {
        let settings = &self.config.clipboard;
        if !settings.copy_after_upload {
            return None;
        }
        let text = settings
            .copy_mode
            .pick(receipt.url.as_deref(), &receipt.remote_path);
        if text.is_none() {
            log::warn!("📋 {} 没有 URL，跳过写回剪贴板", receipt.filename);
        }
        text.map(str::to_string)
    }

    async fn copy_to_clipboard(&self, receipt: &UploadReceipt) -> Option<String> {
        let clipboard = self.clipboard.clone()?;
        let text = self.clipboard_text(receipt)?;
        let task_text = text.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = clipboard
                .lock()
                .map_err(|_| AppError::Clipboard("剪贴板句柄已损坏".to_string()))?;
            guard.write_text(&task_text)
        })
        .await;

        match joined {
            Ok(Ok(())) => {
                log::info!("📋 已复制: {}", text);
                Some(text)
            }
            Ok(Err(e)) => {
                log::warn!("⚠️ 写回剪贴板失败: {}", e);
                None
            }
            Err(e) => {
                log::warn!("⚠️ 剪贴板写回任务异常终止: {}", e);
                None
            }
        }
    }
}
