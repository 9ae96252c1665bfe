//! 前端调用入口（ClipshotService）
//!
//! # 设计思路
//!
//! 托盘、TUI、CLI 都只是薄壳，它们需要的调用全部集中在这里：
//! 单次上传、启动 / 停止监视、历史查询与删除、凭据读写、目标列表。
//! 所有调用返回 `Result<T, AppError>`，由前端自行映射为退出码或提示。
//!
//! # 实现思路
//!
//! - `open` 按目录加载配置、选择凭据后端、打开历史库，各组件以 `Arc` 共享。
//! - 监视任务由 `tokio::spawn` 托管，持有 `CancellationToken` 与状态通道接收端；
//!   `stop_watch` 取消令牌并等待任务结束，返回累计计数。

use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::clipboard::{ArboardSource, ClipboardSource, ClipboardWatcher};
use crate::config::{self, AppConfig, DestinationSummary};
use crate::credentials::{CredentialStore, MasterPassphrase};
use crate::db::{HistoryEntry, HistoryStore};
use crate::error::AppError;
use crate::orchestrator::{UploadOrchestrator, UploadReport, WatchStats, WatchStatus};
use crate::storage::{AppPaths, StorageInfo};
use crate::upload::{ProgressCallback, Uploader};

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<WatchStats>,
    status: watch::Receiver<WatchStatus>,
}

pub struct ClipshotService {
    config: Arc<AppConfig>,
    credentials: Arc<CredentialStore>,
    history: Option<Arc<HistoryStore>>,
    orchestrator: Arc<UploadOrchestrator>,
    watch_task: Mutex<Option<WatchTask>>,
}

impl ClipshotService {
    /// 按应用目录加载配置并构建全部组件
    pub fn open(paths: &AppPaths) -> Result<Self, AppError> {
        let config = config::load_config_from_path(&paths.config_file())?;
        let credentials = CredentialStore::from_config(
            &config.security,
            paths.credentials_file(),
            MasterPassphrase::from_env(),
        )?;
        let history = if config.history.enabled {
            let root = config
                .history
                .resolve_storage_path(&paths.default_history_dir());
            Some(Arc::new(HistoryStore::open(&root, &config.history)?))
        } else {
            log::info!("ℹ️ 上传历史未启用");
            None
        };

        Ok(Self::assemble(
            config,
            Arc::new(credentials),
            history,
            Uploader::default(),
            None,
            Some(Box::new(ArboardSource)),
        ))
    }

    /// 由已构建的组件组装（测试或嵌入方使用）
    pub fn from_parts(
        config: AppConfig,
        credentials: Arc<CredentialStore>,
        history: Option<Arc<HistoryStore>>,
        uploader: Uploader,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self::assemble(config, credentials, history, uploader, progress, None)
    }

    fn assemble(
        config: AppConfig,
        credentials: Arc<CredentialStore>,
        history: Option<Arc<HistoryStore>>,
        uploader: Uploader,
        progress: Option<ProgressCallback>,
        clipboard: Option<Box<dyn ClipboardSource>>,
    ) -> Self {
        let config = Arc::new(config);
        let mut orchestrator = UploadOrchestrator::new(
            config.clone(),
            credentials.clone(),
            history.clone(),
            uploader,
        );
        if let Some(progress) = progress {
            orchestrator = orchestrator.with_progress(progress);
        }
        if let Some(clipboard) = clipboard {
            orchestrator = orchestrator.with_clipboard(clipboard);
        }

        Self {
            config,
            credentials,
            history,
            orchestrator: Arc::new(orchestrator),
            watch_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // ========================================================================
    // 上传
    // ========================================================================

    pub async fn upload_once(
        &self,
        bytes: Bytes,
        destination: Option<&str>,
        filename_override: Option<&str>,
    ) -> Result<UploadReport, AppError> {
        self.orchestrator
            .upload_once(bytes, destination, filename_override)
            .await
    }

    /// 读取本地文件后上传
    pub async fn upload_file(
        &self,
        path: &Path,
        destination: Option<&str>,
        filename_override: Option<&str>,
    ) -> Result<UploadReport, AppError> {
        let bytes = std::fs::read(path).map_err(|e| {
            AppError::StorageIo(format!("读取文件 '{}' 失败: {}", path.display(), e))
        })?;
        self.upload_once(Bytes::from(bytes), destination, filename_override)
            .await
    }

    /// 上传当前剪贴板中的图片
    pub async fn upload_clipboard(&self, destination: Option<&str>) -> Result<UploadReport, AppError> {
        let png = tokio::task::spawn_blocking(|| {
            let mut watcher = ClipboardWatcher::system();
            let snapshot = watcher
                .poll_once()
                .ok_or_else(|| AppError::Clipboard("剪贴板中没有图片".to_string()))?;
            watcher.encode_png(&snapshot)
        })
        .await
        .map_err(|e| AppError::Clipboard(format!("读取剪贴板任务失败: {}", e)))??;
        self.upload_once(png, destination, None).await
    }

    // ========================================================================
    // 监视模式
    // ========================================================================

    /// 使用系统剪贴板启动监视
    pub async fn start_watch(&self, destination: Option<&str>) -> Result<(), AppError> {
        self.start_watch_with(ClipboardWatcher::system(), destination)
            .await
    }

    /// 启动监视；目标与凭据解析失败立即返回错误，成功后在后台运行
    pub async fn start_watch_with(
        &self,
        watcher: ClipboardWatcher,
        destination: Option<&str>,
    ) -> Result<(), AppError> {
        let mut slot = self.lock_watch_task()?;
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return Err(AppError::ConfigInvalid("监视模式已在运行".to_string()));
        }

        let plan = self.orchestrator.prepare_watch(destination)?;
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(WatchStatus::default());

        let orchestrator = self.orchestrator.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            orchestrator
                .run_watch(plan, watcher, task_cancel, status_tx)
                .await
        });

        *slot = Some(WatchTask {
            cancel,
            handle,
            status: status_rx,
        });
        Ok(())
    }

    /// 停止监视并等待循环退出；未在监视时返回 `None`
    pub async fn stop_watch(&self) -> Result<Option<WatchStats>, AppError> {
        let Some(task) = self.lock_watch_task()?.take() else {
            return Ok(None);
        };
        task.cancel.cancel();
        let stats = task.handle.await.map_err(|e| {
            AppError::Clipboard(format!("监视任务异常终止: {}", e))
        })?;
        Ok(Some(stats))
    }

    pub fn is_watching(&self) -> bool {
        self.lock_watch_task()
            .map(|slot| slot.as_ref().is_some_and(|task| !task.handle.is_finished()))
            .unwrap_or(false)
    }

    /// 当前监视状态快照
    pub fn watch_status(&self) -> Option<WatchStatus> {
        let slot = self.lock_watch_task().ok()?;
        slot.as_ref().map(|task| task.status.borrow().clone())
    }

    fn lock_watch_task(&self) -> Result<std::sync::MutexGuard<'_, Option<WatchTask>>, AppError> {
        self.watch_task
            .lock()
            .map_err(|e| AppError::Clipboard(format!("获取监视任务锁失败: {}", e)))
    }

    // ========================================================================
    // 历史
    // ========================================================================

    fn history_store(&self) -> Result<&Arc<HistoryStore>, AppError> {
        self.history
            .as_ref()
            .ok_or_else(|| AppError::ConfigInvalid("上传历史未启用".to_string()))
    }

    pub fn list_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, AppError> {
        self.history_store()?.get_recent(limit)
    }

    pub fn search_history(&self, query: &str) -> Result<Vec<HistoryEntry>, AppError> {
        self.history_store()?.search(query)
    }

    /// 删除一条历史；返回是否确实删除了记录
    pub fn delete_history_entry(&self, id: i64) -> Result<bool, AppError> {
        self.history_store()?.delete(id)
    }

    pub fn clear_history(&self) -> Result<(), AppError> {
        self.history_store()?.clear_all()
    }

    pub fn verify_history(&self) -> Result<(), AppError> {
        self.history_store()?.verify()
    }

    pub fn history_storage_info(&self) -> Result<StorageInfo, AppError> {
        Ok(self.history_store()?.storage_info())
    }

    // ========================================================================
    // 凭据与目标
    // ========================================================================

    pub fn get_credential(&self, key: &str) -> Result<Zeroizing<String>, AppError> {
        self.credentials.get_string(key)
    }

    pub fn set_credential(&self, key: &str, secret: &str) -> Result<(), AppError> {
        self.credentials.set_string(key, secret)
    }

    pub fn delete_credential(&self, key: &str) -> Result<(), AppError> {
        self.credentials.delete(key)
    }

    pub fn list_credential_keys(&self) -> Result<Vec<String>, AppError> {
        self.credentials.list_keys()
    }

    pub fn list_destinations(&self) -> Vec<DestinationSummary> {
        self.config.list_destinations()
    }
}
