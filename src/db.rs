//! 上传历史模块（HistoryStore）
//!
//! # 设计思路
//!
//! 一张 SQLite 表记录每次上传尝试，磁盘上按历史模式保存派生文件
//! （`thumbnails/` 缩略图、`images/` 全尺寸副本）。两者必须保持一致：
//! 行存在则其引用的文件存在；文件存在则必有行引用它。
//!
//! # 实现思路
//!
//! - 单写者：所有写操作（插入 / 删除 / 保留清理）经同一把 `Mutex<Connection>` 串行化。
//! - 读操作走第二条只读连接，WAL 模式下不阻塞写者。
//! - `add`：先在写锁内写文件，再插入行；插入失败时 `AssetGuard` 自动删除已写文件。
//! - `delete` / 保留清理：先在事务内删行，提交后尽力删除文件（`NotFound` 视为成功）。
//! - 打开时清扫孤儿文件，修复上次进程在“写文件 → 插行”之间崩溃留下的残留。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use crate::config::{HistoryConfig, HistoryMode};
use crate::error::AppError;
use crate::image_handler::ImageProcessor;
use crate::storage::{self, StorageInfo};

mod assets;
mod cleanup;
mod history;
mod schema;

pub use cleanup::ConsistencyReport;

const DB_FILE_NAME: &str = "history.db";

// ============================================================================
// 数据模型
// ============================================================================

/// 上传结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Uploaded,
    Failed,
}

impl UploadStatus {
    fn as_db(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw {
            "failed" => Self::Failed,
            _ => Self::Uploaded,
        }
    }
}

/// 待写入的历史记录
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub filename: String,
    pub remote_path: String,
    pub url: Option<String>,
    pub destination: String,
    pub size: u64,
    /// 毫秒时间戳
    pub created_at: i64,
    pub status: UploadStatus,
    pub error: Option<String>,
}

impl NewHistoryEntry {
    pub fn uploaded(
        filename: impl Into<String>,
        remote_path: impl Into<String>,
        url: Option<String>,
        destination: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            filename: filename.into(),
            remote_path: remote_path.into(),
            url,
            destination: destination.into(),
            size,
            created_at: chrono::Utc::now().timestamp_millis(),
            status: UploadStatus::Uploaded,
            error: None,
        }
    }

    pub fn failed(
        filename: impl Into<String>,
        remote_path: impl Into<String>,
        destination: impl Into<String>,
        size: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            remote_path: remote_path.into(),
            url: None,
            destination: destination.into(),
            size,
            created_at: chrono::Utc::now().timestamp_millis(),
            status: UploadStatus::Failed,
            error: Some(error.into()),
        }
    }
}

/// 一条已持久化的上传记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub filename: String,
    pub remote_path: String,
    pub url: Option<String>,
    pub destination: String,
    pub size: u64,
    pub created_at: i64,
    pub thumbnail_path: Option<String>,
    pub local_copy_path: Option<String>,
    pub status: UploadStatus,
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn created_at_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.created_at)
    }
}

// ============================================================================
// HistoryStore
// ============================================================================

pub struct HistoryStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    root: PathBuf,
    layout: assets::AssetLayout,
    mode: HistoryMode,
    max_entries: usize,
    retention_days: u32,
    processor: ImageProcessor,
}

impl HistoryStore {
    /// 打开（必要时创建）位于 `root` 的历史库。
    pub fn open(root: &Path, config: &HistoryConfig) -> Result<Self, AppError> {
        Self::open_with_processor(root, config, ImageProcessor::default())
    }

    pub fn open_with_processor(
        root: &Path,
        config: &HistoryConfig,
        processor: ImageProcessor,
    ) -> Result<Self, AppError> {
        let root = std::path::absolute(root).map_err(|e| {
            AppError::StorageIo(format!("解析历史目录 '{}' 失败: {}", root.display(), e))
        })?;
        storage::ensure_dir(&root)?;
        let layout = assets::AssetLayout::new(&root);
        layout.ensure()?;

        let db_path = root.join(DB_FILE_NAME);
        log::info!("🗄️ 历史数据库路径: {}", db_path.display());

        let writer = Connection::open(&db_path)
            .map_err(|e| AppError::Database(format!("打开数据库失败: {}", e)))?;
        schema::initialize_schema(&writer)?;

        let reader = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| AppError::Database(format!("打开只读连接失败: {}", e)))?;

        let store = Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            root,
            layout,
            mode: config.mode,
            max_entries: config.max_entries,
            retention_days: config.retention_days,
            processor,
        };

        let swept = store.sweep_orphans()?;
        if swept > 0 {
            log::warn!("🧹 打开历史库时清理了 {} 个孤儿文件", swept);
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> HistoryMode {
        self.mode
    }

    fn with_writer<T>(&self, op: impl FnOnce(&Connection) -> Result<T, AppError>) -> Result<T, AppError> {
        let conn = self
            .writer
            .lock()
            .map_err(|e| AppError::Database(format!("获取数据库写锁失败: {}", e)))?;
        op(&conn)
    }

    fn with_reader<T>(&self, op: impl FnOnce(&Connection) -> Result<T, AppError>) -> Result<T, AppError> {
        let conn = self
            .reader
            .lock()
            .map_err(|e| AppError::Database(format!("获取数据库读锁失败: {}", e)))?;
        op(&conn)
    }

    /// 插入一条记录，并按历史模式写入派生文件。
    ///
    /// 文件写入失败则不插行；插行失败则删除已写文件。成功后执行一次保留清理。
    pub fn add(&self, entry: &NewHistoryEntry, image: Option<&[u8]>) -> Result<i64, AppError> {
        let id = self.with_writer(|conn| {
            let mut guard = assets::AssetGuard::default();
            let mut thumbnail_path = None;
            let mut local_copy_path = None;

            if let Some(bytes) = image {
                if self.mode.keeps_thumbnail() {
                    let thumbnail = self.processor.thumbnail(bytes)?;
                    let path = assets::write_thumbnail(
                        &self.layout,
                        &entry.filename,
                        entry.created_at,
                        &thumbnail.png,
                    )?;
                    guard.track(&path);
                    thumbnail_path = Some(path.to_string_lossy().to_string());
                }
                if self.mode.keeps_full_copy() {
                    let kind = self.processor.detect_format(bytes)?;
                    let path = assets::write_full_copy(
                        &self.layout,
                        &entry.filename,
                        entry.created_at,
                        kind.extension,
                        bytes,
                    )?;
                    guard.track(&path);
                    local_copy_path = Some(path.to_string_lossy().to_string());
                }
            }

            let id = history::insert_entry(
                conn,
                entry,
                thumbnail_path.as_deref(),
                local_copy_path.as_deref(),
            )?;
            guard.commit();
            Ok(id)
        })?;

        log::info!(
            "📝 已记录上传历史 #{} {} ({:?})",
            id,
            entry.filename,
            entry.status
        );

        if let Err(e) = self.prune() {
            log::warn!("⚠️ 保留策略清理失败: {}", e);
        }
        Ok(id)
    }

    /// 最新优先，最多 `limit` 条
    pub fn get_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, AppError> {
        self.with_reader(|conn| history::query_recent(conn, limit))
    }

    /// 文件名或 URL 子串匹配，最新优先
    pub fn search(&self, query: &str) -> Result<Vec<HistoryEntry>, AppError> {
        self.with_reader(|conn| history::query_search(conn, query))
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<HistoryEntry>, AppError> {
        self.with_reader(|conn| history::query_by_id(conn, id))
    }

    pub fn count(&self) -> Result<usize, AppError> {
        self.with_reader(history::count)
    }

    /// 删除一条记录及其文件；返回该记录是否存在。
    pub fn delete(&self, id: i64) -> Result<bool, AppError> {
        self.with_writer(|conn| {
            if history::query_by_id(conn, id)?.is_none() {
                return Ok(false);
            }
            let paths = history::delete_entries(conn, &[id])?;
            cleanup::remove_asset_files(&paths);
            log::info!("🗑️ 已删除历史记录 #{}", id);
            Ok(true)
        })
    }

    /// 执行保留策略，返回删除的条目数。
    pub fn prune(&self) -> Result<usize, AppError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.with_writer(|conn| {
            let victims = cleanup::retention_victims(conn, self.max_entries, self.retention_days, now)?;
            if victims.is_empty() {
                return Ok(0);
            }
            let paths = history::delete_entries(conn, &victims)?;
            cleanup::remove_asset_files(&paths);
            log::info!("🧹 保留策略清理了 {} 条历史", victims.len());
            Ok(victims.len())
        })
    }

    pub fn clear_all(&self) -> Result<(), AppError> {
        self.with_writer(|conn| {
            let paths = history::delete_all(conn)?;
            cleanup::remove_asset_files(&paths);
            Ok(())
        })?;
        self.sweep_orphans()?;
        log::warn!("🗑️ 已清空全部上传历史");
        Ok(())
    }

    /// 删除没有任何行引用的派生文件，返回删除数量。
    pub fn sweep_orphans(&self) -> Result<usize, AppError> {
        self.with_writer(|conn| {
            let report = cleanup::inspect(conn, &self.layout)?;
            for orphan in &report.orphans {
                cleanup::remove_asset_file(orphan)?;
            }
            Ok(report.orphans.len())
        })
    }

    /// 返回当前的一致性报告（不做修复）。
    pub fn inspect(&self) -> Result<ConsistencyReport, AppError> {
        self.with_writer(|conn| cleanup::inspect(conn, &self.layout))
    }

    /// 存在悬空引用或孤儿文件时返回 `StorageInconsistent`。
    pub fn verify(&self) -> Result<(), AppError> {
        let report = self.inspect()?;
        if report.is_clean() {
            return Ok(());
        }
        Err(AppError::StorageInconsistent(format!(
            "{} 个悬空引用，{} 个孤儿文件",
            report.dangling.len(),
            report.orphans.len()
        )))
    }

    pub fn storage_info(&self) -> StorageInfo {
        storage::dir_info(&self.root)
    }
}
