//! 应用目录管理模块
//!
//! # 设计思路
//!
//! 统一管理配置文件、凭据文件与历史数据的落盘位置，支持用户覆盖，
//! 并在目录不存在时自动创建。
//!
//! # 实现思路
//!
//! - 配置目录优先读 `CLIPSHOT_CONFIG_DIR`，否则使用 `dirs::config_dir()/clipshot`。
//! - 数据目录使用 `dirs::data_dir()/clipshot`，历史库默认位于其 `history` 子目录。
//! - 配置中出现的 `~/...` 路径统一通过 `expand_home` 展开。
//! - 所有可能失败的操作均返回 `Result`，不使用 `expect()` / `unwrap()`。

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;

const APP_DIR_NAME: &str = "clipshot";
const CONFIG_DIR_ENV: &str = "CLIPSHOT_CONFIG_DIR";

/// 存储目录信息
#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub path: String,
    pub total_size: u64,
    pub file_count: u64,
}

/// 应用使用的各类目录
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// 根据环境变量与平台约定解析目录（不创建）。
    pub fn resolve() -> Result<Self, AppError> {
        let config_dir = match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::config_dir()
                .ok_or_else(|| AppError::StorageIo("无法确定系统配置目录".to_string()))?
                .join(APP_DIR_NAME),
        };
        let data_dir = dirs::data_dir()
            .ok_or_else(|| AppError::StorageIo("无法确定系统数据目录".to_string()))?
            .join(APP_DIR_NAME);
        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// 以单一根目录构造（测试与便携模式使用）。
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.config_dir.join("credentials.json")
    }

    pub fn default_history_dir(&self) -> PathBuf {
        self.data_dir.join("history")
    }
}

/// 展开以 `~` 开头的路径；无法获取用户目录时原样返回。
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// 确保目录存在。
pub fn ensure_dir(path: &Path) -> Result<(), AppError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            AppError::StorageIo(format!("创建目录 '{}' 失败: {}", path.display(), e))
        })?;
    }
    Ok(())
}

/// 统计目录下（含一级子目录）的文件数与占用大小。
pub fn dir_info(dir: &Path) -> StorageInfo {
    let mut total_size: u64 = 0;
    let mut file_count: u64 = 0;

    let mut pending = vec![(dir.to_path_buf(), 0u8)];
    while let Some((current, depth)) = pending.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_file() {
                total_size += metadata.len();
                file_count += 1;
            } else if metadata.is_dir() && depth == 0 {
                pending.push((entry.path(), depth + 1));
            }
        }
    }

    StorageInfo {
        path: dir.to_string_lossy().to_string(),
        total_size,
        file_count,
    }
}
