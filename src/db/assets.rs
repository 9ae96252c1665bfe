//! 派生文件子模块
//!
//! ## 职责
//! - 计算缩略图 / 全尺寸副本的落盘路径
//! - 以 `create_new` 写入，绝不覆盖已有文件
//! - `AssetGuard`：行提交成功前写下的文件，在 Drop 时自动删除
//!
//! 缩略图位于 `thumbnails/`，全尺寸副本位于 `images/`。

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::storage::ensure_dir;

const MAX_NAME_LEN: usize = 64;
const MAX_CREATE_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone)]
pub(crate) struct AssetLayout {
    pub thumbnails_dir: PathBuf,
    pub images_dir: PathBuf,
}

impl AssetLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            thumbnails_dir: root.join("thumbnails"),
            images_dir: root.join("images"),
        }
    }

    pub fn ensure(&self) -> Result<(), AppError> {
        ensure_dir(&self.thumbnails_dir)?;
        ensure_dir(&self.images_dir)
    }

    pub fn dirs(&self) -> [&Path; 2] {
        [&self.thumbnails_dir, &self.images_dir]
    }
}

/// 只保留字母数字与 `-_.`，其余替换为 `_`，并限制长度
pub(crate) fn sanitize_filename(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    let trimmed = sanitized.trim_matches('.');
    if trimmed.is_empty() {
        "image".to_string()
    } else {
        trimmed.to_string()
    }
}

fn file_stem(filename: &str) -> &str {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
}

/// 在 `dir` 下创建一个不存在的文件并写入内容。
fn write_unique(dir: &Path, base: &str, ext: &str, bytes: &[u8]) -> Result<PathBuf, AppError> {
    for attempt in 0..MAX_CREATE_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{}.{}", base, ext)
        } else {
            format!("{}_{}.{}", base, attempt, ext)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    return Err(AppError::StorageIo(format!(
                        "写入文件 '{}' 失败: {}",
                        path.display(),
                        e
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(AppError::StorageIo(format!(
                    "创建文件 '{}' 失败: {}",
                    path.display(),
                    e
                )));
            }
        }
    }
    Err(AppError::StorageIo(format!(
        "无法在 '{}' 下为 '{}' 分配唯一文件名",
        dir.display(),
        base
    )))
}

pub(crate) fn write_thumbnail(
    layout: &AssetLayout,
    filename: &str,
    created_at: i64,
    png: &[u8],
) -> Result<PathBuf, AppError> {
    let base = format!("thumb_{}_{}", created_at, sanitize_filename(file_stem(filename)));
    write_unique(&layout.thumbnails_dir, &base, "png", png)
}

pub(crate) fn write_full_copy(
    layout: &AssetLayout,
    filename: &str,
    created_at: i64,
    extension: &str,
    bytes: &[u8],
) -> Result<PathBuf, AppError> {
    let base = format!("{}_{}", created_at, sanitize_filename(file_stem(filename)));
    write_unique(&layout.images_dir, &base, extension, bytes)
}

/// 尚未被数据库行认领的文件；未调用 `commit` 就被 Drop 时删除它们
#[derive(Debug, Default)]
pub(crate) struct AssetGuard {
    pending: Vec<PathBuf>,
}

impl AssetGuard {
    pub fn track(&mut self, path: &Path) {
        self.pending.push(path.to_path_buf());
    }

    pub fn commit(mut self) {
        self.pending.clear();
    }
}

impl Drop for AssetGuard {
    fn drop(&mut self) {
        for path in self.pending.drain(..) {
            if let Err(e) = super::cleanup::remove_asset_file(&path) {
                log::warn!("⚠️ 回滚时删除文件失败: {}", e);
            } else {
                log::debug!("↩️ 已回滚未提交的文件: {}", path.display());
            }
        }
    }
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

    #[test]
    fn sanitize_replaces_separators_and_limits_length() {
        assert_eq!(sanitize_filename("a/b\\c d.png"), "a_b_c_d.png");
        assert_eq!(sanitize_filename("..."), "image");
        assert_eq!(sanitize_filename(&"x".repeat(200)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn same_name_never_overwrites() {
        let root = unique_temp_dir("clipshot_assets_unique");
        let layout = AssetLayout::new(&root);
        layout.ensure().expect("create layout");

        let first = write_thumbnail(&layout, "shot.png", 1, b"one").expect("first");
        let second = write_thumbnail(&layout, "shot.png", 1, b"two").expect("second");
        assert_ne!(first, second);
        assert_eq!(fs::read(&first).expect("read first"), b"one");
        assert_eq!(fs::read(&second).expect("read second"), b"two");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn guard_removes_uncommitted_files() {
        let root = unique_temp_dir("clipshot_assets_guard");
        let layout = AssetLayout::new(&root);
        layout.ensure().expect("create layout");

        let rolled_back = write_full_copy(&layout, "a.png", 1, "png", b"data").expect("write");
        {
            let mut guard = AssetGuard::default();
            guard.track(&rolled_back);
        }
        assert!(!rolled_back.exists());

        let kept = write_full_copy(&layout, "b.png", 1, "png", b"data").expect("write");
        let mut guard = AssetGuard::default();
        guard.track(&kept);
        guard.commit();
        assert!(kept.exists());

        let _ = fs::remove_dir_all(&root);
    }
}
