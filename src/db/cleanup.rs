//! 清理与一致性子模块
//!
//! ## 职责
//! - 保留策略：条数上限与天数上限各自独立计算，取并集删除
//! - 删除文件时容忍 `NotFound`（已被清理或从未写入）
//! - 扫描未被任何行引用的孤儿文件，以及指向缺失文件的悬空引用

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;

use crate::error::AppError;

use super::assets::AssetLayout;
use super::history;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

pub(crate) fn remove_asset_file(path: &Path) -> Result<(), AppError> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AppError::StorageIo(format!(
            "删除文件失败 '{}': {}",
            path.display(),
            e
        ))),
    }
}

/// 尽力删除一组文件，失败只记录日志
pub(crate) fn remove_asset_files(paths: &[String]) {
    for path in paths {
        if let Err(e) = remove_asset_file(Path::new(path)) {
            log::warn!("⚠️ {}", e);
        }
    }
}

/// 按保留策略选出要删除的条目。
///
/// `max_entries == 0` 或 `retention_days == 0` 表示对应维度不限制。
pub(crate) fn retention_victims(
    conn: &Connection,
    max_entries: usize,
    retention_days: u32,
    now_ms: i64,
) -> Result<Vec<i64>, AppError> {
    let mut victims = BTreeSet::new();

    if max_entries > 0 {
        victims.extend(history::overflow_ids(conn, max_entries)?);
    }
    if retention_days > 0 {
        let cutoff = now_ms.saturating_sub(i64::from(retention_days) * MILLIS_PER_DAY);
        victims.extend(history::expired_ids(conn, cutoff)?);
    }

    Ok(victims.into_iter().collect())
}

/// 一致性检查结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// 行存在但文件缺失：(id, 路径)
    pub dangling: Vec<(i64, String)>,
    /// 文件存在但没有行引用
    pub orphans: Vec<PathBuf>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.dangling.is_empty() && self.orphans.is_empty()
    }
}

pub(crate) fn inspect(conn: &Connection, layout: &AssetLayout) -> Result<ConsistencyReport, AppError> {
    let references = history::referenced_paths(conn)?;
    let referenced: HashSet<PathBuf> = references.iter().map(|(_, p)| PathBuf::from(p)).collect();

    let dangling = references
        .into_iter()
        .filter(|(_, path)| !Path::new(path).is_file())
        .collect();

    let mut orphans = Vec::new();
    for dir in layout.dirs() {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(AppError::StorageIo(format!(
                    "读取目录 '{}' 失败: {}",
                    dir.display(),
                    e
                )));
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && !referenced.contains(&path) {
                orphans.push(path);
            }
        }
    }
    orphans.sort();

    Ok(ConsistencyReport { dangling, orphans })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::initialize_schema;
    use crate::db::{NewHistoryEntry, UploadStatus};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}", prefix, nanos))
    }

    fn insert(conn: &Connection, created_at: i64, thumb: Option<&str>) -> i64 {
        let entry = NewHistoryEntry {
            filename: format!("{}.png", created_at),
            remote_path: format!("/r/{}.png", created_at),
            url: None,
            destination: "prod".to_string(),
            size: 1,
            created_at,
            status: UploadStatus::Uploaded,
            error: None,
        };
        history::insert_entry(conn, &entry, thumb, None).expect("insert")
    }

    #[test]
    fn remove_missing_file_is_ok() {
        let path = unique_temp_dir("clipshot_missing_file").join("nope.png");
        remove_asset_file(&path).expect("missing file tolerated");
    }

    #[test]
    fn retention_takes_union_of_both_bounds() {
        let conn = Connection::open_in_memory().expect("memory db");
        initialize_schema(&conn).expect("schema");
        let now = 100 * MILLIS_PER_DAY;
        let old = insert(&conn, now - 10 * MILLIS_PER_DAY, None);
        let mid = insert(&conn, now - 2 * MILLIS_PER_DAY, None);
        let new = insert(&conn, now, None);

        // 仅条数：删最旧的一条
        assert_eq!(retention_victims(&conn, 2, 0, now).expect("victims"), vec![old]);
        // 仅天数：删 5 天前的
        assert_eq!(retention_victims(&conn, 0, 5, now).expect("victims"), vec![old]);
        // 两者同时：天数更严格时以天数为准
        assert_eq!(retention_victims(&conn, 3, 1, now).expect("victims"), vec![old, mid]);
        // 都不限制
        assert!(retention_victims(&conn, 0, 0, now).expect("victims").is_empty());
        let _ = new;
    }

    #[test]
    fn inspect_reports_dangling_and_orphans() {
        let root = unique_temp_dir("clipshot_inspect");
        let layout = AssetLayout::new(&root);
        layout.ensure().expect("layout");

        let conn = Connection::open_in_memory().expect("memory db");
        initialize_schema(&conn).expect("schema");

        let present = layout.thumbnails_dir.join("present.png");
        fs::write(&present, b"x").expect("write present");
        let orphan = layout.images_dir.join("orphan.png");
        fs::write(&orphan, b"x").expect("write orphan");
        let missing = layout.thumbnails_dir.join("missing.png");

        insert(&conn, 1, Some(&present.to_string_lossy()));
        let dangling_id = insert(&conn, 2, Some(&missing.to_string_lossy()));

        let report = inspect(&conn, &layout).expect("inspect");
        assert_eq!(report.dangling, vec![(dangling_id, missing.to_string_lossy().to_string())]);
        assert_eq!(report.orphans, vec![orphan]);
        assert!(!report.is_clean());

        let _ = fs::remove_dir_all(&root);
    }
}
