//! 历史行读写子模块
//!
//! 只负责 SQL，不碰磁盘文件；文件生命周期由上层 `HistoryStore` 与 `cleanup` 协调。

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::AppError;

use super::{HistoryEntry, NewHistoryEntry, UploadStatus};

const SELECT_COLUMNS: &str = "id, filename, remote_path, url, destination, size, created_at,
     thumbnail_path, local_copy_path, status, error";

fn map_entry(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let size: i64 = row.get(5)?;
    let status: String = row.get(9)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        filename: row.get(1)?,
        remote_path: row.get(2)?,
        url: row.get(3)?,
        destination: row.get(4)?,
        size: size.max(0) as u64,
        created_at: row.get(6)?,
        thumbnail_path: row.get(7)?,
        local_copy_path: row.get(8)?,
        status: UploadStatus::from_db(&status),
        error: row.get(10)?,
    })
}

fn collect_entries(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<HistoryEntry>, AppError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| AppError::Database(format!("准备查询失败: {}", e)))?;
    let rows = stmt
        .query_map(args, map_entry)
        .map_err(|e| AppError::Database(format!("查询历史失败: {}", e)))?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.map_err(|e| AppError::Database(format!("读取历史行失败: {}", e)))?);
    }
    Ok(entries)
}

pub(super) fn insert_entry(
    conn: &Connection,
    entry: &NewHistoryEntry,
    thumbnail_path: Option<&str>,
    local_copy_path: Option<&str>,
) -> Result<i64, AppError> {
    let size = i64::try_from(entry.size)
        .map_err(|_| AppError::Database(format!("文件大小超出范围: {}", entry.size)))?;
    conn.execute(
        "INSERT INTO history
            (filename, remote_path, url, destination, size, created_at,
             thumbnail_path, local_copy_path, status, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.filename,
            entry.remote_path,
            entry.url,
            entry.destination,
            size,
            entry.created_at,
            thumbnail_path,
            local_copy_path,
            entry.status.as_db(),
            entry.error,
        ],
    )
    .map_err(|e| AppError::Database(format!("插入历史记录失败: {}", e)))?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn query_recent(conn: &Connection, limit: usize) -> Result<Vec<HistoryEntry>, AppError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM history ORDER BY created_at DESC, id DESC LIMIT ?1"
    );
    collect_entries(conn, &sql, &[&limit])
}

/// `LIKE` 通配符转义，配合 `ESCAPE '\'` 使用
fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// 文件名或 URL 子串匹配（ASCII 大小写不敏感）
pub(super) fn query_search(conn: &Connection, query: &str) -> Result<Vec<HistoryEntry>, AppError> {
    let pattern = format!("%{}%", escape_like(query));
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM history
         WHERE filename LIKE ?1 ESCAPE '\\' OR IFNULL(url, '') LIKE ?1 ESCAPE '\\'
         ORDER BY created_at DESC, id DESC"
    );
    collect_entries(conn, &sql, &[&pattern])
}

pub(super) fn query_by_id(conn: &Connection, id: i64) -> Result<Option<HistoryEntry>, AppError> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM history WHERE id = ?1");
    conn.query_row(&sql, params![id], map_entry)
        .optional()
        .map_err(|e| AppError::Database(format!("按 ID 查询历史失败: {}", e)))
}

pub(super) fn count(conn: &Connection) -> Result<usize, AppError> {
    let total: i64 = conn
        .query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))
        .map_err(|e| AppError::Database(format!("查询总数失败: {}", e)))?;
    Ok(total.max(0) as usize)
}

/// 超出条数上限的条目（按新到旧保留前 `max_entries` 条）
pub(super) fn overflow_ids(conn: &Connection, max_entries: usize) -> Result<Vec<i64>, AppError> {
    let keep = i64::try_from(max_entries).unwrap_or(i64::MAX);
    let mut stmt = conn
        .prepare("SELECT id FROM history ORDER BY created_at DESC, id DESC LIMIT -1 OFFSET ?1")
        .map_err(|e| AppError::Database(format!("准备超额查询失败: {}", e)))?;
    let rows = stmt
        .query_map(params![keep], |row| row.get::<_, i64>(0))
        .map_err(|e| AppError::Database(format!("查询超额条目失败: {}", e)))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(format!("读取超额条目失败: {}", e)))
}

/// 创建时间早于 `cutoff`（毫秒）的条目
pub(super) fn expired_ids(conn: &Connection, cutoff: i64) -> Result<Vec<i64>, AppError> {
    let mut stmt = conn
        .prepare("SELECT id FROM history WHERE created_at < ?1")
        .map_err(|e| AppError::Database(format!("准备过期查询失败: {}", e)))?;
    let rows = stmt
        .query_map(params![cutoff], |row| row.get::<_, i64>(0))
        .map_err(|e| AppError::Database(format!("查询过期条目失败: {}", e)))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(format!("读取过期条目失败: {}", e)))
}

/// 删除给定条目，返回它们引用的文件路径（供事务提交后清理）。
pub(super) fn delete_entries(conn: &Connection, ids: &[i64]) -> Result<Vec<String>, AppError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
    let select_sql = format!(
        "SELECT thumbnail_path, local_copy_path FROM history WHERE id IN ({})",
        placeholders.join(",")
    );
    let delete_sql = format!("DELETE FROM history WHERE id IN ({})", placeholders.join(","));

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| AppError::Database(format!("开始删除事务失败: {}", e)))?;

    let mut paths = Vec::new();
    {
        let mut stmt = tx
            .prepare(&select_sql)
            .map_err(|e| AppError::Database(format!("准备查询待删条目失败: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(|e| AppError::Database(format!("查询待删条目失败: {}", e)))?;
        for row in rows {
            let (thumb, copy) = row.map_err(|e| AppError::Database(format!("读取待删条目失败: {}", e)))?;
            paths.extend(thumb);
            paths.extend(copy);
        }
    }

    tx.execute(&delete_sql, params_from_iter(ids.iter()))
        .map_err(|e| AppError::Database(format!("删除历史记录失败: {}", e)))?;
    tx.commit()
        .map_err(|e| AppError::Database(format!("提交删除事务失败: {}", e)))?;

    Ok(paths)
}

/// 删除全部条目，返回被引用的文件路径
pub(super) fn delete_all(conn: &Connection) -> Result<Vec<String>, AppError> {
    let paths = referenced_paths(conn)?;
    conn.execute("DELETE FROM history", [])
        .map_err(|e| AppError::Database(format!("清空历史失败: {}", e)))?;
    Ok(paths.into_iter().map(|(_, path)| path).collect())
}

/// 所有仍被引用的 (id, 文件路径)
pub(super) fn referenced_paths(conn: &Connection) -> Result<Vec<(i64, String)>, AppError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, thumbnail_path FROM history WHERE thumbnail_path IS NOT NULL
             UNION ALL
             SELECT id, local_copy_path FROM history WHERE local_copy_path IS NOT NULL",
        )
        .map_err(|e| AppError::Database(format!("准备引用查询失败: {}", e)))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| AppError::Database(format!("查询文件引用失败: {}", e)))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(format!("读取文件引用失败: {}", e)))
}
