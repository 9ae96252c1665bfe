//! Schema 初始化子模块
//!
//! ## 职责
//! - 创建/迁移上传历史表与索引
//! - 设置 SQLite 运行参数（WAL）
//!
//! ## 输入/输出
//! - 输入：`&Connection`
//! - 输出：`Result<(), AppError>`
//!
//! ## 错误语义
//! - DDL 失败统一映射为 `AppError::Database`

use rusqlite::Connection;

use crate::error::AppError;

const SCHEMA_VERSION: i64 = 2;

fn get_user_version(conn: &Connection) -> Result<i64, AppError> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| AppError::Database(format!("读取数据库版本失败: {}", e)))
}

fn set_user_version(conn: &Connection, version: i64) -> Result<(), AppError> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .map_err(|e| AppError::Database(format!("写入数据库版本失败: {}", e)))
}

fn create_base_tables(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL,
            remote_path TEXT NOT NULL,
            url TEXT,
            destination TEXT NOT NULL,
            size INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            thumbnail_path TEXT,
            local_copy_path TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_history_created_at ON history(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_history_filename ON history(filename);"
    ).map_err(|e| AppError::Database(format!("创建历史表失败: {}", e)))
}

/// v2：区分成功与失败的上传记录
fn add_status_columns(conn: &Connection) -> Result<(), AppError> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| AppError::Database(format!("开始 v2 迁移事务失败: {}", e)))?;

    tx.execute_batch(
        "ALTER TABLE history ADD COLUMN status TEXT NOT NULL DEFAULT 'uploaded'
            CHECK (status IN ('uploaded', 'failed'));
         ALTER TABLE history ADD COLUMN error TEXT;"
    ).map_err(|e| AppError::Database(format!("执行 v2 历史表迁移失败: {}", e)))?;

    tx.commit()
        .map_err(|e| AppError::Database(format!("提交 v2 迁移事务失败: {}", e)))
}

pub(super) fn initialize_schema(conn: &Connection) -> Result<(), AppError> {
    // 内存库不支持 WAL，忽略失败
    conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

    create_base_tables(conn)?;

    let mut version = get_user_version(conn)?;
    if version < 1 {
        set_user_version(conn, 1)?;
        version = 1;
    }

    if version < 2 {
        add_status_columns(conn)?;
        set_user_version(conn, 2)?;
        version = 2;
    }

    if version != SCHEMA_VERSION {
        return Err(AppError::Database(format!(
            "数据库版本不匹配: current={}, expected={}",
            version, SCHEMA_VERSION
        )));
    }

    Ok(())
}
