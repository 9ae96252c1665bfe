//! # 文件名与 URL 模板
//!
//! ## 设计思路
//!
//! 上传文件名在每次发送时按模板即时生成，重试是否换新名字由调用方决定。
//! 模板在加载配置时即做一次完整校验，运行期不会因为模板写错而在上传中途失败。
//!
//! ## 支持的占位符
//!
//! - `{date}`：本地日期 `%Y-%m-%d`
//! - `{time}`：本地时间 `%H-%M-%S`
//! - `{timestamp}`：Unix 秒
//! - `{random}` / `{random:N}`：N 个字母数字（1..=32，默认 6）
//! - `{uuid}`：UUID v4
//! - `{counter}`：进程内自增计数，从 1 开始
//! - `{ext}`：扩展名；模板里没有时自动追加 `.ext`
//!
//! URL 模板支持 `{filename}` 与 `{remote_path}`，都不出现时按 `base/filename` 拼接。

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use rand::Rng;
use rand::distr::Alphanumeric;
use regex::Regex;
use uuid::Uuid;

use crate::error::AppError;

const RANDOM_DEFAULT_LEN: usize = 6;
const RANDOM_MAX_LEN: usize = 32;

static COUNTER: AtomicU64 = AtomicU64::new(1);

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z_]+)(?::([^{}]*))?\}").expect("token regex must compile")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Date,
    Time,
    Timestamp,
    Random(usize),
    Uuid,
    Counter,
    Ext,
}

fn parse_token(name: &str, arg: Option<&str>) -> Result<Token, AppError> {
    let no_arg = |token: Token| match arg {
        None => Ok(token),
        Some(a) => Err(AppError::ConfigInvalid(format!(
            "占位符 {{{}}} 不接受参数 '{}'",
            name, a
        ))),
    };

    match name {
        "date" => no_arg(Token::Date),
        "time" => no_arg(Token::Time),
        "timestamp" => no_arg(Token::Timestamp),
        "ext" => no_arg(Token::Ext),
        "uuid" => no_arg(Token::Uuid),
        "counter" => no_arg(Token::Counter),
        "random" => {
            let len = match arg {
                None => RANDOM_DEFAULT_LEN,
                Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
                    AppError::ConfigInvalid(format!("{{random:{}}} 的长度不是数字", raw))
                })?,
            };
            if !(1..=RANDOM_MAX_LEN).contains(&len) {
                return Err(AppError::ConfigInvalid(format!(
                    "{{random:N}} 的长度必须在 1 到 {} 之间，实际为 {}",
                    RANDOM_MAX_LEN, len
                )));
            }
            Ok(Token::Random(len))
        }
        other => Err(AppError::ConfigInvalid(format!("未知的文件名占位符 {{{}}}", other))),
    }
}

/// 把模板切成字面量与占位符两部分，任何不认识的写法都直接报错
fn parse_template(template: &str) -> Result<Vec<Result<Token, String>>, AppError> {
    if template.trim().is_empty() {
        return Err(AppError::ConfigInvalid("文件名模板不能为空".to_string()));
    }

    let mut parts = Vec::new();
    let mut cursor = 0;
    for caps in TOKEN_RE.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        push_literal(&mut parts, &template[cursor..whole.start()])?;
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let arg = caps.get(2).map(|m| m.as_str());
        parts.push(Ok(parse_token(name, arg)?));
        cursor = whole.end();
    }
    push_literal(&mut parts, &template[cursor..])?;
    Ok(parts)
}

fn push_literal(parts: &mut Vec<Result<Token, String>>, literal: &str) -> Result<(), AppError> {
    if literal.is_empty() {
        return Ok(());
    }
    if literal.contains('{') || literal.contains('}') {
        return Err(AppError::ConfigInvalid(format!(
            "文件名模板中存在未闭合的花括号: '{}'",
            literal
        )));
    }
    parts.push(Err(literal.to_string()));
    Ok(())
}

/// 校验文件名模板
pub fn validate_template(template: &str) -> Result<(), AppError> {
    parse_template(template).map(|_| ())
}

fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// 路径分隔符与控制字符替换为 `_`，保证结果只是一个文件名
fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// 按模板生成上传文件名
pub fn render_filename(
    template: &str,
    extension: &str,
    now: DateTime<Local>,
) -> Result<String, AppError> {
    let ext = extension.trim().trim_start_matches('.');
    let mut out = String::new();
    let mut has_ext = false;

    for part in parse_template(template)? {
        match part {
            Err(literal) => out.push_str(&literal),
            Ok(Token::Date) => out.push_str(&now.format("%Y-%m-%d").to_string()),
            Ok(Token::Time) => out.push_str(&now.format("%H-%M-%S").to_string()),
            Ok(Token::Timestamp) => out.push_str(&now.timestamp().to_string()),
            Ok(Token::Random(len)) => out.push_str(&random_string(len)),
            Ok(Token::Uuid) => out.push_str(&Uuid::new_v4().to_string()),
            Ok(Token::Counter) => {
                out.push_str(&COUNTER.fetch_add(1, Ordering::SeqCst).to_string())
            }
            Ok(Token::Ext) => {
                has_ext = true;
                out.push_str(ext);
            }
        }
    }

    if !has_ext && !ext.is_empty() {
        out.push('.');
        out.push_str(ext);
    }

    let name = sanitize_component(out.trim());
    if name.is_empty() || name == "." || name == ".." {
        return Err(AppError::ConfigInvalid(format!(
            "模板 '{}' 生成了无效的文件名",
            template
        )));
    }
    Ok(name)
}

/// 校验调用方显式指定的文件名
pub fn validate_filename_override(name: &str) -> Result<String, AppError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return Err(AppError::ConfigInvalid(format!("无效的文件名 '{}'", name)));
    }
    if trimmed.contains(['/', '\\']) || trimmed.chars().any(char::is_control) {
        return Err(AppError::ConfigInvalid(format!(
            "文件名 '{}' 不能包含路径分隔符或控制字符",
            name
        )));
    }
    Ok(trimmed.to_string())
}

/// 远端完整路径：`remote_path` 与文件名之间恰好一个 `/`
pub fn remote_file_path(base: &str, filename: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), filename)
}

/// 生成公开 URL，未配置模板时返回 `None`
pub fn render_url(template: Option<&str>, filename: &str, remote_path: &str) -> Option<String> {
    let template = template?.trim();
    if template.is_empty() {
        return None;
    }
    if template.contains("{filename}") || template.contains("{remote_path}") {
        return Some(
            template
                .replace("{filename}", filename)
                .replace("{remote_path}", remote_path),
        );
    }
    Some(format!("{}/{}", template.trim_end_matches('/'), filename))
}
