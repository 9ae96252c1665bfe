//! # clipshot：截图分享后端核心
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │          前端 (托盘 / TUI / CLI，均为薄壳)               │
//! └───────┬──────────────────────────────────────────────────┘
//!         ↕ ClipshotService (Result<T, AppError>)
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↕            核心 (Rust)                           │
//! │                                                          │
//! │  ┌─ orchestrator ── 单次上传 / 监视循环 / 退避重试       │
//! │  │     ├─ clipboard     轮询 + 指纹去重                  │
//! │  │     ├─ upload        会话 + 分块发送 + 进度节流       │
//! │  │     ├─ db            SQLite 历史 + 缩略图 / 副本      │
//! │  │     └─ credentials   系统钥匙串 / 加密文件            │
//! │  │                                                       │
//! │  ├─ image_handler       格式识别·受限解码·缩略图         │
//! │  ├─ config              目标与全局配置 (JSON)            │
//! │  ├─ storage             应用目录                         │
//! │  └─ error               统一错误类型 AppError            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `AppError`，所有对外调用的错误类型 |
//! | [`config`] | 配置模型、加载 / 保存 / 校验、目标解析 |
//! | [`storage`] | 配置、凭据、历史目录的解析与创建 |
//! | [`credentials`] | 凭据保险库：系统钥匙串或 Argon2id + XChaCha20-Poly1305 加密文件 |
//! | [`image_handler`] | 图片格式识别、受限解码、缩略图与 RGBA→PNG |
//! | [`db`] | 上传历史：SQLite 记录与派生文件的一致性、保留策略 |
//! | [`upload`] | 上传会话、文件名模板、进度节流、SFTP 传输 |
//! | [`clipboard`] | 剪贴板轮询与内容指纹 |
//! | [`orchestrator`] | 上传流水线、监视状态机、重试 |
//! | [`service`] | 面向前端的统一调用入口 |

pub mod error;
pub mod config;
pub mod storage;
pub mod credentials;
pub mod image_handler;
pub mod db;
pub mod upload;
pub mod clipboard;
pub mod orchestrator;
pub mod service;

pub use error::AppError;
pub use service::ClipshotService;
