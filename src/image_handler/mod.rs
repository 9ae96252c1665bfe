//! # 图片处理模块（image_handler）
//!
//! ## 设计思路
//!
//! 编解码被视为不透明的协作者：上层只关心“是不是图片、什么格式、缩略图多大”。
//!
//! - `processor`：对外入口 `ImageProcessor`
//! - `pipeline`：尺寸检查、受限解码、缩放、PNG 编码
//! - `config/error`：配置与错误
//!
//! ## 调用链
//!
//! ```text
//! HistoryStore::add / 剪贴板快照
//!    ↓
//! processor.rs（格式识别 / 缩略图 / RGBA→PNG）
//!    ↓
//! pipeline.rs（header 尺寸 → 资源上限 → 解码 → 缩放 → 编码）
//! ```

mod config;
mod error;
mod pipeline;
mod processor;

pub use config::{ImageConfig, THUMBNAIL_MAX_EDGE};
pub use error::ImageError;
pub use processor::{ImageKind, ImageProcessor, Thumbnail};

#[cfg(test)]
pub(crate) use processor::sample_png;
