//! # 配置模块
//!
//! 将缩略图尺寸、滤镜与解码资源上限集中到 `ImageConfig`，便于测试替换。

use image::imageops::FilterType;

/// 缩略图单边上限（像素）
pub const THUMBNAIL_MAX_EDGE: u32 = 200;

/// 图片处理配置。
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// 缩略图宽/高单边最大值。
    pub thumbnail_max_edge: u32,
    /// 缩略图滤镜策略。
    pub thumbnail_filter: FilterType,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 解码阶段允许的预计内存上限（按 RGBA 估算，字节）。
    pub max_decoded_bytes: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            thumbnail_max_edge: THUMBNAIL_MAX_EDGE,
            thumbnail_filter: FilterType::Lanczos3,
            max_decoded_pixels: 40_000_000,
            max_decoded_bytes: 160 * 1024 * 1024,
        }
    }
}
