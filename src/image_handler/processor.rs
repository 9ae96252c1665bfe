//! # 图片处理器
//!
//! 对外的薄封装：格式识别、缩略图生成、剪贴板 RGBA 转 PNG。
//! 编解码细节全部委托给 `image` / `fast_image_resize`。

use image::{DynamicImage, GenericImageView, RgbaImage};

use super::{ImageConfig, ImageError, pipeline};

/// 识别出的图片类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageKind {
    pub extension: &'static str,
    pub mime: &'static str,
}

/// 生成的缩略图（PNG 编码）
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ImageProcessor {
    config: ImageConfig,
}

impl ImageProcessor {
    pub fn new(config: ImageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// 通过文件签名（magic bytes）识别图片类型。
    pub fn detect_format(&self, bytes: &[u8]) -> Result<ImageKind, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::InvalidFormat("图片内容为空".to_string()));
        }

        let kind = infer::get(bytes)
            .ok_or_else(|| ImageError::InvalidFormat("无法识别图片类型".to_string()))?;

        if kind.matcher_type() != infer::MatcherType::Image {
            return Err(ImageError::InvalidFormat(format!(
                "文件签名不是图片类型：{}",
                kind.mime_type()
            )));
        }

        Ok(ImageKind {
            extension: kind.extension(),
            mime: kind.mime_type(),
        })
    }

    /// 仅读取 header 尺寸，不做完整解码。
    pub fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), ImageError> {
        pipeline::inspect_dimensions(bytes)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, ImageError> {
        pipeline::decode_bounded(bytes, &self.config)
    }

    /// 生成不超过 `thumbnail_max_edge` 的 PNG 缩略图。
    pub fn thumbnail(&self, bytes: &[u8]) -> Result<Thumbnail, ImageError> {
        let decoded = self.decode(bytes)?;
        let (source_width, source_height) = decoded.dimensions();
        let resized = pipeline::downscale(decoded, &self.config);
        let (width, height) = resized.dimensions();
        let png = pipeline::encode_png(&resized)?;

        log::debug!(
            "🖼️ 生成缩略图 {}x{} -> {}x{} ({} 字节)",
            source_width,
            source_height,
            width,
            height,
            png.len()
        );

        Ok(Thumbnail { png, width, height })
    }

    /// 将剪贴板原始 RGBA 像素编码为 PNG。
    pub fn encode_rgba_png(&self, width: u32, height: u32, rgba: Vec<u8>) -> Result<Vec<u8>, ImageError> {
        pipeline::validate_limits(&self.config, width, height)?;

        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| ImageError::ResourceLimit("图片尺寸导致内存溢出风险".to_string()))?;
        if rgba.len() != expected_len {
            return Err(ImageError::Decode(format!(
                "RGBA 数据长度异常：期望 {} 实际 {}",
                expected_len,
                rgba.len()
            )));
        }

        let buffer = RgbaImage::from_raw(width, height, rgba)
            .ok_or_else(|| ImageError::Decode("无法构建 RGBA 图像缓冲".to_string()))?;
        pipeline::encode_png(&DynamicImage::ImageRgba8(buffer))
    }
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let pixels: Vec<u8> = (0..width * height)
        .flat_map(|i| [(i % 251) as u8, (i % 13) as u8 * 19, 0x80, 0xFF])
        .collect();
    ImageProcessor::default()
        .encode_rgba_png(width, height, pixels)
        .expect("encode sample png")
}
