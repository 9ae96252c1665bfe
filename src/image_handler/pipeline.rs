//! # 解码与缩放流水线模块
//!
//! ## 设计思路
//!
//! 将“字节 → 图像 → 缩略图”的过程集中管理，并在关键节点增加资源上限控制。
//! 优先做尺寸检查，再进行完整解码，降低恶意输入触发高内存开销的风险。
//!
//! ## 实现思路
//!
//! 1. 读取 header 尺寸
//! 2. 按像素与内存上限快速拒绝
//! 3. 完整解码
//! 4. 等比缩放到缩略图边界内（只缩不放）
//! 5. 优先 `fast_image_resize`，失败回退 `image::resize_exact`

use fast_image_resize as fr;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageFormat, Rgba};
use std::io::Cursor;

use super::{ImageConfig, ImageError};

/// 仅通过内存中的图片头信息读取宽高。
pub(super) fn inspect_dimensions(bytes: &[u8]) -> Result<(u32, u32), ImageError> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImageError::InvalidFormat(format!("无法识别图片格式：{}", e)))?;

    reader
        .into_dimensions()
        .map_err(|e| ImageError::InvalidFormat(format!("无法读取图片尺寸：{}", e)))
}

/// 校验像素数量与预计解码内存是否超过配置上限。
pub(super) fn validate_limits(config: &ImageConfig, width: u32, height: u32) -> Result<(), ImageError> {
    let pixels = (width as u64)
        .checked_mul(height as u64)
        .ok_or_else(|| ImageError::ResourceLimit("图片像素数溢出".to_string()))?;

    if pixels > config.max_decoded_pixels {
        return Err(ImageError::ResourceLimit(format!(
            "图片像素过大：{} 像素（限制：{} 像素）",
            pixels, config.max_decoded_pixels
        )));
    }

    let estimated = pixels
        .checked_mul(4)
        .ok_or_else(|| ImageError::ResourceLimit("图片解码内存估算溢出".to_string()))?;

    if estimated > config.max_decoded_bytes {
        return Err(ImageError::ResourceLimit(format!(
            "图片解码预计内存过大：{:.2} MB（限制：{:.2} MB）",
            estimated as f64 / 1024.0 / 1024.0,
            config.max_decoded_bytes as f64 / 1024.0 / 1024.0
        )));
    }

    Ok(())
}

/// 先检查 header 再完整解码。
pub(super) fn decode_bounded(bytes: &[u8], config: &ImageConfig) -> Result<DynamicImage, ImageError> {
    let (width, height) = inspect_dimensions(bytes)?;
    validate_limits(config, width, height)?;

    image::load_from_memory(bytes).map_err(|e| ImageError::Decode(format!("图片解码失败：{}", e)))
}

/// 计算等比缩放后的目标尺寸，使长边不超过 `max_edge`，且不放大。
pub(super) fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    if width <= max_edge && height <= max_edge {
        return (width.max(1), height.max(1));
    }
    let scale = (max_edge as f64 / width as f64).min(max_edge as f64 / height as f64);
    let target_width = ((width as f64 * scale).round() as u32).clamp(1, max_edge);
    let target_height = ((height as f64 * scale).round() as u32).clamp(1, max_edge);
    (target_width, target_height)
}

/// 缩放到缩略图尺寸。
pub(super) fn downscale(image: DynamicImage, config: &ImageConfig) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (target_width, target_height) = fit_within(width, height, config.thumbnail_max_edge);
    if (target_width, target_height) == (width, height) {
        return image;
    }

    match resize_with_fast_image_resize(&image, target_width, target_height, config.thumbnail_filter) {
        Ok(resized) => resized,
        Err(err) => {
            log::warn!(
                "⚠️ fast_image_resize 缩放失败，回退 image::resize_exact：{}",
                err
            );
            image.resize_exact(target_width, target_height, config.thumbnail_filter)
        }
    }
}

fn resize_with_fast_image_resize(
    image: &DynamicImage,
    target_width: u32,
    target_height: u32,
    filter: image::imageops::FilterType,
) -> Result<DynamicImage, ImageError> {
    let src = image.to_rgba8();
    let (src_width, src_height) = src.dimensions();

    let src_image = fr::images::Image::from_vec_u8(
        src_width,
        src_height,
        src.into_raw(),
        fr::PixelType::U8x4,
    )
    .map_err(|e| ImageError::Decode(format!("构建源图像缓冲失败：{}", e)))?;

    let mut dst_image = fr::images::Image::new(target_width, target_height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(to_fast_filter(filter)));

    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| ImageError::Decode(format!("fast_image_resize 执行失败：{}", e)))?;

    let rgba = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(
        target_width,
        target_height,
        dst_image.into_vec(),
    )
    .ok_or_else(|| ImageError::Decode("fast_image_resize 输出缓冲长度异常".to_string()))?;

    Ok(DynamicImage::ImageRgba8(rgba))
}

fn to_fast_filter(filter: image::imageops::FilterType) -> fr::FilterType {
    match filter {
        image::imageops::FilterType::Nearest => fr::FilterType::Box,
        image::imageops::FilterType::Triangle => fr::FilterType::Bilinear,
        image::imageops::FilterType::CatmullRom => fr::FilterType::CatmullRom,
        image::imageops::FilterType::Gaussian => fr::FilterType::Mitchell,
        image::imageops::FilterType::Lanczos3 => fr::FilterType::Lanczos3,
    }
}

/// 编码为 PNG 字节。
pub(super) fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, ImageError> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| ImageError::Encode(format!("PNG 编码失败：{}", e)))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_within_keeps_small_images() {
        assert_eq!(fit_within(120, 80, 200), (120, 80));
    }

    #[test]
    fn fit_within_preserves_aspect_ratio() {
        assert_eq!(fit_within(2000, 1000, 200), (200, 100));
        assert_eq!(fit_within(100, 4000, 200), (5, 200));
    }

    #[test]
    fn fit_within_never_returns_zero() {
        assert_eq!(fit_within(10_000, 1, 200), (200, 1));
    }

    #[test]
    fn validate_limits_rejects_oversized() {
        let config = ImageConfig {
            max_decoded_pixels: 100,
            ..ImageConfig::default()
        };
        assert!(matches!(
            validate_limits(&config, 20, 20),
            Err(ImageError::ResourceLimit(_))
        ));
        assert!(validate_limits(&config, 10, 10).is_ok());
    }
}
