//! 剪贴板监视模块（ClipboardWatcher）
//!
//! # 设计思路
//!
//! 监视器只回答一个问题：剪贴板里现在是不是一张“新”图片。
//! - **读写**：`ClipboardSource` 抽象读取图片与写回文本，生产环境用 `arboard`，测试用脚本化来源
//! - **指纹**：对原始像素计算 BLAKE3，不依赖编码器输出，跨平台稳定
//! - **基线**：“上一次处理过的指纹”只由监视器持有，编排层处理完后调用 `mark_processed`
//!
//! # 实现思路
//!
//! - 剪贴板无图片或读取失败都视为“无”，这是正常的空闲状态，不是错误。
//! - 观察到“无”时基线重置为空：同一张图被清空后再次复制会被当作新图片。
//! - PNG 编码推迟到确认是新图片之后，重复轮询同一张图不做编码。
//! - 读剪贴板与编码都是阻塞调用，由监视循环放进 `spawn_blocking`。
//! - 上传结果写回剪贴板后，下一次轮询观察到“无图片”，基线随之重置。

use std::fmt;

use bytes::Bytes;

use crate::error::AppError;
use crate::image_handler::ImageProcessor;

// ============================================================================
// 剪贴板来源
// ============================================================================

/// 剪贴板中的原始图片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardImage {
    pub width: u32,
    pub height: u32,
    /// RGBA8，长度为 `width * height * 4`
    pub rgba: Vec<u8>,
}

/// 系统剪贴板的读写入口
pub trait ClipboardSource: Send {
    /// 读取当前剪贴板图片；没有图片时返回 `None`
    fn read_image(&mut self) -> Option<ClipboardImage>;

    /// 用文本替换剪贴板内容
    fn write_text(&mut self, text: &str) -> Result<(), AppError>;
}

/// 基于 `arboard` 的系统剪贴板来源
///
/// 每次轮询重新打开剪贴板，避免长期持有平台句柄。
#[derive(Debug, Default)]
pub struct ArboardSource;

impl ClipboardSource for ArboardSource {
    fn read_image(&mut self) -> Option<ClipboardImage> {
        let mut clipboard = match arboard::Clipboard::new() {
            Ok(clipboard) => clipboard,
            Err(e) => {
                log::debug!("📋 打开剪贴板失败: {}", e);
                return None;
            }
        };

        match clipboard.get_image() {
            Ok(image) => Some(ClipboardImage {
                width: image.width as u32,
                height: image.height as u32,
                rgba: image.bytes.into_owned(),
            }),
            Err(arboard::Error::ContentNotAvailable) => None,
            Err(e) => {
                log::debug!("📋 读取剪贴板图片失败: {}", e);
                None
            }
        }
    }

    fn write_text(&mut self, text: &str) -> Result<(), AppError> {
        let mut clipboard = arboard::Clipboard::new()
            .map_err(|e| AppError::Clipboard(format!("打开剪贴板失败: {}", e)))?;
        clipboard
            .set_text(text.to_string())
            .map_err(|e| AppError::Clipboard(format!("写入剪贴板失败: {}", e)))
    }
}

// ============================================================================
// 指纹
// ============================================================================

/// 剪贴板图片内容指纹，仅用于变化检测，不持久化
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(image: &ClipboardImage) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&image.width.to_le_bytes());
        hasher.update(&image.height.to_le_bytes());
        hasher.update(&image.rgba);
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 一次轮询得到的图片
#[derive(Debug, Clone)]
pub struct ImageSnapshot {
    pub fingerprint: Fingerprint,
    pub image: ClipboardImage,
}

// ============================================================================
// 监视器
// ============================================================================

pub struct ClipboardWatcher {
    source: Box<dyn ClipboardSource>,
    processor: ImageProcessor,
    last_processed: Option<Fingerprint>,
}

impl ClipboardWatcher {
    pub fn new(source: Box<dyn ClipboardSource>, processor: ImageProcessor) -> Self {
        Self {
            source,
            processor,
            last_processed: None,
        }
    }

    /// 使用系统剪贴板
    pub fn system() -> Self {
        Self::new(Box::new(ArboardSource), ImageProcessor::default())
    }

    /// 读取一次剪贴板；观察到“无”时重置基线
    pub fn poll_once(&mut self) -> Option<ImageSnapshot> {
        match self.source.read_image() {
            Some(image) if image.width > 0 && image.height > 0 => {
                let fingerprint = Fingerprint::of(&image);
                log::trace!("📋 剪贴板图片 {}x{} 指纹 {}", image.width, image.height, fingerprint.short());
                Some(ImageSnapshot { fingerprint, image })
            }
            _ => {
                if self.last_processed.take().is_some() {
                    log::debug!("📋 剪贴板已无图片，重置基线");
                }
                None
            }
        }
    }

    /// 与上一次处理过的指纹不同即为新图片
    pub fn is_new(&self, snapshot: &ImageSnapshot) -> bool {
        self.last_processed.as_ref() != Some(&snapshot.fingerprint)
    }

    /// 推进基线；无论上传成功与否都要调用
    pub fn mark_processed(&mut self, fingerprint: Fingerprint) {
        self.last_processed = Some(fingerprint);
    }

    pub fn last_processed(&self) -> Option<&Fingerprint> {
        self.last_processed.as_ref()
    }

    /// 把文本写回剪贴板（上传后的 URL 或路径）
    pub fn write_text(&mut self, text: &str) -> Result<(), AppError> {
        self.source.write_text(text)
    }

    /// 将快照编码为 PNG
    pub fn encode_png(&self, snapshot: &ImageSnapshot) -> Result<Bytes, AppError> {
        let png = self.processor.encode_rgba_png(
            snapshot.image.width,
            snapshot.image.height,
            snapshot.image.rgba.clone(),
        )?;
        Ok(Bytes::from(png))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    pub(crate) fn solid_image(width: u32, height: u32, shade: u8) -> ClipboardImage {
        ClipboardImage {
            width,
            height,
            rgba: [shade, shade, shade, 0xFF].repeat((width * height) as usize),
        }
    }

    /// 按顺序返回预设帧，用尽后始终返回 `None`；写回的文本记录在 `written` 中
    pub(crate) struct ScriptedSource {
        frames: VecDeque<Option<ClipboardImage>>,
        written: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedSource {
        pub(crate) fn new(frames: Vec<Option<ClipboardImage>>) -> Self {
            Self {
                frames: frames.into(),
                written: Arc::default(),
            }
        }

        pub(crate) fn written(&self) -> Arc<Mutex<Vec<String>>> {
            self.written.clone()
        }
    }

    impl ClipboardSource for ScriptedSource {
        fn read_image(&mut self) -> Option<ClipboardImage> {
            self.frames.pop_front().flatten()
        }

        fn write_text(&mut self, text: &str) -> Result<(), AppError> {
            self.written.lock().expect("written lock").push(text.to_string());
            Ok(())
        }
    }

    fn count_new(frames: Vec<Option<ClipboardImage>>) -> usize {
        let len = frames.len();
        let mut watcher = ClipboardWatcher::new(
            Box::new(ScriptedSource::new(frames)),
            ImageProcessor::default(),
        );
        let mut detected = 0;
        for _ in 0..len {
            if let Some(snapshot) = watcher.poll_once() {
                if watcher.is_new(&snapshot) {
                    detected += 1;
                    watcher.mark_processed(snapshot.fingerprint);
                }
            }
        }
        detected
    }

    #[test]
    fn fingerprint_depends_on_pixels_and_shape() {
        let a = solid_image(4, 2, 10);
        let b = solid_image(2, 4, 10);
        let c = solid_image(4, 2, 11);
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&a.clone()));
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&c));
        assert_eq!(Fingerprint::of(&a).as_str().len(), 64);
    }

    #[test]
    fn detects_transitions_only() {
        let a = || Some(solid_image(3, 3, 1));
        let b = || Some(solid_image(3, 3, 2));
        assert_eq!(count_new(vec![a(), a(), b(), a()]), 3);
        assert_eq!(count_new(vec![a(), a(), a()]), 1);
    }

    #[test]
    fn empty_clipboard_resets_baseline() {
        let a = || Some(solid_image(3, 3, 1));
        assert_eq!(count_new(vec![a(), None, a()]), 2);
    }

    #[test]
    fn write_text_goes_to_the_source() {
        let source = ScriptedSource::new(vec![]);
        let written = source.written();
        let mut watcher = ClipboardWatcher::new(Box::new(source), ImageProcessor::default());
        watcher.write_text("https://x.dev/a.png").expect("write");
        assert_eq!(*written.lock().expect("written lock"), vec!["https://x.dev/a.png".to_string()]);
    }

    #[test]
    fn snapshot_encodes_to_png() {
        let mut watcher = ClipboardWatcher::new(
            Box::new(ScriptedSource::new(vec![Some(solid_image(5, 4, 200))])),
            ImageProcessor::default(),
        );
        let snapshot = watcher.poll_once().expect("snapshot");
        let png = watcher.encode_png(&snapshot).expect("encode");
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
