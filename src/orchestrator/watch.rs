//! # 监视模式
//!
//! ## 状态机
//!
//! ```text
//! Idle ──(指纹变化)──▶ Detected ──▶ Uploading ──▶ Recording ──▶ Idle
//! ```
//!
//! - 指纹与“上一次处理过的指纹”不同才进入 `Detected`；观察到“无”也算一次基线变化。
//! - 离开 `Uploading` 后无论成败都推进基线：上传失败的同一张图不会被自动重试，
//!   只有新的指纹才会再次触发上传。
//! - 可重试的传输错误（超时、连接失败）在同一次检测内按退避重试，最多 `max_attempts` 次。
//! - 一张图片从第一次尝试到历史写完都持有编排器的上传锁，与单次上传互斥。
//! - 读剪贴板、PNG 编码与写回剪贴板都在 `spawn_blocking` 中执行，不占用异步工作线程。
//!
//! ## 取消
//!
//! 每次轮询前检查取消令牌；轮询间隔与退避等待都和取消信号一起 `select!`，
//! 因此停止请求最多在一个轮询间隔内生效，且不会打断进行中的传输。

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Local;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{UploadOrchestrator, UploadReport, retry};
use crate::clipboard::{ClipboardWatcher, Fingerprint};
use crate::config::Destination;
use crate::error::AppError;
use crate::upload::{SessionAuth, naming};

/// 监视循环当前所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Idle,
    Detected,
    Uploading,
    Recording,
}

/// 监视循环的累计计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchStats {
    pub polls: u64,
    pub detections: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// 通过 `watch` 通道发布的状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchStatus {
    pub state: WatchState,
    pub stats: WatchStats,
    pub last_url: Option<String>,
    pub last_error: Option<String>,
}

impl Default for WatchStatus {
    fn default() -> Self {
        Self {
            state: WatchState::Idle,
            stats: WatchStats::default(),
            last_url: None,
            last_error: None,
        }
    }
}

/// 启动前解析完成的目标与认证材料
#[derive(Debug, Clone)]
pub struct WatchPlan {
    pub destination: Destination,
    auth: SessionAuth,
}

fn set_state(status: &watch::Sender<WatchStatus>, state: WatchState) {
    status.send_modify(|s| s.state = state);
}

/// 一次轮询发现的新图片
struct Detection {
    fingerprint: Fingerprint,
    width: u32,
    height: u32,
    png: Result<Bytes, AppError>,
}

/// 在阻塞线程上操作监视器
async fn with_watcher<T, F>(watcher: &Arc<Mutex<ClipboardWatcher>>, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&mut ClipboardWatcher) -> T + Send + 'static,
{
    let watcher = watcher.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = watcher
            .lock()
            .map_err(|_| AppError::Clipboard("剪贴板监视器状态已损坏".to_string()))?;
        Ok(f(&mut guard))
    })
    .await
    .map_err(|e| AppError::Clipboard(format!("剪贴板任务异常终止: {}", e)))?
}

/// 读一次剪贴板；是新图片时顺带编码为 PNG
fn sample(watcher: &mut ClipboardWatcher) -> Option<Detection> {
    let snapshot = watcher.poll_once()?;
    if !watcher.is_new(&snapshot) {
        return None;
    }
    let png = watcher.encode_png(&snapshot);
    Some(Detection {
        width: snapshot.image.width,
        height: snapshot.image.height,
        fingerprint: snapshot.fingerprint,
        png,
    })
}

impl UploadOrchestrator {
    /// 解析目标与凭据；这里的失败对监视模式是致命的
    pub fn prepare_watch(&self, destination: Option<&str>) -> Result<WatchPlan, AppError> {
        let destination = self.config.resolve_destination(destination)?;
        let auth = self.resolve_auth(&destination)?;
        Ok(WatchPlan { destination, auth })
    }

    /// 解析后立即运行监视循环，直到取消
    pub async fn run_watch_loop(
        &self,
        watcher: ClipboardWatcher,
        destination: Option<&str>,
        cancel: CancellationToken,
        status: watch::Sender<WatchStatus>,
    ) -> Result<WatchStats, AppError> {
        let plan = self.prepare_watch(destination)?;
        Ok(self.run_watch(plan, watcher, cancel, status).await)
    }

    /// 运行监视循环；单张图片的错误只记日志，循环不会自行退出
    pub async fn run_watch(
        &self,
        plan: WatchPlan,
        watcher: ClipboardWatcher,
        cancel: CancellationToken,
        status: watch::Sender<WatchStatus>,
    ) -> WatchStats {
        let interval = self.config.watch.interval();
        log::info!(
            "👀 开始监视剪贴板，目标 '{}'，间隔 {} ms",
            plan.destination.name,
            interval.as_millis()
        );

        let watcher = Arc::new(Mutex::new(watcher));
        loop {
            if cancel.is_cancelled() {
                break;
            }

            status.send_modify(|s| s.stats.polls += 1);
            let detection = match with_watcher(&watcher, sample).await {
                Ok(detection) => detection,
                Err(e) => {
                    log::error!("❌ 剪贴板监视器不可用，停止监视: {}", e);
                    break;
                }
            };

            if let Some(detection) = detection {
                status.send_modify(|s| {
                    s.state = WatchState::Detected;
                    s.stats.detections += 1;
                });
                log::info!("📋 检测到新的剪贴板图片 {}x{}", detection.width, detection.height);

                let report = match detection.png {
                    Ok(png) => self.process_snapshot(&plan, png, &cancel, &status).await,
                    Err(e) => {
                        log::warn!("⚠️ 剪贴板图片编码失败，跳过: {}", e);
                        status.send_modify(|s| {
                            s.stats.failures += 1;
                            s.last_error = Some(e.to_string());
                        });
                        None
                    }
                };

                let copy = report.as_ref().and_then(|r| self.clipboard_text(&r.receipt));
                let fingerprint = detection.fingerprint;
                let finished = with_watcher(&watcher, move |w| {
                    if let Some(text) = copy {
                        match w.write_text(&text) {
                            Ok(()) => log::info!("📋 已复制: {}", text),
                            Err(e) => log::warn!("⚠️ 写回剪贴板失败: {}", e),
                        }
                    }
                    w.mark_processed(fingerprint);
                })
                .await;
                if let Err(e) = finished {
                    log::error!("❌ 剪贴板监视器不可用，停止监视: {}", e);
                    break;
                }
                set_state(&status, WatchState::Idle);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        set_state(&status, WatchState::Idle);
        let stats = status.borrow().stats.clone();
        log::info!(
            "🛑 剪贴板监视已停止：轮询 {} 次，检测 {} 次，成功 {} 次，失败 {} 次",
            stats.polls,
            stats.detections,
            stats.successes,
            stats.failures
        );
        stats
    }

    /// 上传一张新图片（含重试）并记录结果
    async fn process_snapshot(
        &self,
        plan: &WatchPlan,
        png: Bytes,
        cancel: &CancellationToken,
        status: &watch::Sender<WatchStatus>,
    ) -> Option<UploadReport> {
        let settings = &self.config.watch;
        let mut filename = match self.render_watch_filename() {
            Ok(name) => name,
            Err(e) => {
                log::warn!("⚠️ 生成文件名失败，跳过: {}", e);
                status.send_modify(|s| {
                    s.stats.failures += 1;
                    s.last_error = Some(e.to_string());
                });
                return None;
            }
        };

        let _gate = self.upload_gate.lock().await;

        let mut attempt = 1;
        let result = loop {
            set_state(status, WatchState::Uploading);
            status.send_modify(|s| s.stats.attempts += 1);

            let result = self
                .transfer(&plan.destination, plan.auth.clone(), png.clone(), &filename)
                .await;
            match result {
                Err(e) if e.is_retryable() && attempt < settings.max_attempts => {
                    let delay = retry::backoff_delay(settings, attempt);
                    log::warn!(
                        "🔁 第 {}/{} 次上传失败，{} ms 后重试: {}",
                        attempt,
                        settings.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    let cancelled = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        break Err(e);
                    }
                    attempt += 1;
                    if settings.fresh_filename_on_retry {
                        if let Ok(name) = self.render_watch_filename() {
                            filename = name;
                        }
                    }
                }
                other => break other,
            }
        };

        set_state(status, WatchState::Recording);
        match self.finish(&plan.destination, &filename, png, result).await {
            Ok(report) => {
                log::info!(
                    "🔗 {}",
                    report.receipt.url.as_deref().unwrap_or(&report.receipt.remote_path)
                );
                status.send_modify(|s| {
                    s.stats.successes += 1;
                    s.last_url = report.receipt.url.clone();
                    s.last_error = None;
                });
                Some(report)
            }
            Err(e) => {
                status.send_modify(|s| {
                    s.stats.failures += 1;
                    s.last_error = Some(e.to_string());
                });
                None
            }
        }
    }

    fn render_watch_filename(&self) -> Result<String, AppError> {
        naming::render_filename(&self.config.filename_template, "png", Local::now())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ScriptedTransport, build, refused, rejected, test_config, unique_temp_dir};
    use super::*;
    use crate::clipboard::tests::{ScriptedSource, solid_image};
    use crate::clipboard::{ClipboardImage, ClipboardSource};
    use crate::image_handler::{ImageProcessor, sample_png};
    use std::time::Duration;

    /// 脚本用尽后的下一次轮询触发取消，保证每一帧（含重试）都被完整处理
    struct CancelWhenDone {
        inner: ScriptedSource,
        remaining: usize,
        cancel: CancellationToken,
    }

    impl ClipboardSource for CancelWhenDone {
        fn read_image(&mut self) -> Option<ClipboardImage> {
            if self.remaining == 0 {
                self.cancel.cancel();
                return None;
            }
            self.remaining -= 1;
            self.inner.read_image()
        }

        fn write_text(&mut self, text: &str) -> Result<(), AppError> {
            self.inner.write_text(text)
        }
    }

    fn scripted_watcher(frames: Vec<Option<ClipboardImage>>) -> (ClipboardWatcher, CancellationToken, Arc<Mutex<Vec<String>>>) {
        let cancel = CancellationToken::new();
        let inner = ScriptedSource::new(frames.clone());
        let written = inner.written();
        let source = CancelWhenDone {
            remaining: frames.len(),
            inner,
            cancel: cancel.clone(),
        };
        let watcher = ClipboardWatcher::new(Box::new(source), ImageProcessor::default());
        (watcher, cancel, written)
    }

    async fn run_script(
        orchestrator: &UploadOrchestrator,
        frames: Vec<Option<ClipboardImage>>,
    ) -> WatchStats {
        let (watcher, cancel, _written) = scripted_watcher(frames);
        let (tx, _rx) = watch::channel(WatchStatus::default());
        orchestrator
            .run_watch_loop(watcher, None, cancel, tx)
            .await
            .expect("watch loop")
    }

    fn a() -> Option<ClipboardImage> {
        Some(solid_image(6, 4, 10))
    }

    fn b() -> Option<ClipboardImage> {
        Some(solid_image(6, 4, 20))
    }

    #[tokio::test]
    async fn uploads_once_per_fingerprint_change() {
        let transport = Arc::new(ScriptedTransport::default());
        let orchestrator = build(test_config(), transport.clone(), None);

        let stats = run_script(&orchestrator, vec![a(), a(), b(), a()]).await;
        assert_eq!(transport.uploaded().len(), 3);
        assert_eq!(stats.detections, 3);
        assert_eq!(stats.successes, 3);
        // 四帧加一次收尾轮询
        assert_eq!(stats.polls, 5);
    }

    #[tokio::test]
    async fn flat_sequence_uploads_once() {
        let transport = Arc::new(ScriptedTransport::default());
        let orchestrator = build(test_config(), transport.clone(), None);

        run_script(&orchestrator, vec![a(), a(), a()]).await;
        assert_eq!(transport.uploaded().len(), 1);
    }

    #[tokio::test]
    async fn failed_image_is_not_retried_on_repeat() {
        let transport = Arc::new(ScriptedTransport::failing_with(vec![
            rejected as fn() -> AppError,
        ]));
        let orchestrator = build(test_config(), transport.clone(), None);

        let stats = run_script(&orchestrator, vec![a(), a()]).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(stats.failures, 1);
        assert!(transport.uploaded().is_empty());
    }

    #[tokio::test]
    async fn retryable_errors_retry_with_same_filename() {
        let root = unique_temp_dir("clipshot_watch_retry");
        let transport = Arc::new(ScriptedTransport::failing_with(vec![
            refused as fn() -> AppError,
            refused as fn() -> AppError,
        ]));
        let mut config = test_config();
        config.watch.max_attempts = 3;
        let orchestrator = build(config, transport.clone(), Some(&root));

        let stats = run_script(&orchestrator, vec![a()]).await;
        assert_eq!(transport.connects(), 3);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.successes, 1);

        let history = orchestrator.history().expect("history");
        let rows = history.get_recent(10).expect("recent");
        assert_eq!(rows.len(), 1);
        assert_eq!(transport.uploaded(), vec![rows[0].remote_path.clone()]);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let transport = Arc::new(ScriptedTransport::failing_with(vec![
            refused as fn() -> AppError,
            refused as fn() -> AppError,
            refused as fn() -> AppError,
        ]));
        let mut config = test_config();
        config.watch.max_attempts = 2;
        let orchestrator = build(config, transport.clone(), None);

        let stats = run_script(&orchestrator, vec![a()]).await;
        assert_eq!(transport.connects(), 2);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn startup_errors_are_fatal() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut config = test_config();
        config.default_destination = None;
        let orchestrator = build(config, transport, None);

        let watcher = ClipboardWatcher::new(Box::new(ScriptedSource::new(vec![])), ImageProcessor::default());
        let (tx, _rx) = watch::channel(WatchStatus::default());
        let err = orchestrator
            .run_watch_loop(watcher, None, CancellationToken::new(), tx)
            .await
            .expect_err("no destination");
        assert_eq!(err.code(), "config_invalid");
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_polling() {
        let transport = Arc::new(ScriptedTransport::default());
        let orchestrator = build(test_config(), transport.clone(), None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let watcher = ClipboardWatcher::new(Box::new(ScriptedSource::new(vec![a()])), ImageProcessor::default());
        let (tx, rx) = watch::channel(WatchStatus::default());
        let stats = orchestrator
            .run_watch_loop(watcher, None, cancel, tx)
            .await
            .expect("watch loop");

        assert_eq!(stats.polls, 0);
        assert_eq!(rx.borrow().state, WatchState::Idle);
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test]
    async fn watch_copies_url_after_each_upload() {
        let transport = Arc::new(ScriptedTransport::default());
        let orchestrator = build(test_config(), transport.clone(), None);

        let (watcher, cancel, written) = scripted_watcher(vec![a(), b()]);
        let (tx, _rx) = watch::channel(WatchStatus::default());
        orchestrator
            .run_watch_loop(watcher, None, cancel, tx)
            .await
            .expect("watch loop");

        let written = written.lock().expect("written lock").clone();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|url| url.starts_with("https://shots.example.com/screenshot_")));
    }

    #[tokio::test]
    async fn watch_and_single_uploads_do_not_overlap() {
        let transport = Arc::new(ScriptedTransport::stalling(Duration::from_millis(150)));
        let orchestrator = build(test_config(), transport.clone(), None);

        let (watcher, cancel, _written) = scripted_watcher(vec![a(), b()]);
        let (tx, _rx) = watch::channel(WatchStatus::default());
        let (stats, single) = tokio::join!(
            orchestrator.run_watch_loop(watcher, None, cancel, tx),
            orchestrator.upload_once(Bytes::from(sample_png(8, 8)), None, Some("single.png")),
        );

        assert_eq!(stats.expect("watch loop").successes, 2);
        single.expect("single upload");
        assert_eq!(transport.uploaded().len(), 3);
        assert_eq!(transport.flight.peak(), 1);
    }
}
