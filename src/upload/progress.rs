//! # 上传进度节流
//!
//! 分块写入每 32 KiB 就会产生一次进度，直接转发会淹没观察者。
//! 满足任一条件才发出：距上次发出已过 100 ms、又多发送了 256 KiB、
//! 百分比跨入新的 5% 档位。首个与最终事件必定发出。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

const PROGRESS_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
const PROGRESS_MIN_BYTES_DELTA: u64 = 256 * 1024;
const PROGRESS_PERCENT_BUCKET: u8 = 5;

/// 对外发布的进度事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub filename: String,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub percent: u8,
}

/// 进度观察者
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

pub(crate) fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent.min(total) as u128 * 100) / total as u128) as u8
}

#[derive(Debug, Default)]
pub(crate) struct ProgressThrottleState {
    last_emit_at: Option<Instant>,
    last_percent: u8,
    last_sent: u64,
}

impl ProgressThrottleState {
    pub fn update(&mut self, percent: u8, sent: u64, now: Instant) {
        self.last_emit_at = Some(now);
        self.last_percent = percent;
        self.last_sent = sent;
    }
}

pub(crate) fn should_emit_progress(
    state: &ProgressThrottleState,
    sent: u64,
    total: u64,
    now: Instant,
) -> bool {
    let Some(last_emit_at) = state.last_emit_at else {
        return true;
    };
    if sent >= total {
        return state.last_sent < total;
    }

    let sent_delta = sent.saturating_sub(state.last_sent);
    if sent_delta == 0 {
        return false;
    }

    let bucket = percent_of(sent, total) / PROGRESS_PERCENT_BUCKET;
    if bucket != state.last_percent / PROGRESS_PERCENT_BUCKET {
        return true;
    }
    if sent_delta >= PROGRESS_MIN_BYTES_DELTA {
        return true;
    }
    now.saturating_duration_since(last_emit_at) >= PROGRESS_HEARTBEAT_INTERVAL
}

/// 把逐块进度节流后转发给 `ProgressCallback`
pub(crate) struct ThrottledProgress {
    filename: String,
    total: u64,
    callback: Option<ProgressCallback>,
    state: ProgressThrottleState,
}

impl ThrottledProgress {
    pub fn new(filename: &str, total: u64, callback: Option<ProgressCallback>) -> Self {
        Self {
            filename: filename.to_string(),
            total,
            callback,
            state: ProgressThrottleState::default(),
        }
    }

    pub fn report(&mut self, sent: u64) {
        let Some(callback) = &self.callback else {
            return;
        };
        let now = Instant::now();
        if !should_emit_progress(&self.state, sent, self.total, now) {
            return;
        }
        let percent = percent_of(sent, self.total);
        self.state.update(percent, sent, now);
        callback(UploadProgress {
            filename: self.filename.clone(),
            bytes_sent: sent,
            total_bytes: self.total,
            percent,
        });
    }
}
