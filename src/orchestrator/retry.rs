//! 监视模式的重试退避
//!
//! 指数退避加随机抖动，抖动上限为当前延迟的三分之一，最终结果不超过上限。

use std::time::Duration;

use rand::Rng;

use crate::config::WatchConfig;

/// 第 `retry` 次重试（从 1 开始）前应等待的毫秒数
pub(crate) fn backoff_delay_ms(base_delay_ms: u64, retry: u32, max_delay_ms: u64) -> u64 {
    let ceiling = max_delay_ms.max(base_delay_ms);
    let exp = base_delay_ms.saturating_mul(1_u64 << retry.saturating_sub(1).min(16));
    let capped = exp.min(ceiling);
    let jitter_bound = capped / 3;
    let jitter = if jitter_bound == 0 {
        0
    } else {
        rand::rng().random_range(0..=jitter_bound)
    };
    capped.saturating_add(jitter).min(ceiling)
}

pub(crate) fn backoff_delay(config: &WatchConfig, retry: u32) -> Duration {
    Duration::from_millis(backoff_delay_ms(
        config.retry_base_delay_ms,
        retry,
        config.retry_max_delay_ms,
    ))
}
