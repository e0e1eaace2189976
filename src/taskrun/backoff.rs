// src/taskrun/backoff.rs

use std::time::Duration;

use crate::config::RetrySection;
use crate::model::LoopStrategy;

/// Delay before abnormal retry number `attempt` (1-based).
///
/// `base * ratio^(attempt-1)`, clamped into `[floor, ceiling]`.
pub fn abnormal_retry_delay(retry: &RetrySection, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(63) as i32;
    let raw = retry.base_secs as f64 * retry.ratio.powi(exp);
    let secs = raw.clamp(retry.floor_secs as f64, retry.ceiling_secs as f64);
    secs_to_duration(secs)
}

/// Think time before loop iteration `looped_times + 1`.
///
/// `interval * decline_ratio^looped_times`, capped at `decline_limit`.
pub fn loop_delay(strategy: &LoopStrategy, looped_times: u64) -> Duration {
    let exp = looped_times.min(63) as i32;
    let ratio = if strategy.decline_ratio.is_nan() || strategy.decline_ratio < 1.0 {
        1.0
    } else {
        strategy.decline_ratio
    };
    let raw = strategy.interval_sec as f64 * ratio.powi(exp);
    let limit = strategy.decline_limit_sec.max(strategy.interval_sec) as f64;
    secs_to_duration(raw.min(limit))
}

/// Saturates at `Duration::MAX` for values a `Duration` cannot hold.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
