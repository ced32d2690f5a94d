//! 时间处理工具模块
//!
//! # 设计原则
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（i64）
//! - **业务层**: 统一使用 `Utc::now().timestamp_millis()` 生成时间
//! - **显示层**: 由应用层负责格式化和国际化

use chrono::{DateTime, Utc};
use std::time::Duration;

/// 当前 UTC 毫秒时间戳
pub fn now_utc_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 事件时间戳（毫秒，u64）
pub fn event_timestamp() -> u64 {
    now_utc_millis().max(0) as u64
}

/// 距离某个时间戳已经过去的时长，未来时间返回 0
pub fn elapsed_since(utc_timestamp_ms: i64) -> Duration {
    let delta = now_utc_millis() - utc_timestamp_ms;
    Duration::from_millis(delta.max(0) as u64)
}

/// 是否早于 `max_age` 之前
pub fn is_older_than(utc_timestamp_ms: i64, max_age: Duration) -> bool {
    elapsed_since(utc_timestamp_ms) > max_age
}

/// ISO 8601 格式（日志用）
pub fn format_iso8601(utc_timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(utc_timestamp_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| utc_timestamp_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_older_than() {
        let now = now_utc_millis();
        assert!(!is_older_than(now, Duration::from_secs(60)));
        assert!(is_older_than(now - 120_000, Duration::from_secs(60)));
        // 未来时间不算过期
        assert!(!is_older_than(now + 60_000, Duration::from_secs(1)));
    }

    #[test]
    fn test_format_iso8601() {
        assert_eq!(format_iso8601(0), "1970-01-01T00:00:00+00:00");
    }
}
