//! 通用工具

pub mod time;

pub use time::{now_utc_millis, event_timestamp};
