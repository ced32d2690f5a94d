//! 存储模块 - 收件箱同步引擎的本地持久化层
//!
//! - Entities: 数据实体定义，后端行/变更事件的类型安全表示
//! - KvStore: 基于 sled 的用户隔离键值存储
//! - ReadMarkCache: 已确认已读标记的持久化集合（幂等保护）

pub mod entities;
pub mod kv;
pub mod read_mark_cache;

pub use entities::*;
pub use kv::{KvScope, KvStore};
pub use read_mark_cache::{ReadMarkCache, ReadMarkEntry};
