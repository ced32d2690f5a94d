//! 已读标记缓存（ReadMarkSet）
//!
//! 记录已经成功发送到后端的已读标记，跨重启保留，只用作幂等保护：
//! 避免重叠的触发源（手动打开、焦点刷新、定时复查）重复发起网络请求。
//! 它不是未读数的数据源，过期或被清空最多导致一次多余的后端调用。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::entities::{MessageId, UserId};
use crate::storage::kv::{purposes, KvScope, KvStore};
use crate::utils::time::{is_older_than, now_utc_millis};

/// 单条已读标记记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMarkEntry {
    /// 后端确认的时间（UTC 毫秒）
    pub confirmed_at: i64,
}

/// 用户维度的已读标记缓存，键空间为 `read_marks_<userId>`
#[derive(Debug, Clone)]
pub struct ReadMarkCache {
    user_id: UserId,
    scope: KvScope,
}

impl ReadMarkCache {
    /// 打开某个用户的已读标记缓存
    pub async fn open(kv: &Arc<KvStore>, user_id: UserId) -> Result<Self> {
        let scope = kv.scope(&user_id.to_string(), purposes::READ_MARKS).await?;
        debug!("已读标记缓存已打开: namespace={}, entries={}", scope.namespace(), scope.len());
        Ok(Self { user_id, scope })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn namespace(&self) -> &str {
        self.scope.namespace()
    }

    /// 是否已确认
    pub fn has(&self, id: MessageId) -> Result<bool> {
        self.scope.exists(&id.to_string())
    }

    /// 过滤出尚未确认的 ID（去重，保持升序）
    ///
    /// 读缓存失败时按 "未确认" 处理：缓存只是建议性的，宁可多发一次请求。
    pub fn filter_unconfirmed(&self, ids: &[MessageId]) -> Vec<MessageId> {
        let unique: BTreeSet<MessageId> = ids.iter().copied().collect();
        unique
            .into_iter()
            .filter(|id| match self.has(*id) {
                Ok(confirmed) => !confirmed,
                Err(e) => {
                    warn!("读取已读标记缓存失败，按未确认处理: message_id={}, error={}", id, e);
                    true
                }
            })
            .collect()
    }

    /// 批量记录已确认的 ID，一次 sled batch + 一次刷盘
    pub async fn add_all(&self, ids: &[MessageId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let entry = ReadMarkEntry { confirmed_at: now_utc_millis() };
        let pairs: Vec<(String, ReadMarkEntry)> = ids.iter().map(|id| (id.to_string(), entry)).collect();
        self.scope.set_batch(pairs)?;
        self.scope.flush().await?;
        debug!("已读标记缓存写入 {} 条: namespace={}", ids.len(), self.namespace());
        Ok(())
    }

    /// 全部清空（退出登录时调用）
    pub async fn clear(&self) -> Result<usize> {
        let removed = self.scope.clear()?;
        self.scope.flush().await?;
        info!("🧹 已读标记缓存已清空: namespace={}, removed={}", self.namespace(), removed);
        Ok(removed)
    }

    /// 按年龄淘汰：删除确认时间早于 `retention` 的记录，返回删除条数
    pub async fn cleanup_older_than(&self, retention: Duration) -> Result<usize> {
        let entries: Vec<(String, ReadMarkEntry)> = self.scope.scan()?;
        let expired: Vec<String> = entries
            .into_iter()
            .filter(|(_, entry)| is_older_than(entry.confirmed_at, retention))
            .map(|(key, _)| key)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        self.scope.remove_batch(&expired)?;
        self.scope.flush().await?;
        info!(
            "🧹 清理过期已读标记: namespace={}, removed={}, retention={:?}",
            self.namespace(),
            expired.len(),
            retention
        );
        Ok(expired.len())
    }

    /// 直接写入一条带指定确认时间的记录（迁移/测试用）
    pub fn insert_with_timestamp(&self, id: MessageId, confirmed_at: i64) -> Result<()> {
        self.scope.set(&id.to_string(), &ReadMarkEntry { confirmed_at })
    }

    pub fn len(&self) -> usize {
        self.scope.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scope.is_empty()
    }
}
