//! 已读标记批处理器
//!
//! 把 "这 N 条消息应该变成已读" 转换成恰好一次后端命令和一次本地缓存写入：
//! 1. 过滤掉本地缓存中已确认的 ID
//! 2. 剩余为空则直接返回
//! 3. 对剩余 ID 发出一次批量命令
//! 4. 成功：写入缓存，并把本地消息的已读时间合并为 "现在"
//! 5. 失败：不写缓存（以便后续触发重试），把错误交给调用方回滚
//!
//! 批次之间由 flush 锁串行化，锁跨越后端调用，因此并发的重复批次会在
//! 拿到锁后重新过滤并变成空操作。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendGateway;
use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::storage::entities::{MessageId, UserId};
use crate::storage::ReadMarkCache;
use crate::store::ContactStore;
use crate::utils::time::now_utc_millis;
use crate::view::{ReviewScope, ViewContext};

/// 一次批处理的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// 去重后的候选数
    pub requested: usize,
    /// 实际发给后端的数量
    pub sent: usize,
    /// 因本地已确认而跳过的数量
    pub skipped: usize,
}

impl BatchOutcome {
    pub fn is_noop(&self) -> bool {
        self.sent == 0
    }
}

/// 批处理统计
#[derive(Debug, Clone, Default)]
pub struct BatcherStats {
    pub commands_sent: u64,
    pub ids_sent: u64,
    pub ids_skipped: u64,
    pub failures: u64,
    pub review_runs: u64,
}

pub struct ReadMarkBatcher {
    backend: Arc<dyn BackendGateway>,
    cache: ReadMarkCache,
    store: Arc<ContactStore>,
    events: Arc<EventManager>,
    me: UserId,
    flush_lock: Mutex<()>,
    stats: SyncMutex<BatcherStats>,
}

impl ReadMarkBatcher {
    pub fn new(
        backend: Arc<dyn BackendGateway>,
        cache: ReadMarkCache,
        store: Arc<ContactStore>,
        events: Arc<EventManager>,
    ) -> Self {
        let me = store.me();
        Self {
            backend,
            cache,
            store,
            events,
            me,
            flush_lock: Mutex::new(()),
            stats: SyncMutex::new(BatcherStats::default()),
        }
    }

    /// 批量标记已读
    pub async fn mark_read(&self, ids: &[MessageId]) -> Result<BatchOutcome> {
        let candidates: Vec<MessageId> = ids.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if candidates.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let _guard = self.flush_lock.lock().await;

        let pending = self.cache.filter_unconfirmed(&candidates);
        let skipped = candidates.len() - pending.len();
        let outcome = BatchOutcome {
            requested: candidates.len(),
            sent: pending.len(),
            skipped,
        };
        self.stats.lock().ids_skipped += skipped as u64;

        if pending.is_empty() {
            debug!("已读标记全部已确认，跳过: requested={}", candidates.len());
            // 缓存里已有，本地状态可能还没跟上（例如上一会话确认过）
            self.apply_confirmed(&candidates).await;
            return Ok(outcome);
        }

        debug!("发送已读标记: user_id={}, count={}, skipped={}", self.me, pending.len(), skipped);
        if let Err(e) = self.backend.mark_read(self.me, &pending).await {
            self.stats.lock().failures += 1;
            warn!("❌ 已读标记命令失败: count={}, error={}", pending.len(), e);
            return Err(e);
        }

        {
            let mut stats = self.stats.lock();
            stats.commands_sent += 1;
            stats.ids_sent += pending.len() as u64;
        }

        // 后端写入和缓存写入之间没有事务，写缓存失败最多导致一次多余的请求
        if let Err(e) = self.cache.add_all(&pending).await {
            warn!("写入已读标记缓存失败: count={}, error={}", pending.len(), e);
        }

        // 跳过的 ID 早已确认，一并合并进本地状态
        self.apply_confirmed(&candidates).await;
        info!("✅ 已读标记完成: sent={}, skipped={}", pending.len(), skipped);
        self.events
            .emit(event_builders::messages_marked_read(pending))
            .await;
        Ok(outcome)
    }

    async fn apply_confirmed(&self, ids: &[MessageId]) {
        let changed = self.store.mark_messages_read(ids, now_utc_millis());
        for (contact_id, unread_count) in changed {
            self.events
                .emit(event_builders::unread_count_changed(contact_id, unread_count))
                .await;
        }
    }

    /// 对一个范围内的未读消息做一次复查
    pub async fn review(&self, scope: ReviewScope) -> Result<BatchOutcome> {
        let ids = match scope {
            ReviewScope::All => self.store.all_unread_message_ids(),
            ReviewScope::Contact(contact_id) => self.store.unread_message_ids(contact_id),
        };
        self.stats.lock().review_runs += 1;
        if ids.is_empty() {
            return Ok(BatchOutcome::default());
        }
        debug!("定时复查未读消息: scope={:?}, candidates={}", scope, ids.len());
        self.mark_read(&ids).await
    }

    /// 启动定时复查任务，只在当前视图需要复查时执行
    pub fn spawn_review_loop(
        self: &Arc<Self>,
        mut view: watch::Receiver<ViewContext>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval 的第一次 tick 立即返回
            ticker.tick().await;
            info!("⏱️ 已读复查任务启动: interval={:?}", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let scope = view.borrow_and_update().review_scope();
                        let Some(scope) = scope else {
                            continue;
                        };
                        if let Err(e) = batcher.review(scope).await {
                            warn!("定时复查失败，等待下次触发: {}", e);
                        }
                    }
                }
            }
            info!("已读复查任务已停止");
        })
    }

    pub fn stats(&self) -> BatcherStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::storage::entities::{CurrentUser, Role};
    use crate::storage::KvStore;
    use crate::loader::ContactLoader;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        backend: Arc<MemoryBackend>,
        store: Arc<ContactStore>,
        cache: ReadMarkCache,
        batcher: Arc<ReadMarkBatcher>,
        loader: ContactLoader,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.add_profile(1, "Coach Li", Role::Professor);
        backend.add_profile(2, "Wang", Role::Student);
        let kv = Arc::new(KvStore::new(dir.path()).await.unwrap());
        let cache = ReadMarkCache::open(&kv, 1).await.unwrap();
        let store = Arc::new(ContactStore::new(1, 16));
        let events = Arc::new(EventManager::new(64));
        let batcher = Arc::new(ReadMarkBatcher::new(backend.clone(), cache.clone(), store.clone(), events.clone()));
        let loader = ContactLoader::new(
            backend.clone(),
            cache.clone(),
            store.clone(),
            events,
            CurrentUser::new(1, "Coach Li", Role::Professor),
        );
        Fixture { _dir: dir, backend, store, cache, batcher, loader }
    }

    #[tokio::test]
    async fn test_only_unconfirmed_ids_are_sent() {
        let f = fixture().await;
        let m1 = f.backend.send_message(2, 1, "1");
        let m2 = f.backend.send_message(2, 1, "2");
        let m3 = f.backend.send_message(2, 1, "3");
        f.loader.load_contacts().await.unwrap();
        f.cache.add_all(&[m1.id, m2.id]).await.unwrap();

        let outcome = f.batcher.mark_read(&[m1.id, m2.id, m3.id]).await.unwrap();
        assert_eq!(outcome, BatchOutcome { requested: 3, sent: 1, skipped: 2 });
        assert_eq!(f.backend.mark_read_calls(), vec![vec![m3.id]]);
    }

    #[tokio::test]
    async fn test_second_call_is_noop() {
        let f = fixture().await;
        let m1 = f.backend.send_message(2, 1, "1");
        f.loader.load_contacts().await.unwrap();

        assert_eq!(f.batcher.mark_read(&[m1.id, m1.id]).await.unwrap().sent, 1);
        assert!(f.batcher.mark_read(&[m1.id]).await.unwrap().is_noop());
        assert_eq!(f.backend.mark_read_calls().len(), 1);
        assert_eq!(f.store.unread_count(2), Some(0));
        assert!(f.store.message(m1.id).map_or(true, |m| m.read_at.is_some()));
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_untouched() {
        let f = fixture().await;
        let m1 = f.backend.send_message(2, 1, "1");
        f.loader.load_contacts().await.unwrap();
        f.backend.set_fail_mark_read(true);

        assert!(f.batcher.mark_read(&[m1.id]).await.is_err());
        assert!(!f.cache.has(m1.id).unwrap());
        assert_eq!(f.store.unread_count(2), Some(1));
        assert_eq!(f.batcher.stats().failures, 1);

        f.backend.set_fail_mark_read(false);
        assert_eq!(f.batcher.mark_read(&[m1.id]).await.unwrap().sent, 1);
        assert_eq!(f.backend.mark_read_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_batches_send_one_command() {
        let f = fixture().await;
        let m1 = f.backend.send_message(2, 1, "1");
        let m2 = f.backend.send_message(2, 1, "2");
        f.loader.load_contacts().await.unwrap();
        f.backend.set_mark_read_delay(Some(Duration::from_millis(30)));

        let ids = [m1.id, m2.id];
        let (a, b) = tokio::join!(f.batcher.mark_read(&ids), f.batcher.mark_read(&ids));
        assert_eq!(a.unwrap().sent + b.unwrap().sent, 2);
        assert_eq!(f.backend.mark_read_calls().len(), 1);
        assert_eq!(f.store.unread_count(2), Some(0));
    }

    #[tokio::test]
    async fn test_review_respects_scope() {
        let f = fixture().await;
        f.backend.send_message(2, 1, "1");
        f.loader.load_contacts().await.unwrap();

        let outcome = f.batcher.review(ReviewScope::Contact(99)).await.unwrap();
        assert!(outcome.is_noop());
        assert!(f.backend.mark_read_calls().is_empty());

        let outcome = f.batcher.review(ReviewScope::All).await.unwrap();
        assert_eq!(outcome.sent, 1);
        assert_eq!(f.store.total_unread(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_review_loop_only_runs_in_review_views() {
        let f = fixture().await;
        f.backend.send_message(2, 1, "1");
        f.loader.load_contacts().await.unwrap();

        let (view_tx, view_rx) = watch::channel(ViewContext::ContactList);
        let cancel = CancellationToken::new();
        let handle = f.batcher.spawn_review_loop(view_rx, Duration::from_secs(30), cancel.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(f.backend.mark_read_calls().is_empty());

        view_tx.send(ViewContext::Inbox).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.backend.mark_read_calls().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
