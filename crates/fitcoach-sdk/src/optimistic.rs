//! 乐观更新
//!
//! 用户发起的已读操作先立即修改本地状态，再等后端确认；失败时恢复到
//! 乐观写入之前的精确值。流程由 `OptimisticTxn` 统一表达：
//! 快照 -> 乐观修改 -> 等待后端 -> 提交（丢弃快照）或回滚（恢复快照）。

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::BackendGateway;
use crate::batcher::{BatchOutcome, ReadMarkBatcher};
use crate::error::{FitcoachSDKError, Result};
use crate::events::{event_builders, EventManager};
use crate::loader::ContactLoader;
use crate::storage::entities::{Message, UserId};
use crate::store::{ContactStore, UnreadSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Pending,
    Committed,
    RolledBack,
}

/// 乐观事务
///
/// 未提交就被 drop（例如调用方的 future 被取消）时自动回滚。
pub struct OptimisticTxn {
    store: Arc<ContactStore>,
    snapshot: UnreadSnapshot,
    state: TxnState,
}

impl OptimisticTxn {
    /// 对单个联系人开启事务
    pub fn begin_contact(store: Arc<ContactStore>, contact_id: UserId) -> Self {
        let snapshot = store.snapshot_unread_count(contact_id);
        Self {
            store,
            snapshot,
            state: TxnState::Pending,
        }
    }

    /// 对全部联系人开启事务
    pub fn begin_all(store: Arc<ContactStore>) -> Self {
        let snapshot = store.snapshot_unread_counts();
        Self {
            store,
            snapshot,
            state: TxnState::Pending,
        }
    }

    pub fn snapshot(&self) -> &UnreadSnapshot {
        &self.snapshot
    }

    /// 执行乐观修改
    pub fn apply<F, T>(&self, mutation: F) -> T
    where
        F: FnOnce(&ContactStore) -> T,
    {
        mutation(&self.store)
    }

    pub fn commit(mut self) {
        self.state = TxnState::Committed;
    }

    /// 恢复快照，返回实际被恢复的 (联系人, 未读数)
    pub fn rollback(mut self) -> Vec<(UserId, u32)> {
        self.state = TxnState::RolledBack;
        self.store.restore_unread_counts(&self.snapshot)
    }
}

impl Drop for OptimisticTxn {
    fn drop(&mut self) {
        if self.state == TxnState::Pending {
            warn!("乐观事务未完成即被丢弃，回滚未读数: contacts={}", self.snapshot.counts().len());
            self.store.restore_unread_counts(&self.snapshot);
        }
    }
}

/// 乐观更新器：打开会话、全部标记已读
pub struct OptimisticMutator {
    backend: Arc<dyn BackendGateway>,
    store: Arc<ContactStore>,
    batcher: Arc<ReadMarkBatcher>,
    loader: Arc<ContactLoader>,
    events: Arc<EventManager>,
}

impl OptimisticMutator {
    pub fn new(
        backend: Arc<dyn BackendGateway>,
        store: Arc<ContactStore>,
        batcher: Arc<ReadMarkBatcher>,
        loader: Arc<ContactLoader>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            backend,
            store,
            batcher,
            loader,
            events,
        }
    }

    /// 打开与某个联系人的会话
    ///
    /// 未读数立即清零，然后载入消息并批量标记已读；任一步失败都恢复原未读数，
    /// 发出 `ReadMarkFailed` 事件并返回错误，不自动重试。
    pub async fn open_conversation(&self, contact_id: UserId) -> Result<Vec<Message>> {
        if self.store.contact(contact_id).is_none() {
            return Err(FitcoachSDKError::NotFound(format!("contact {}", contact_id)));
        }

        let txn = OptimisticTxn::begin_contact(self.store.clone(), contact_id);
        let prior = txn.snapshot().get(contact_id).unwrap_or(0);
        if prior > 0 {
            txn.apply(|store| store.set_unread_count(contact_id, 0));
            self.events
                .emit(event_builders::unread_count_changed(contact_id, 0))
                .await;
        }
        // 先标记会话已打开，载入期间到达的新消息也会走自动已读
        self.store.open_conversation(contact_id, Vec::new());

        match self.load_and_mark(contact_id).await {
            Ok(outcome) => {
                txn.commit();
                debug!(
                    "会话已打开: contact_id={}, prior_unread={}, sent={}, skipped={}",
                    contact_id, prior, outcome.sent, outcome.skipped
                );
                Ok(self.store.conversation_messages())
            }
            Err(e) => {
                let restored = txn.rollback();
                warn!("⚠️ 打开会话时标记已读失败，未读数恢复为 {}: contact_id={}, error={}", prior, contact_id, e);
                self.emit_restored(restored).await;
                self.events
                    .emit(event_builders::read_mark_failed(Some(contact_id), &e))
                    .await;
                Err(e)
            }
        }
    }

    async fn load_and_mark(&self, contact_id: UserId) -> Result<BatchOutcome> {
        let me = self.store.me();
        let messages = self.backend.fetch_conversation(me, contact_id).await?;
        self.store.open_conversation(contact_id, messages);
        let ids = self.store.unread_message_ids(contact_id);
        self.batcher.mark_read(&ids).await
    }

    /// 全部标记已读
    ///
    /// 失败时恢复全部快照并触发一次全量刷新，而不是做局部回滚。
    pub async fn mark_all_read(&self) -> Result<BatchOutcome> {
        let txn = OptimisticTxn::begin_all(self.store.clone());
        let ids = self.store.all_unread_message_ids();

        let zeroed: Vec<UserId> = txn.apply(|store| {
            txn.snapshot()
                .counts()
                .iter()
                .filter(|(_, n)| *n > 0)
                .filter_map(|(contact_id, _)| store.set_unread_count(*contact_id, 0).map(|_| *contact_id))
                .collect()
        });
        for contact_id in &zeroed {
            self.events
                .emit(event_builders::unread_count_changed(*contact_id, 0))
                .await;
        }

        match self.batcher.mark_read(&ids).await {
            Ok(outcome) => {
                txn.commit();
                info!("✅ 全部标记已读: contacts={}, sent={}, skipped={}", zeroed.len(), outcome.sent, outcome.skipped);
                Ok(outcome)
            }
            Err(e) => {
                let restored = txn.rollback();
                warn!("⚠️ 全部标记已读失败，恢复快照并刷新: error={}", e);
                self.emit_restored(restored).await;
                self.events
                    .emit(event_builders::read_mark_failed(None, &e))
                    .await;
                if let Err(refresh_err) = self.loader.refresh().await {
                    warn!("全部标记已读失败后的刷新也失败: {}", refresh_err);
                }
                Err(e)
            }
        }
    }

    async fn emit_restored(&self, restored: Vec<(UserId, u32)>) {
        for (contact_id, unread_count) in restored {
            self.events
                .emit(event_builders::unread_count_changed(contact_id, unread_count))
                .await;
        }
    }
}
