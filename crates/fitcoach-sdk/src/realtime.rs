//! 实时同步
//!
//! 消费按当前用户过滤的变更流，把 insert/update 事件合并进存储。
//! 合并规则是幂等且与顺序无关的，事件可能与本地进行中的操作交错到达。
//! 订阅断开后只记录并发出事件，正确性由焦点刷新和定时复查兜底。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::{ChangeFeed, ChangeFilter, ChangeSubscription};
use crate::batcher::ReadMarkBatcher;
use crate::error::{FitcoachSDKError, Result};
use crate::events::{event_builders, EventManager};
use crate::loader::ContactLoader;
use crate::optimistic::OptimisticTxn;
use crate::storage::entities::{ChangeEvent, MessageId, UserId};
use crate::store::{ContactStore, MergeOutcome};

pub struct RealtimeReconciler {
    store: Arc<ContactStore>,
    events: Arc<EventManager>,
    batcher: Arc<ReadMarkBatcher>,
    loader: Arc<ContactLoader>,
    settle_delay: Duration,
}

impl RealtimeReconciler {
    pub fn new(
        store: Arc<ContactStore>,
        events: Arc<EventManager>,
        batcher: Arc<ReadMarkBatcher>,
        loader: Arc<ContactLoader>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            store,
            events,
            batcher,
            loader,
            settle_delay,
        }
    }

    /// 订阅变更流并启动消费任务；订阅失败直接返回错误
    pub async fn start(
        self: &Arc<Self>,
        feed: Arc<dyn ChangeFeed>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let filter = ChangeFilter::participant(self.store.me());
        let subscription = feed.subscribe(filter).await?;
        info!("📡 实时同步已订阅: participant={}", filter.participant);

        let reconciler = Arc::clone(self);
        Ok(tokio::spawn(async move {
            reconciler.run(subscription, cancel).await;
        }))
    }

    async fn run(&self, mut subscription: ChangeSubscription, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    subscription.unsubscribe();
                    info!("实时同步任务已停止");
                    break;
                }
                event = subscription.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        let err = FitcoachSDKError::SubscriptionDropped("change feed closed".to_string());
                        warn!("⚠️ {}，依赖焦点刷新/定时复查收敛", err);
                        self.events.emit(event_builders::subscription_dropped()).await;
                        break;
                    }
                },
            }
        }
    }

    /// 处理一个变更事件
    pub async fn handle_event(&self, event: ChangeEvent) {
        let outcome = self.store.apply_merge(&event);
        match outcome {
            MergeOutcome::Inserted {
                contact_id,
                message_id,
                unread,
                unread_count,
            } => {
                debug!("实时插入: message_id={}, contact_id={}, unread={}", message_id, contact_id, unread);
                self.events.emit(event_builders::message_received(event.row)).await;
                if unread {
                    self.events
                        .emit(event_builders::unread_count_changed(contact_id, unread_count))
                        .await;
                }
                self.events
                    .emit(event_builders::contact_list_updated(self.store.contacts()))
                    .await;
                if unread && self.store.open_contact() == Some(contact_id) {
                    self.mark_open_conversation(contact_id, message_id).await;
                }
            }
            MergeOutcome::Updated {
                contact_id,
                unread_count,
            } => {
                self.events
                    .emit(event_builders::unread_count_changed(contact_id, unread_count))
                    .await;
            }
            MergeOutcome::Buffered(message_id) => {
                debug!("更新事件已缓冲: message_id={}", message_id);
            }
            MergeOutcome::UnknownContact(contact_id) => {
                debug!("事件来自不在列表中的联系人，等待下次刷新: contact_id={}", contact_id);
            }
            MergeOutcome::Duplicate | MergeOutcome::Ignored => {
                trace!("忽略事件: message_id={}, outcome={:?}", event.row.id, outcome);
            }
        }
    }

    /// 打开中的会话收到新消息：走乐观路径立即标记已读
    ///
    /// 清零会隐藏该联系人的全部未读消息（例如上一次打开失败后留下的），
    /// 所以批次覆盖全部未读 ID，而不只是新到的这一条。
    async fn mark_open_conversation(&self, contact_id: UserId, message_id: MessageId) {
        let txn = OptimisticTxn::begin_contact(self.store.clone(), contact_id);
        let ids = self.store.unread_message_ids(contact_id);
        txn.apply(|store| store.set_unread_count(contact_id, 0));
        self.events
            .emit(event_builders::unread_count_changed(contact_id, 0))
            .await;

        match self.batcher.mark_read(&ids).await {
            Ok(outcome) => {
                txn.commit();
                debug!("打开的会话自动已读: contact_id={}, message_id={}, sent={}", contact_id, message_id, outcome.sent);
            }
            Err(e) => {
                let restored = txn.rollback();
                warn!("⚠️ 自动标记已读失败: contact_id={}, message_id={}, count={}, error={}", contact_id, message_id, ids.len(), e);
                for (contact_id, unread_count) in restored {
                    self.events
                        .emit(event_builders::unread_count_changed(contact_id, unread_count))
                        .await;
                }
                self.events
                    .emit(event_builders::read_mark_failed(Some(contact_id), &e))
                    .await;
            }
        }
    }

    /// 重新获得焦点后：等待固定的稳定延迟，再做一次权威刷新
    pub async fn reconcile_after_focus(&self, cancel: &CancellationToken) -> Result<()> {
        debug!("焦点恢复，{:?} 后刷新", self.settle_delay);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FitcoachSDKError::ShuttingDown("session cancelled before focus refresh".to_string()));
            }
            _ = tokio::time::sleep(self.settle_delay) => {}
        }
        self.loader.refresh().await?;
        Ok(())
    }
}
