//! 收件箱会话 - 一个已登录用户的同步引擎实例
//!
//! 会话持有存储、加载器、批处理器、乐观更新器和实时同步，负责：
//! - 启动时清理过期的已读标记并做首次全量加载
//! - 启动实时订阅和定时复查任务（绑定到会话的 CancellationToken）
//! - 注册焦点刷新 Hook
//! - 退出登录时取消所有后台任务，并可选清空已读标记缓存

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendGateway, ChangeFeed};
use crate::batcher::{BatchOutcome, BatcherStats, ReadMarkBatcher};
use crate::error::{FitcoachSDKError, Result};
use crate::events::{event_builders, EventFilter, EventManager, FilteredEventReceiver, InboxEvent};
use crate::lifecycle::{FocusRefreshHook, LifecycleManager};
use crate::loader::ContactLoader;
use crate::optimistic::OptimisticMutator;
use crate::realtime::RealtimeReconciler;
use crate::sdk::ReadSyncConfig;
use crate::storage::entities::{Contact, CurrentUser, Message, UserId};
use crate::storage::{KvStore, ReadMarkCache};
use crate::store::ContactStore;
use crate::view::ViewContext;

pub struct InboxSession {
    me: CurrentUser,
    store: Arc<ContactStore>,
    events: Arc<EventManager>,
    cache: ReadMarkCache,
    loader: Arc<ContactLoader>,
    batcher: Arc<ReadMarkBatcher>,
    mutator: OptimisticMutator,
    lifecycle: LifecycleManager,
    focus_hook: Arc<FocusRefreshHook>,
    view_tx: watch::Sender<ViewContext>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    active: AtomicBool,
}

impl std::fmt::Debug for InboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboxSession")
            .field("me", &self.me)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl InboxSession {
    /// 启动会话
    pub async fn start(
        me: CurrentUser,
        backend: Arc<dyn BackendGateway>,
        feed: Arc<dyn ChangeFeed>,
        kv: Arc<KvStore>,
        events: Arc<EventManager>,
        config: &ReadSyncConfig,
    ) -> Result<Arc<Self>> {
        info!("🚀 启动收件箱会话: user_id={}, role={}", me.id, me.role);

        let cache = ReadMarkCache::open(&kv, me.id).await?;
        match cache.cleanup_older_than(config.read_mark_retention()).await {
            Ok(removed) => debug!("已读标记过期清理完成: removed={}, remaining={}", removed, cache.len()),
            Err(e) => warn!("已读标记过期清理失败，继续启动: {}", e),
        }

        let store = Arc::new(ContactStore::new(me.id, config.stale_update_capacity));
        let loader = Arc::new(ContactLoader::new(
            backend.clone(),
            cache.clone(),
            store.clone(),
            events.clone(),
            me.clone(),
        ));
        let batcher = Arc::new(ReadMarkBatcher::new(
            backend.clone(),
            cache.clone(),
            store.clone(),
            events.clone(),
        ));
        let mutator = OptimisticMutator::new(
            backend,
            store.clone(),
            batcher.clone(),
            loader.clone(),
            events.clone(),
        );
        let reconciler = Arc::new(RealtimeReconciler::new(
            store.clone(),
            events.clone(),
            batcher.clone(),
            loader.clone(),
            config.focus_settle_delay(),
        ));

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // 先订阅再加载：从订阅开始到加载完成之间合并的事件都记入重放日志
        let initial_load = store.begin_load();
        match reconciler.start(feed, cancel.child_token()).await {
            Ok(handle) => tasks.push(handle),
            Err(e) => {
                warn!("⚠️ 实时订阅失败，仅依赖焦点刷新/定时复查: {}", e);
                events.emit(event_builders::subscription_dropped()).await;
            }
        }

        let loaded = loader.load_contacts().await;
        drop(initial_load);
        if let Err(e) = loaded {
            cancel.cancel();
            join_all(tasks).await;
            return Err(e);
        }

        let (view_tx, view_rx) = watch::channel(ViewContext::Hidden);
        tasks.push(batcher.spawn_review_loop(view_rx, config.review_interval(), cancel.child_token()));

        let focus_hook = Arc::new(FocusRefreshHook::new(reconciler, cancel.child_token()));
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(focus_hook.clone());

        info!("✅ 收件箱会话已启动: user_id={}, contacts={}, total_unread={}", me.id, store.contacts().len(), store.total_unread());

        Ok(Arc::new(Self {
            me,
            store,
            events,
            cache,
            loader,
            batcher,
            mutator,
            lifecycle,
            focus_hook,
            view_tx,
            cancel,
            tasks: Mutex::new(tasks),
            active: AtomicBool::new(true),
        }))
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.is_active() {
            return Err(FitcoachSDKError::ShuttingDown(format!("session for user {} has ended", self.me.id)));
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn user(&self) -> &CurrentUser {
        &self.me
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.store.contacts()
    }

    pub fn contact(&self, contact_id: UserId) -> Option<Contact> {
        self.store.contact(contact_id)
    }

    pub fn unread_count(&self, contact_id: UserId) -> Option<u32> {
        self.store.unread_count(contact_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.store.total_unread()
    }

    /// 当前打开会话的消息
    pub fn conversation(&self) -> Vec<Message> {
        self.store.conversation_messages()
    }

    pub fn store(&self) -> &Arc<ContactStore> {
        &self.store
    }

    pub fn read_marks(&self) -> &ReadMarkCache {
        &self.cache
    }

    /// 打开与联系人的会话（切换视图 + 乐观已读）
    pub async fn open_conversation(&self, contact_id: UserId) -> Result<Vec<Message>> {
        self.ensure_active()?;
        self.set_view(ViewContext::Conversation(contact_id));
        self.mutator.open_conversation(contact_id).await
    }

    pub fn close_conversation(&self) {
        self.store.close_conversation();
        self.set_view(ViewContext::ContactList);
    }

    pub async fn mark_all_read(&self) -> Result<BatchOutcome> {
        self.ensure_active()?;
        self.mutator.mark_all_read().await
    }

    /// 手动触发一次权威刷新
    pub async fn refresh(&self) -> Result<Vec<Contact>> {
        self.ensure_active()?;
        self.loader.refresh().await
    }

    pub fn set_view(&self, view: ViewContext) {
        if self.view_tx.send_replace(view) != view {
            debug!("视图切换: {:?}", view);
        }
    }

    pub fn view(&self) -> ViewContext {
        *self.view_tx.borrow()
    }

    /// 窗口重新获得焦点
    pub async fn on_focus(&self) -> Result<()> {
        self.ensure_active()?;
        self.lifecycle.notify_foreground().await
    }

    /// 窗口失去焦点
    pub async fn on_blur(&self) -> Result<()> {
        self.lifecycle.notify_background().await
    }

    /// 等待最近一次焦点刷新完成
    pub async fn wait_focus_refresh(&self) {
        if let Some(handle) = self.focus_hook.take_pending() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("焦点刷新任务异常结束: {}", e);
                }
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<InboxEvent> {
        self.events.subscribe()
    }

    /// 只接收与某个联系人相关的事件（会话页面用）
    pub fn subscribe_contact_events(&self, contact_id: UserId) -> FilteredEventReceiver {
        self.events
            .subscribe_filtered(EventFilter::new().with_contact_ids(vec![contact_id]))
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn batcher_stats(&self) -> BatcherStats {
        self.batcher.stats()
    }

    /// 结束会话：取消后台任务并等待其退出；`clear_cache` 为 true 时清空已读标记缓存
    pub async fn shutdown(&self, clear_cache: bool) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("🛑 结束收件箱会话: user_id={}, clear_cache={}", self.me.id, clear_cache);

        self.cancel.cancel();
        if let Some(handle) = self.focus_hook.take_pending() {
            handle.abort();
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!("后台任务异常结束: {}", e);
                }
            }
        }

        self.view_tx.send_replace(ViewContext::Hidden);
        self.store.clear();
        if clear_cache {
            self.cache.clear().await?;
        }
        info!("✅ 收件箱会话已结束: user_id={}", self.me.id);
        Ok(())
    }
}

impl Drop for InboxSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
