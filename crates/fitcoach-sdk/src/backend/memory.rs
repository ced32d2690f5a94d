//! 进程内后端实现
//!
//! 用于演示、集成测试和本地开发。支持故障注入（离线、命令失败、
//! 单个联系人摘要失败）和命令计数。

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendGateway, ChangeFeed, ChangeFilter, ChangeSubscription};
use crate::error::{FitcoachSDKError, Result};
use crate::storage::entities::{
    ChangeEvent, ConversationSummary, Message, MessageId, Profile, Role, UserId,
};
use crate::utils::time::now_utc_millis;

/// 每个订阅者的通道容量
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

struct Subscriber {
    filter: ChangeFilter,
    sender: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct MemoryState {
    profiles: Vec<Profile>,
    messages: BTreeMap<MessageId, Message>,
    subscribers: Vec<Subscriber>,
    mark_read_calls: Vec<Vec<MessageId>>,
    fail_mark_read: bool,
    offline: bool,
    failing_summaries: HashSet<UserId>,
    mark_read_delay: Option<Duration>,
    last_sent_at: i64,
}

/// 内存后端
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    next_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 添加一个用户资料
    pub fn add_profile<S: Into<String>>(&self, id: UserId, name: S, role: Role) -> Profile {
        let name = name.into();
        let profile = Profile {
            id,
            email: format!("{}@fitcoach.local", name.to_lowercase().replace(' ', ".")),
            name,
            role,
        };
        let mut state = self.state.lock();
        state.profiles.retain(|p| p.id != id);
        state.profiles.push(profile.clone());
        profile
    }

    /// 模拟另一端发送一条消息，并向订阅者推送 insert 事件
    pub fn send_message<S: Into<String>>(&self, from: UserId, to: UserId, content: S) -> Message {
        let id = self.allocate_id();
        let mut state = self.state.lock();
        let sent_at = now_utc_millis().max(state.last_sent_at + 1);
        state.last_sent_at = sent_at;
        let message = Message {
            id,
            sender_id: from,
            receiver_id: to,
            sent_at,
            read_at: None,
            content: content.into(),
        };
        state.messages.insert(id, message.clone());
        Self::publish_locked(&mut state, ChangeEvent::insert(message.clone()));
        message
    }

    /// 直接写入一条消息（不推送事件），用于构造初始数据
    pub fn insert_message(&self, message: Message) {
        self.next_id.fetch_max(message.id + 1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.last_sent_at = state.last_sent_at.max(message.sent_at);
        state.messages.insert(message.id, message);
    }

    /// 直接推送一个事件（可以是乱序或重复的），不修改后端数据
    pub fn publish(&self, event: ChangeEvent) {
        let mut state = self.state.lock();
        Self::publish_locked(&mut state, event);
    }

    /// 断开所有订阅，模拟实时通道掉线
    pub fn drop_subscriptions(&self) {
        let mut state = self.state.lock();
        for sub in state.subscribers.drain(..) {
            sub.cancel.cancel();
        }
        info!("🔌 内存后端已断开全部订阅");
    }

    pub fn set_fail_mark_read(&self, fail: bool) {
        self.state.lock().fail_mark_read = fail;
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// 让某个联系人的会话摘要查询失败
    pub fn fail_summary_for(&self, contact_id: UserId, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_summaries.insert(contact_id);
        } else {
            state.failing_summaries.remove(&contact_id);
        }
    }

    /// 每次 mark_read 命令前的人为延迟
    pub fn set_mark_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().mark_read_delay = delay;
    }

    /// 所有 mark_read 命令调用（包括失败的）
    pub fn mark_read_calls(&self) -> Vec<Vec<MessageId>> {
        self.state.lock().mark_read_calls.clone()
    }

    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.state.lock().messages.get(&id).cloned()
    }

    /// 后端真实的未读数：`user` 收到的、来自 `contact` 且未读的消息
    pub fn unread_count_for(&self, user_id: UserId, contact_id: UserId) -> usize {
        self.state
            .lock()
            .messages
            .values()
            .filter(|m| m.sender_id == contact_id && m.is_unread_for(user_id))
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.cancel.is_cancelled());
        state.subscribers.len()
    }

    fn allocate_id(&self) -> MessageId {
        self.next_id.fetch_max(1, Ordering::SeqCst);
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_online(state: &MemoryState) -> Result<()> {
        if state.offline {
            return Err(FitcoachSDKError::network("memory backend is offline"));
        }
        Ok(())
    }

    fn publish_locked(state: &mut MemoryState, event: ChangeEvent) {
        state.subscribers.retain(|sub| {
            if sub.cancel.is_cancelled() {
                return false;
            }
            if !sub.filter.matches(&event.row) {
                return true;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("订阅者通道已满，丢弃事件: message_id={}", event.row.id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn between(message: &Message, a: UserId, b: UserId) -> bool {
        (message.sender_id == a && message.receiver_id == b)
            || (message.sender_id == b && message.receiver_id == a)
    }
}

#[async_trait]
impl BackendGateway for MemoryBackend {
    async fn list_profiles(&self, role: Role) -> Result<Vec<Profile>> {
        let state = self.state.lock();
        Self::ensure_online(&state)?;
        Ok(state.profiles.iter().filter(|p| p.role == role).cloned().collect())
    }

    async fn conversation_summary(&self, user_id: UserId, contact_id: UserId) -> Result<ConversationSummary> {
        let state = self.state.lock();
        Self::ensure_online(&state)?;
        if state.failing_summaries.contains(&contact_id) {
            return Err(FitcoachSDKError::network(format!("summary lookup failed for {}", contact_id)));
        }

        let mut latest: Option<&Message> = None;
        let mut unread_ids = Vec::new();
        for message in state.messages.values().filter(|m| Self::between(m, user_id, contact_id)) {
            if latest.map_or(true, |l| message.sent_at >= l.sent_at) {
                latest = Some(message);
            }
            if message.is_unread_for(user_id) {
                unread_ids.push(message.id);
            }
        }

        Ok(ConversationSummary {
            latest: latest.cloned(),
            unread_ids,
        })
    }

    async fn fetch_conversation(&self, user_id: UserId, contact_id: UserId) -> Result<Vec<Message>> {
        let state = self.state.lock();
        Self::ensure_online(&state)?;
        let mut messages: Vec<Message> = state
            .messages
            .values()
            .filter(|m| Self::between(m, user_id, contact_id))
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.sent_at, m.id));
        Ok(messages)
    }

    async fn mark_read(&self, reader: UserId, ids: &[MessageId]) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.mark_read_calls.push(ids.to_vec());
            state.mark_read_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        Self::ensure_online(&state)?;
        if state.fail_mark_read {
            return Err(FitcoachSDKError::network("mark_read command rejected"));
        }

        let now = now_utc_millis();
        let mut updated = Vec::new();
        for id in ids {
            if let Some(message) = state.messages.get_mut(id) {
                if message.receiver_id == reader && message.merge_read_at(Some(now)) {
                    updated.push(message.clone());
                }
            }
        }
        debug!("内存后端标记已读: reader={}, requested={}, updated={}", reader, ids.len(), updated.len());

        for message in updated {
            Self::publish_locked(&mut state, ChangeEvent::update(message));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeSubscription> {
        let mut state = self.state.lock();
        Self::ensure_online(&state)?;
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        state.subscribers.push(Subscriber {
            filter,
            sender,
            cancel: cancel.clone(),
        });
        info!("📡 新的变更流订阅: participant={}", filter.participant);
        Ok(ChangeSubscription::new(receiver, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::ChangeOp;

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_profile(1, "Coach Li", Role::Professor);
        backend.add_profile(2, "Student Wang", Role::Student);
        backend.add_profile(3, "Student Zhao", Role::Student);
        backend
    }

    #[tokio::test]
    async fn test_summary_counts_only_receiver_side_unread() {
        let backend = backend();
        backend.send_message(2, 1, "hi coach");
        backend.send_message(2, 1, "are you there?");
        let reply = backend.send_message(1, 2, "yes");

        let summary = backend.conversation_summary(1, 2).await.unwrap();
        assert_eq!(summary.unread_ids.len(), 2);
        assert_eq!(summary.latest.unwrap().id, reply.id);

        let summary = backend.conversation_summary(2, 1).await.unwrap();
        assert_eq!(summary.unread_ids, vec![reply.id]);
    }

    #[tokio::test]
    async fn test_mark_read_only_sets_receiver_messages() {
        let backend = backend();
        let incoming = backend.send_message(2, 1, "hi");
        let outgoing = backend.send_message(1, 2, "hello");

        backend.mark_read(1, &[incoming.id, outgoing.id]).await.unwrap();
        assert!(backend.message(incoming.id).unwrap().read_at.is_some());
        assert!(backend.message(outgoing.id).unwrap().read_at.is_none());
        assert_eq!(backend.mark_read_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_receives_filtered_events() {
        let backend = backend();
        let mut sub = backend.subscribe(ChangeFilter::participant(1)).await.unwrap();

        backend.send_message(2, 3, "not for coach");
        let msg = backend.send_message(2, 1, "for coach");
        let event = sub.next().await.unwrap();
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.row.id, msg.id);

        backend.mark_read(1, &[msg.id]).await.unwrap();
        let event = sub.next().await.unwrap();
        assert_eq!(event.op, ChangeOp::Update);
        assert!(event.row.read_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backend = backend();
        let msg = backend.send_message(2, 1, "hi");

        backend.set_fail_mark_read(true);
        assert!(backend.mark_read(1, &[msg.id]).await.is_err());
        assert!(backend.message(msg.id).unwrap().read_at.is_none());

        backend.fail_summary_for(2, true);
        assert!(backend.conversation_summary(1, 2).await.is_err());
        assert!(backend.conversation_summary(1, 3).await.is_ok());

        backend.set_offline(true);
        assert!(backend.list_profiles(Role::Student).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_subscriptions_ends_stream() {
        let backend = backend();
        let mut sub = backend.subscribe(ChangeFilter::participant(1)).await.unwrap();
        assert_eq!(backend.subscriber_count(), 1);
        backend.drop_subscriptions();
        assert!(sub.next().await.is_none());
        assert_eq!(backend.subscriber_count(), 0);
    }
}
