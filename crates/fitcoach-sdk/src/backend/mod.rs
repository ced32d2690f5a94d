//! 后端网关接口
//!
//! 托管后端只通过三类接口被消费：
//! - 查询：按角色列出资料、按参与者对查询会话摘要与消息
//! - 命令：把一组消息的已读时间设置为 "现在"（幂等，对整组原子）
//! - 订阅：按参与者过滤的变更流，支持干净的取消订阅

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::storage::entities::{ChangeEvent, ConversationSummary, Message, MessageId, Profile, Role, UserId};

pub mod memory;

pub use memory::MemoryBackend;

/// 查询 + 命令接口
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// 列出某个角色的全部用户资料
    async fn list_profiles(&self, role: Role) -> Result<Vec<Profile>>;

    /// (用户, 联系人) 的最新一条消息，以及 `user` 作为接收方的未读消息 ID
    async fn conversation_summary(&self, user_id: UserId, contact_id: UserId) -> Result<ConversationSummary>;

    /// 两人之间的全部消息，按发送时间升序
    async fn fetch_conversation(&self, user_id: UserId, contact_id: UserId) -> Result<Vec<Message>>;

    /// 把 `ids` 中 `reader` 作为接收方的消息标记为已读
    async fn mark_read(&self, reader: UserId, ids: &[MessageId]) -> Result<()>;
}

/// 变更流订阅接口
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeSubscription>;
}

/// 变更流过滤条件：当前用户是发送方或接收方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeFilter {
    pub participant: UserId,
}

impl ChangeFilter {
    pub fn participant(user_id: UserId) -> Self {
        Self { participant: user_id }
    }

    pub fn matches(&self, message: &Message) -> bool {
        message.sender_id == self.participant || message.receiver_id == self.participant
    }
}

/// 一个活跃的变更流订阅
///
/// `unsubscribe()` 或 drop 都会通知生产方停止投递。
#[derive(Debug)]
pub struct ChangeSubscription {
    receiver: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
}

impl ChangeSubscription {
    pub fn new(receiver: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// 下一个事件；通道关闭或已取消时返回 None
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            event = self.receiver.recv() => event,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// 生产方用来感知订阅已结束的令牌
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn unsubscribe(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("取消变更流订阅");
            self.cancel.cancel();
        }
        self.receiver.close();
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender_id: UserId, receiver_id: UserId) -> Message {
        Message {
            id: 1,
            sender_id,
            receiver_id,
            sent_at: 0,
            read_at: None,
            content: String::new(),
        }
    }

    #[test]
    fn test_filter_matches_sender_or_receiver() {
        let filter = ChangeFilter::participant(5);
        assert!(filter.matches(&message(5, 6)));
        assert!(filter.matches(&message(6, 5)));
        assert!(!filter.matches(&message(6, 7)));
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = ChangeSubscription::new(rx, CancellationToken::new());
        tx.send(ChangeEvent::insert(message(1, 2))).await.unwrap();
        assert!(sub.next().await.is_some());

        sub.unsubscribe();
        assert!(!sub.is_active());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_cancels_token() {
        let (_tx, rx) = mpsc::channel::<ChangeEvent>(1);
        let token = CancellationToken::new();
        let sub = ChangeSubscription::new(rx, token.clone());
        drop(sub);
        assert!(token.is_cancelled());
    }
}
