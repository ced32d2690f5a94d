//! 事件系统模块 - 收件箱状态变化通知
//!
//! 功能包括：
//! - 未读数变更事件
//! - 联系人列表更新事件
//! - 新消息 / 已读确认事件
//! - 已读标记失败（非阻塞提示）事件
//! - 事件广播、过滤订阅和按类型监听

use crate::storage::entities::{Contact, Message, MessageId, UserId};
use crate::utils::time::event_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// 收件箱事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboxEvent {
    /// 某个联系人的未读数变化
    UnreadCountChanged {
        contact_id: UserId,
        unread_count: u32,
        timestamp: u64,
    },
    /// 联系人列表整体更新（全量刷新或重新排序）
    ContactListUpdated {
        contacts: Vec<Contact>,
        timestamp: u64,
    },
    /// 实时通道收到新消息
    MessageReceived {
        message: Message,
        timestamp: u64,
    },
    /// 一批消息已被后端确认为已读
    MessagesMarkedRead {
        message_ids: Vec<MessageId>,
        timestamp: u64,
    },
    /// 已读标记失败，本地乐观状态已回滚
    ReadMarkFailed {
        contact_id: Option<UserId>,
        error: String,
        timestamp: u64,
    },
    /// 实时订阅断开
    SubscriptionDropped {
        timestamp: u64,
    },
    /// 全量刷新完成
    RefreshCompleted {
        contact_count: usize,
        timestamp: u64,
    },
}

impl InboxEvent {
    /// 事件类型名
    pub fn event_type(&self) -> &'static str {
        match self {
            InboxEvent::UnreadCountChanged { .. } => "unread_count_changed",
            InboxEvent::ContactListUpdated { .. } => "contact_list_updated",
            InboxEvent::MessageReceived { .. } => "message_received",
            InboxEvent::MessagesMarkedRead { .. } => "messages_marked_read",
            InboxEvent::ReadMarkFailed { .. } => "read_mark_failed",
            InboxEvent::SubscriptionDropped { .. } => "subscription_dropped",
            InboxEvent::RefreshCompleted { .. } => "refresh_completed",
        }
    }

    /// 事件关联的联系人
    pub fn contact_id(&self) -> Option<UserId> {
        match self {
            InboxEvent::UnreadCountChanged { contact_id, .. } => Some(*contact_id),
            InboxEvent::MessageReceived { message, .. } => Some(message.sender_id),
            InboxEvent::ReadMarkFailed { contact_id, .. } => *contact_id,
            _ => None,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            InboxEvent::UnreadCountChanged { timestamp, .. }
            | InboxEvent::ContactListUpdated { timestamp, .. }
            | InboxEvent::MessageReceived { timestamp, .. }
            | InboxEvent::MessagesMarkedRead { timestamp, .. }
            | InboxEvent::ReadMarkFailed { timestamp, .. }
            | InboxEvent::SubscriptionDropped { timestamp }
            | InboxEvent::RefreshCompleted { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 联系人过滤器
    pub contact_ids: Option<Vec<UserId>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加事件类型过滤
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// 添加联系人过滤
    pub fn with_contact_ids(mut self, contact_ids: Vec<UserId>) -> Self {
        self.contact_ids = Some(contact_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &InboxEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref contact_ids) = self.contact_ids {
            match event.contact_id() {
                Some(contact_id) if contact_ids.contains(&contact_id) => {}
                _ => return false, // 事件没有联系人或不在列表中
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&InboxEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<InboxEvent>,
    /// 事件监听器映射，"*" 为通用监听器
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<u64>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: InboxEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 的客户端）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<InboxEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器（`"*"` 接收所有事件）
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&InboxEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners.entry(event_type.to_string()).or_insert_with(Vec::new).push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<InboxEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<InboxEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<InboxEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<InboxEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    pub fn unread_count_changed(contact_id: UserId, unread_count: u32) -> InboxEvent {
        InboxEvent::UnreadCountChanged {
            contact_id,
            unread_count,
            timestamp: event_timestamp(),
        }
    }

    pub fn contact_list_updated(contacts: Vec<Contact>) -> InboxEvent {
        InboxEvent::ContactListUpdated {
            contacts,
            timestamp: event_timestamp(),
        }
    }

    pub fn message_received(message: Message) -> InboxEvent {
        InboxEvent::MessageReceived {
            message,
            timestamp: event_timestamp(),
        }
    }

    pub fn messages_marked_read(message_ids: Vec<MessageId>) -> InboxEvent {
        InboxEvent::MessagesMarkedRead {
            message_ids,
            timestamp: event_timestamp(),
        }
    }

    /// 已读标记失败，用于 UI 展示非阻塞提示
    pub fn read_mark_failed(contact_id: Option<UserId>, error: &crate::error::FitcoachSDKError) -> InboxEvent {
        InboxEvent::ReadMarkFailed {
            contact_id,
            error: error.to_string(),
            timestamp: event_timestamp(),
        }
    }

    pub fn subscription_dropped() -> InboxEvent {
        InboxEvent::SubscriptionDropped {
            timestamp: event_timestamp(),
        }
    }

    pub fn refresh_completed(contact_count: usize) -> InboxEvent {
        InboxEvent::RefreshCompleted {
            contact_count,
            timestamp: event_timestamp(),
        }
    }
}
