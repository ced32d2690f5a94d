//! 数据实体定义
//!
//! 这里定义了收件箱同步引擎使用的所有实体，用于：
//! - 后端查询结果的类型安全表示
//! - 实时变更事件的载体
//! - 序列化/反序列化支持

use serde::{Deserialize, Serialize};
use std::fmt;

/// 用户 ID（教练/学员）
pub type UserId = u64;
/// 消息 ID（服务端分配，稳定且唯一）
pub type MessageId = u64;

/// 联系人列表中预览文本的最大字符数
pub const PREVIEW_MAX_CHARS: usize = 80;

/// 用户角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Professor,
    Student,
}

impl Role {
    /// 对端角色：教练的联系人是学员，学员的联系人是教练
    pub fn counterpart(self) -> Role {
        match self {
            Role::Professor => Role::Student,
            Role::Student => Role::Professor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Professor => "professor",
            Role::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 当前登录用户（由认证模块提供）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: UserId,
    pub name: String,
    pub role: Role,
}

impl CurrentUser {
    pub fn new<S: Into<String>>(id: UserId, name: S, role: Role) -> Self {
        Self {
            id,
            name: name.into(),
            role,
        }
    }
}

/// 用户资料 - 后端 profiles 行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// 消息实体 - 后端 messages 行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    /// 发送时间（UTC 毫秒）
    pub sent_at: i64,
    /// 已读时间（UTC 毫秒），未读时为 None；一旦设置就不会再被清空
    pub read_at: Option<i64>,
    pub content: String,
}

impl Message {
    /// 对 `user_id` 来说是否是一条未读的收到消息
    pub fn is_unread_for(&self, user_id: UserId) -> bool {
        self.receiver_id == user_id && self.read_at.is_none()
    }

    /// 站在 `user_id` 视角的对端用户；与 `user_id` 无关的消息返回 None
    pub fn counterpart_of(&self, user_id: UserId) -> Option<UserId> {
        if self.sender_id == user_id {
            Some(self.receiver_id)
        } else if self.receiver_id == user_id {
            Some(self.sender_id)
        } else {
            None
        }
    }

    /// 单调合并已读时间：只允许 None -> Some，返回是否发生变化
    pub fn merge_read_at(&mut self, incoming: Option<i64>) -> bool {
        match (self.read_at, incoming) {
            (None, Some(at)) => {
                self.read_at = Some(at);
                true
            }
            _ => false,
        }
    }

    /// 联系人列表使用的预览文本
    pub fn preview(&self) -> String {
        if self.content.chars().count() <= PREVIEW_MAX_CHARS {
            return self.content.clone();
        }
        let mut preview: String = self.content.chars().take(PREVIEW_MAX_CHARS).collect();
        preview.push('…');
        preview
    }
}

/// 联系人（会话列表条目）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: Role,
    /// 最后一条消息预览，None 表示 "暂无消息"
    pub last_message: Option<String>,
    /// 最后一条消息时间（UTC 毫秒）
    pub last_message_at: Option<i64>,
    pub unread_count: u32,
}

impl Contact {
    /// 由资料构建一个 "暂无消息" 的联系人
    pub fn from_profile(profile: Profile) -> Self {
        Self {
            id: profile.id,
            name: profile.name,
            email: profile.email,
            role: profile.role,
            last_message: None,
            last_message_at: None,
            unread_count: 0,
        }
    }

    /// 用一条更新的消息刷新预览；早于当前预览的消息不覆盖
    pub fn apply_preview(&mut self, message: &Message) -> bool {
        match self.last_message_at {
            Some(current) if current > message.sent_at => false,
            _ => {
                self.last_message = Some(message.preview());
                self.last_message_at = Some(message.sent_at);
                true
            }
        }
    }
}

/// (用户, 联系人) 会话摘要：最新消息 + 未读消息 ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub latest: Option<Message>,
    pub unread_ids: Vec<MessageId>,
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
}

/// 变更流事件：`{operation, row}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "operation")]
    pub op: ChangeOp,
    pub row: Message,
}

impl ChangeEvent {
    pub fn insert(row: Message) -> Self {
        Self { op: ChangeOp::Insert, row }
    }

    pub fn update(row: Message) -> Self {
        Self { op: ChangeOp::Update, row }
    }
}
