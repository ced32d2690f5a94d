//! 当前视图上下文

use serde::{Deserialize, Serialize};

use crate::storage::entities::UserId;

/// 应用当前处于哪个视图，决定定时复查的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ViewContext {
    /// 应用不可见
    #[default]
    Hidden,
    ContactList,
    Inbox,
    AccountStatus,
    Conversation(UserId),
}

/// 定时复查要处理的未读范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewScope {
    All,
    Contact(UserId),
}

impl ViewContext {
    /// 该视图是否意味着有待复查的未读消息
    pub fn review_scope(&self) -> Option<ReviewScope> {
        match self {
            ViewContext::Inbox | ViewContext::AccountStatus => Some(ReviewScope::All),
            ViewContext::Conversation(contact_id) => Some(ReviewScope::Contact(*contact_id)),
            ViewContext::Hidden | ViewContext::ContactList => None,
        }
    }

    pub fn open_contact(&self) -> Option<UserId> {
        match self {
            ViewContext::Conversation(contact_id) => Some(*contact_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_scope() {
        assert_eq!(ViewContext::Inbox.review_scope(), Some(ReviewScope::All));
        assert_eq!(ViewContext::AccountStatus.review_scope(), Some(ReviewScope::All));
        assert_eq!(ViewContext::Conversation(7).review_scope(), Some(ReviewScope::Contact(7)));
        assert_eq!(ViewContext::ContactList.review_scope(), None);
        assert_eq!(ViewContext::default().review_scope(), None);
    }
}
