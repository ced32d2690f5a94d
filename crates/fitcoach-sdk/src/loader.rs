//! 联系人全量加载
//!
//! 先取对端角色的全部资料，再并发查询每个联系人的最新消息和未读消息。
//! 单个联系人失败只降级为 "暂无消息"，不会中断整个列表。
//! 查询是在替换之前发出的，期间到达的变更由 `ContactStore` 的重放日志补上。

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::backend::BackendGateway;
use crate::error::{FitcoachSDKError, Result};
use crate::events::{event_builders, EventManager};
use crate::storage::entities::{Contact, CurrentUser, Profile};
use crate::storage::ReadMarkCache;
use crate::store::{ContactStore, LoadedContact};

pub struct ContactLoader {
    backend: Arc<dyn BackendGateway>,
    cache: ReadMarkCache,
    store: Arc<ContactStore>,
    events: Arc<EventManager>,
    me: CurrentUser,
}

impl ContactLoader {
    pub fn new(
        backend: Arc<dyn BackendGateway>,
        cache: ReadMarkCache,
        store: Arc<ContactStore>,
        events: Arc<EventManager>,
        me: CurrentUser,
    ) -> Self {
        Self {
            backend,
            cache,
            store,
            events,
            me,
        }
    }

    /// 全量加载联系人列表并替换存储，返回排序后的联系人
    ///
    /// 摘要查询期间合并的实时事件由存储记录，替换后重放。
    pub async fn load_contacts(&self) -> Result<Vec<Contact>> {
        let load = self.store.begin_load();
        let role = self.me.role.counterpart();
        let profiles = self.backend.list_profiles(role).await?;
        debug!("加载联系人: user_id={}, role={}, profiles={}", self.me.id, role, profiles.len());

        let loaded: Vec<LoadedContact> = join_all(
            profiles
                .into_iter()
                .filter(|p| p.id != self.me.id)
                .map(|profile| self.load_one(profile)),
        )
        .await;

        load.finish(loaded);
        let contacts = self.store.contacts();
        self.events
            .emit(event_builders::contact_list_updated(contacts.clone()))
            .await;
        Ok(contacts)
    }

    async fn load_one(&self, profile: Profile) -> LoadedContact {
        let contact_id = profile.id;
        let contact = Contact::from_profile(profile);
        match self.backend.conversation_summary(self.me.id, contact_id).await {
            Ok(summary) => LoadedContact {
                contact,
                unread_ids: self.cache.filter_unconfirmed(&summary.unread_ids),
                latest: summary.latest,
            },
            Err(e) => {
                let err = FitcoachSDKError::PartialLoad {
                    contact_id,
                    message: e.to_string(),
                };
                warn!("⚠️ {}，降级为暂无消息", err);
                LoadedContact {
                    contact,
                    unread_ids: Vec::new(),
                    latest: None,
                }
            }
        }
    }

    /// 权威刷新：重新加载联系人，并重新载入当前打开的会话
    pub async fn refresh(&self) -> Result<Vec<Contact>> {
        let contacts = self.load_contacts().await?;

        if let Some(open) = self.store.open_contact() {
            match self.backend.fetch_conversation(self.me.id, open).await {
                Ok(messages) => self.store.open_conversation(open, messages),
                Err(e) => warn!("刷新时重新载入会话失败: contact_id={}, error={}", open, e),
            }
        }

        info!("🔄 收件箱刷新完成: contacts={}, total_unread={}", contacts.len(), self.store.total_unread());
        self.events
            .emit(event_builders::refresh_completed(contacts.len()))
            .await;
        Ok(contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::storage::entities::Role;
    use crate::storage::KvStore;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir, backend: Arc<MemoryBackend>) -> (ContactLoader, Arc<ContactStore>, ReadMarkCache) {
        let kv = Arc::new(KvStore::new(dir.path()).await.unwrap());
        let cache = ReadMarkCache::open(&kv, 1).await.unwrap();
        let store = Arc::new(ContactStore::new(1, 16));
        let loader = ContactLoader::new(
            backend,
            cache.clone(),
            store.clone(),
            Arc::new(EventManager::new(16)),
            CurrentUser::new(1, "Coach Li", Role::Professor),
        );
        (loader, store, cache)
    }

    fn backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_profile(1, "Coach Li", Role::Professor);
        backend.add_profile(2, "Wang", Role::Student);
        backend.add_profile(3, "Zhao", Role::Student);
        backend.add_profile(4, "Chen", Role::Student);
        backend.add_profile(5, "Coach Sun", Role::Professor);
        backend
    }

    #[tokio::test]
    async fn test_load_contacts_sorted_and_counted() {
        let dir = TempDir::new().unwrap();
        let backend = backend();
        backend.send_message(2, 1, "first");
        backend.send_message(3, 1, "second");
        backend.send_message(3, 1, "third");
        let (loader, store, _) = setup(&dir, backend).await;

        let contacts = loader.load_contacts().await.unwrap();
        let ids: Vec<u64> = contacts.iter().map(|c| c.id).collect();
        // 只有学员，且没有消息的联系人排最后
        assert_eq!(ids, vec![3, 2, 4]);
        assert_eq!(store.unread_count(3), Some(2));
        assert_eq!(store.unread_count(2), Some(1));
        assert_eq!(contacts[2].last_message, None);
    }

    #[tokio::test]
    async fn test_partial_failure_degrades_single_contact() {
        let dir = TempDir::new().unwrap();
        let backend = backend();
        backend.send_message(2, 1, "hi");
        backend.send_message(3, 1, "hello");
        backend.fail_summary_for(2, true);
        let (loader, store, _) = setup(&dir, backend).await;

        let contacts = loader.load_contacts().await.unwrap();
        assert_eq!(contacts.len(), 3);
        assert_eq!(store.unread_count(2), Some(0));
        assert_eq!(store.contact(2).unwrap().last_message, None);
        assert_eq!(store.unread_count(3), Some(1));
    }

    #[tokio::test]
    async fn test_profile_failure_is_returned() {
        let dir = TempDir::new().unwrap();
        let backend = backend();
        backend.set_offline(true);
        let (loader, _, _) = setup(&dir, backend).await;
        let err = loader.load_contacts().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_confirmed_ids_are_subtracted() {
        let dir = TempDir::new().unwrap();
        let backend = backend();
        let m1 = backend.send_message(2, 1, "a");
        backend.send_message(2, 1, "b");
        let (loader, store, cache) = setup(&dir, backend).await;

        cache.add_all(&[m1.id]).await.unwrap();
        loader.load_contacts().await.unwrap();
        assert_eq!(store.unread_count(2), Some(1));
    }
}
