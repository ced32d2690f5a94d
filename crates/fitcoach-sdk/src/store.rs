//! 联系人/消息存储 - UI 展示内容的唯一数据源
//!
//! 所有触发源（用户操作、实时推送、定时器、焦点事件、后端响应）共享同一个
//! `Arc<ContactStore>`，只能通过这里定义的操作修改状态。每个操作在一把短的
//! `parking_lot` 锁内同步完成，不跨越任何 await。
//!
//! 合并规则：
//! - insert 幂等：同一条消息重复插入只计数一次
//! - update 单调：已读时间只能从空变为有值
//! - 引用未知消息的 update 进入有界缓冲区，等对应的 insert 到达后再应用
//! - 未读数永不为负，也不会超过已知未读消息 ID 的数量（直接覆盖除外）
//! - 全量加载进行期间合并的事件记入重放日志，替换完成后再按上面的规则重放，
//!   加载前取到的摘要不会覆盖掉这期间到达的变更

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::error::FitcoachSDKError;
use crate::storage::entities::{ChangeEvent, ChangeOp, Contact, Message, MessageId, UserId};

/// 一次全量加载得到的联系人条目
#[derive(Debug, Clone)]
pub struct LoadedContact {
    pub contact: Contact,
    /// 已扣除本地已确认 ID 后的未读消息
    pub unread_ids: Vec<MessageId>,
    pub latest: Option<Message>,
}

/// `apply_merge` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 新消息已合并；`unread` 表示它是否计入了未读数
    Inserted {
        contact_id: UserId,
        message_id: MessageId,
        unread: bool,
        unread_count: u32,
    },
    /// 已知消息的已读状态发生了变化
    Updated { contact_id: UserId, unread_count: u32 },
    /// 重复事件，无变化
    Duplicate,
    /// update 引用了本地未知的消息，已缓冲
    Buffered(MessageId),
    /// 与当前用户无关
    Ignored,
    /// 对端不在联系人列表中
    UnknownContact(UserId),
}

/// 未读数快照，用于乐观更新回滚
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    counts: Vec<(UserId, u32)>,
}

impl UnreadSnapshot {
    pub fn counts(&self) -> &[(UserId, u32)] {
        &self.counts
    }

    pub fn get(&self, contact_id: UserId) -> Option<u32> {
        self.counts.iter().find(|(id, _)| *id == contact_id).map(|(_, n)| *n)
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().map(|(_, n)| *n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ContactEntry {
    contact: Contact,
    unread_ids: BTreeSet<MessageId>,
}

impl ContactEntry {
    /// 移除未读 ID 后，计数不超过剩余已知未读数
    fn remove_unread(&mut self, id: MessageId) -> bool {
        if !self.unread_ids.remove(&id) {
            return false;
        }
        let remaining = self.unread_ids.len() as u32;
        self.contact.unread_count = self.contact.unread_count.min(remaining);
        true
    }
}

/// 加载期间记录的本地变更
#[derive(Debug, Clone)]
enum ReplayEntry {
    Insert(Message),
    Update(Message),
    Read { ids: Vec<MessageId>, read_at: i64 },
}

#[derive(Debug)]
struct StoreInner {
    me: UserId,
    contacts: Vec<ContactEntry>,
    messages: HashMap<MessageId, Message>,
    /// 未读消息 ID -> 联系人 ID
    unread_index: HashMap<MessageId, UserId>,
    open: Option<UserId>,
    stale_updates: VecDeque<Message>,
    stale_capacity: usize,
    loads_in_flight: usize,
    replay_log: VecDeque<ReplayEntry>,
}

impl StoreInner {
    fn position(&self, contact_id: UserId) -> Option<usize> {
        self.contacts.iter().position(|e| e.contact.id == contact_id)
    }

    fn entry_mut(&mut self, contact_id: UserId) -> Option<&mut ContactEntry> {
        self.contacts.iter_mut().find(|e| e.contact.id == contact_id)
    }

    fn is_known(&self, id: MessageId) -> bool {
        self.messages.contains_key(&id) || self.unread_index.contains_key(&id)
    }

    fn sort_contacts(&mut self) {
        self.contacts.sort_by(|a, b| {
            let (a, b) = (&a.contact, &b.contact);
            match (a.last_message_at, b.last_message_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
        });
    }

    fn take_stale(&mut self, id: MessageId) -> Option<Message> {
        let pos = self.stale_updates.iter().position(|m| m.id == id)?;
        self.stale_updates.remove(pos)
    }

    fn buffer_stale(&mut self, row: Message) {
        if let Some(existing) = self.stale_updates.iter_mut().find(|m| m.id == row.id) {
            existing.merge_read_at(row.read_at);
            return;
        }
        if self.stale_capacity == 0 {
            return;
        }
        if self.stale_updates.len() >= self.stale_capacity {
            if let Some(evicted) = self.stale_updates.pop_front() {
                debug!("过期更新缓冲区已满，丢弃最旧条目: message_id={}", evicted.id);
            }
        }
        self.stale_updates.push_back(row);
    }

    fn record(&mut self, entry: ReplayEntry) {
        if self.loads_in_flight == 0 || self.stale_capacity == 0 {
            return;
        }
        if self.replay_log.len() >= self.stale_capacity {
            if let Some(evicted) = self.replay_log.pop_front() {
                warn!("重放日志已满，丢弃最旧条目，等待下次刷新收敛: {:?}", evicted);
            }
        }
        self.replay_log.push_back(entry);
    }

    /// 用加载结果替换联系人，只保留仍被引用的消息
    fn replace(&mut self, loaded: Vec<LoadedContact>) {
        let me = self.me;

        self.unread_index.clear();
        let mut latest_ids = HashSet::new();
        let mut entries = Vec::with_capacity(loaded.len());
        for item in loaded {
            let contact_id = item.contact.id;
            let mut contact = item.contact;
            let unread_ids: BTreeSet<MessageId> = item.unread_ids.into_iter().collect();
            contact.unread_count = unread_ids.len() as u32;
            for id in &unread_ids {
                self.unread_index.insert(*id, contact_id);
            }
            if let Some(latest) = item.latest {
                if latest.counterpart_of(me) == Some(contact_id) {
                    contact.apply_preview(&latest);
                    latest_ids.insert(latest.id);
                    match self.messages.get_mut(&latest.id) {
                        Some(stored) => {
                            stored.merge_read_at(latest.read_at);
                        }
                        None => {
                            self.messages.insert(latest.id, latest);
                        }
                    }
                }
            }
            entries.push(ContactEntry { contact, unread_ids });
        }
        self.contacts = entries;

        if let Some(open) = self.open {
            if self.position(open).is_none() {
                debug!("打开的会话已不在联系人列表中，关闭: contact_id={}", open);
                self.open = None;
            }
        }

        let open = self.open;
        let unread_index = &self.unread_index;
        let before = self.messages.len();
        self.messages.retain(|id, m| {
            latest_ids.contains(id)
                || unread_index.contains_key(id)
                || (open.is_some() && m.counterpart_of(me) == open)
        });
        trace!("加载后清理消息: before={}, after={}", before, self.messages.len());

        // 刷新后变为已知的缓冲更新现在可以应用
        let buffered: Vec<Message> = self.stale_updates.drain(..).collect();
        for row in buffered {
            if self.is_known(row.id) {
                self.merge_update(row);
            } else {
                self.stale_updates.push_back(row);
            }
        }
    }

    /// 把加载期间记录的变更重放到新的联系人列表上
    fn replay(&mut self) -> usize {
        let entries: Vec<ReplayEntry> = self.replay_log.iter().cloned().collect();
        for entry in &entries {
            match entry {
                ReplayEntry::Insert(row) => self.replay_insert(row.clone()),
                // 仍未知的更新已经在缓冲区里了
                ReplayEntry::Update(row) if self.is_known(row.id) => {
                    self.merge_update(row.clone());
                }
                ReplayEntry::Update(_) => {}
                ReplayEntry::Read { ids, read_at } => {
                    self.mark_read(ids, *read_at);
                }
            }
        }
        entries.len()
    }

    /// 重放一条加载期间到达的新消息：加载结果里没有计入的未读消息补计一次
    fn replay_insert(&mut self, row: Message) {
        let me = self.me;
        if let MergeOutcome::Inserted { .. } = self.merge_insert(row.clone()) {
            return;
        }
        let Some(contact_id) = row.counterpart_of(me) else {
            return;
        };
        let unread = self
            .messages
            .get(&row.id)
            .map_or(false, |m| m.is_unread_for(me));
        let Some(entry) = self.entry_mut(contact_id) else {
            return;
        };
        entry.contact.apply_preview(&row);
        let added = unread && entry.unread_ids.insert(row.id);
        if added {
            entry.contact.unread_count = entry.contact.unread_count.saturating_add(1);
            self.unread_index.insert(row.id, contact_id);
        }
    }

    fn finish_load(&mut self) {
        self.loads_in_flight = self.loads_in_flight.saturating_sub(1);
        if self.loads_in_flight == 0 {
            self.replay_log.clear();
        }
    }

    fn mark_read(&mut self, ids: &[MessageId], read_at: i64) -> Vec<UserId> {
        let me = self.me;
        let mut touched: Vec<UserId> = Vec::new();

        for id in ids {
            if let Some(stored) = self.messages.get_mut(id) {
                if stored.receiver_id != me {
                    continue;
                }
                stored.merge_read_at(Some(read_at));
            }
            if let Some(owner) = self.unread_index.remove(id) {
                if let Some(entry) = self.entry_mut(owner) {
                    entry.remove_unread(*id);
                }
                if !touched.contains(&owner) {
                    touched.push(owner);
                }
            }
        }
        touched
    }

    fn merge_insert(&mut self, mut row: Message) -> MergeOutcome {
        let me = self.me;
        let Some(contact_id) = row.counterpart_of(me) else {
            return MergeOutcome::Ignored;
        };
        let Some(pos) = self.position(contact_id) else {
            return MergeOutcome::UnknownContact(contact_id);
        };

        if self.is_known(row.id) {
            // 重复 insert 也可能带来更新的已读状态
            return self.merge_update(row);
        }

        if let Some(buffered) = self.take_stale(row.id) {
            row.merge_read_at(buffered.read_at);
        }

        let unread = row.is_unread_for(me);
        let message_id = row.id;
        let entry = &mut self.contacts[pos];
        entry.contact.apply_preview(&row);
        if unread {
            entry.unread_ids.insert(message_id);
            entry.contact.unread_count = entry.contact.unread_count.saturating_add(1);
        }
        let unread_count = entry.contact.unread_count;
        if unread {
            self.unread_index.insert(message_id, contact_id);
        }
        self.messages.insert(message_id, row);
        self.sort_contacts();

        MergeOutcome::Inserted {
            contact_id,
            message_id,
            unread,
            unread_count,
        }
    }

    fn merge_update(&mut self, row: Message) -> MergeOutcome {
        let me = self.me;
        let Some(contact_id) = row.counterpart_of(me) else {
            return MergeOutcome::Ignored;
        };
        if self.position(contact_id).is_none() {
            return MergeOutcome::UnknownContact(contact_id);
        }

        if !self.is_known(row.id) {
            let message_id = row.id;
            debug!("{}，缓冲等待 insert", FitcoachSDKError::StaleStateDivergence(message_id));
            self.buffer_stale(row);
            return MergeOutcome::Buffered(message_id);
        }

        let changed = match self.messages.get_mut(&row.id) {
            Some(stored) => stored.merge_read_at(row.read_at),
            None => {
                // 只通过摘要知道它是未读的，现在拿到了完整行
                let read = row.read_at.is_some();
                self.messages.insert(row.id, row.clone());
                read
            }
        };

        let now_read = self
            .messages
            .get(&row.id)
            .map(|m| m.read_at.is_some())
            .unwrap_or(false);
        let mut removed = false;
        if now_read {
            if let Some(owner) = self.unread_index.remove(&row.id) {
                if let Some(entry) = self.entry_mut(owner) {
                    removed = entry.remove_unread(row.id);
                }
            }
        }

        if !changed && !removed {
            return MergeOutcome::Duplicate;
        }
        let unread_count = self
            .contacts
            .iter()
            .find(|e| e.contact.id == contact_id)
            .map(|e| e.contact.unread_count)
            .unwrap_or(0);
        MergeOutcome::Updated {
            contact_id,
            unread_count,
        }
    }
}

/// 联系人/消息存储
#[derive(Debug)]
pub struct ContactStore {
    inner: RwLock<StoreInner>,
}

impl ContactStore {
    pub fn new(me: UserId, stale_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                me,
                contacts: Vec::new(),
                messages: HashMap::new(),
                unread_index: HashMap::new(),
                open: None,
                stale_updates: VecDeque::new(),
                stale_capacity,
                loads_in_flight: 0,
                replay_log: VecDeque::new(),
            }),
        }
    }

    pub fn me(&self) -> UserId {
        self.inner.read().me
    }

    /// 用一次全量加载的结果替换联系人列表（权威数据）
    pub fn replace_contacts(&self, loaded: Vec<LoadedContact>) {
        let mut inner = self.inner.write();
        inner.replace(loaded);
        let replayed = inner.replay();
        inner.sort_contacts();
        debug!(
            "联系人列表已替换: count={}, stale={}, replayed={}",
            inner.contacts.len(),
            inner.stale_updates.len(),
            replayed
        );
    }

    /// 开始一次全量加载；在返回的 `LoadGuard` 结束前合并的事件都会被记录
    pub fn begin_load(self: &Arc<Self>) -> LoadGuard {
        self.inner.write().loads_in_flight += 1;
        LoadGuard {
            store: Arc::clone(self),
            finished: false,
        }
    }

    /// 合并一个实时变更事件
    pub fn apply_merge(&self, event: &ChangeEvent) -> MergeOutcome {
        let mut inner = self.inner.write();
        let outcome = match event.op {
            ChangeOp::Insert => inner.merge_insert(event.row.clone()),
            ChangeOp::Update => inner.merge_update(event.row.clone()),
        };
        match (event.op, &outcome) {
            (_, MergeOutcome::Ignored) => {}
            (ChangeOp::Insert, MergeOutcome::Inserted { .. } | MergeOutcome::UnknownContact(_)) => {
                inner.record(ReplayEntry::Insert(event.row.clone()));
            }
            (ChangeOp::Insert, MergeOutcome::Updated { .. }) | (ChangeOp::Update, _) => {
                inner.record(ReplayEntry::Update(event.row.clone()));
            }
            _ => {}
        }
        trace!("合并变更事件: op={:?}, message_id={}, outcome={:?}", event.op, event.row.id, outcome);
        outcome
    }

    /// 直接覆盖未读数（负数按 0 处理），返回新值；联系人不存在时返回 None
    pub fn set_unread_count(&self, contact_id: UserId, n: i64) -> Option<u32> {
        let mut inner = self.inner.write();
        let entry = inner.entry_mut(contact_id)?;
        let clamped = n.clamp(0, u32::MAX as i64) as u32;
        if n < 0 {
            warn!("未读数不能为负，已钳制为 0: contact_id={}, requested={}", contact_id, n);
        }
        entry.contact.unread_count = clamped;
        Some(clamped)
    }

    pub fn unread_count(&self, contact_id: UserId) -> Option<u32> {
        self.inner
            .read()
            .contacts
            .iter()
            .find(|e| e.contact.id == contact_id)
            .map(|e| e.contact.unread_count)
    }

    pub fn total_unread(&self) -> u32 {
        self.inner
            .read()
            .contacts
            .iter()
            .map(|e| e.contact.unread_count)
            .fold(0u32, |acc, n| acc.saturating_add(n))
    }

    /// 已排序的联系人快照
    pub fn contacts(&self) -> Vec<Contact> {
        self.inner.read().contacts.iter().map(|e| e.contact.clone()).collect()
    }

    pub fn contact(&self, contact_id: UserId) -> Option<Contact> {
        self.inner
            .read()
            .contacts
            .iter()
            .find(|e| e.contact.id == contact_id)
            .map(|e| e.contact.clone())
    }

    pub fn contact_ids(&self) -> Vec<UserId> {
        self.inner.read().contacts.iter().map(|e| e.contact.id).collect()
    }

    pub fn snapshot_unread_counts(&self) -> UnreadSnapshot {
        let inner = self.inner.read();
        UnreadSnapshot {
            counts: inner
                .contacts
                .iter()
                .map(|e| (e.contact.id, e.contact.unread_count))
                .collect(),
        }
    }

    pub fn snapshot_unread_count(&self, contact_id: UserId) -> UnreadSnapshot {
        UnreadSnapshot {
            counts: self
                .unread_count(contact_id)
                .map(|n| vec![(contact_id, n)])
                .unwrap_or_default(),
        }
    }

    /// 恢复快照，返回实际发生变化的 (联系人, 未读数)
    pub fn restore_unread_counts(&self, snapshot: &UnreadSnapshot) -> Vec<(UserId, u32)> {
        let mut inner = self.inner.write();
        let mut changed = Vec::new();
        for (contact_id, count) in snapshot.counts() {
            if let Some(entry) = inner.entry_mut(*contact_id) {
                if entry.contact.unread_count != *count {
                    entry.contact.unread_count = *count;
                    changed.push((*contact_id, *count));
                }
            }
        }
        changed
    }

    /// 打开会话并载入消息列表；不改变未读数（由乐观路径负责）
    pub fn open_conversation(&self, contact_id: UserId, messages: Vec<Message>) {
        let mut inner = self.inner.write();
        let me = inner.me;
        inner.open = Some(contact_id);

        let mut new_unread = Vec::new();
        let mut latest: Option<Message> = None;
        for message in messages {
            if message.counterpart_of(me) != Some(contact_id) {
                continue;
            }
            if latest.as_ref().map_or(true, |l| message.sent_at >= l.sent_at) {
                latest = Some(message.clone());
            }
            let stored = inner.messages.entry(message.id).or_insert_with(|| message.clone());
            stored.merge_read_at(message.read_at);
            let unread = stored.is_unread_for(me);
            if unread && !inner.unread_index.contains_key(&message.id) {
                new_unread.push(message.id);
            } else if !unread {
                if let Some(owner) = inner.unread_index.remove(&message.id) {
                    if let Some(entry) = inner.entry_mut(owner) {
                        entry.remove_unread(message.id);
                    }
                }
            }
        }

        for id in &new_unread {
            inner.unread_index.insert(*id, contact_id);
        }
        if let Some(entry) = inner.entry_mut(contact_id) {
            entry.unread_ids.extend(new_unread.iter().copied());
            if let Some(latest) = &latest {
                entry.contact.apply_preview(latest);
            }
        }
        inner.sort_contacts();
    }

    pub fn close_conversation(&self) {
        self.inner.write().open = None;
    }

    pub fn open_contact(&self) -> Option<UserId> {
        self.inner.read().open
    }

    /// 当前打开会话的消息，按发送时间升序
    pub fn conversation_messages(&self) -> Vec<Message> {
        let inner = self.inner.read();
        let Some(open) = inner.open else {
            return Vec::new();
        };
        let me = inner.me;
        let mut messages: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.counterpart_of(me) == Some(open))
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.sent_at, m.id));
        messages
    }

    pub fn unread_message_ids(&self, contact_id: UserId) -> Vec<MessageId> {
        self.inner
            .read()
            .contacts
            .iter()
            .find(|e| e.contact.id == contact_id)
            .map(|e| e.unread_ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all_unread_message_ids(&self) -> Vec<MessageId> {
        let inner = self.inner.read();
        let mut ids: Vec<MessageId> = inner.unread_index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 后端确认后把消息标记为已读，返回未读数发生变化的联系人
    pub fn mark_messages_read(&self, ids: &[MessageId], read_at: i64) -> Vec<(UserId, u32)> {
        let mut inner = self.inner.write();
        let touched = inner.mark_read(ids, read_at);
        inner.record(ReplayEntry::Read {
            ids: ids.to_vec(),
            read_at,
        });

        touched
            .into_iter()
            .filter_map(|contact_id| {
                inner
                    .contacts
                    .iter()
                    .find(|e| e.contact.id == contact_id)
                    .map(|e| (contact_id, e.contact.unread_count))
            })
            .collect()
    }

    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.inner.read().messages.get(&id).cloned()
    }

    pub fn stale_len(&self) -> usize {
        self.inner.read().stale_updates.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.contacts.clear();
        inner.messages.clear();
        inner.unread_index.clear();
        inner.stale_updates.clear();
        inner.replay_log.clear();
        inner.open = None;
    }

    pub fn is_loading(&self) -> bool {
        self.inner.read().loads_in_flight > 0
    }
}

/// 进行中的全量加载
///
/// `finish` 用加载结果替换联系人并重放期间记录的变更；未调用 `finish`
/// 就被 drop（加载失败或被取消）时只结束记录。
pub struct LoadGuard {
    store: Arc<ContactStore>,
    finished: bool,
}

impl LoadGuard {
    pub fn finish(mut self, loaded: Vec<LoadedContact>) {
        self.finished = true;
        let mut inner = self.store.inner.write();
        inner.replace(loaded);
        let replayed = inner.replay();
        inner.sort_contacts();
        inner.finish_load();
        debug!(
            "全量加载完成: count={}, stale={}, replayed={}",
            inner.contacts.len(),
            inner.stale_updates.len(),
            replayed
        );
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.store.inner.write().finish_load();
        }
    }
}
