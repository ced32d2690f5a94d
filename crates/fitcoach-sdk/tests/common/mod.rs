#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fitcoach_sdk::{
    BackendGateway, ConversationSummary, CurrentUser, FitcoachConfig, FitcoachSDK, InboxSession, MemoryBackend,
    Message, MessageId, Profile, Result, Role, UserId,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const COACH: u64 = 1;
pub const WANG: u64 = 2;
pub const ZHAO: u64 = 3;
pub const CHEN: u64 = 4;

pub fn coach() -> CurrentUser {
    CurrentUser::new(COACH, "Coach Li", Role::Professor)
}

pub fn backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.add_profile(COACH, "Coach Li", Role::Professor);
    backend.add_profile(WANG, "Wang Fang", Role::Student);
    backend.add_profile(ZHAO, "Zhao Lei", Role::Student);
    backend.add_profile(CHEN, "Chen Jing", Role::Student);
    backend
}

pub fn config(dir: &TempDir) -> FitcoachConfig {
    FitcoachConfig::builder()
        .data_dir(dir.path())
        .focus_settle_delay_ms(50)
        .review_interval_secs(3600)
        .build()
}

pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<MemoryBackend>,
    pub sdk: Arc<FitcoachSDK>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_backend(backend()).await
    }

    pub async fn with_backend(backend: Arc<MemoryBackend>) -> Self {
        Self::with_gateway(backend.clone(), backend).await
    }

    /// 查询/命令走 `gateway`，变更流仍由内存后端提供
    pub async fn with_gateway(backend: Arc<MemoryBackend>, gateway: Arc<dyn BackendGateway>) -> Self {
        let dir = TempDir::new().unwrap();
        let sdk = FitcoachSDK::initialize(config(&dir), gateway, backend.clone())
            .await
            .unwrap();
        Self { dir, backend, sdk }
    }

    pub async fn sign_in(&self) -> Arc<InboxSession> {
        self.sdk.sign_in(coach()).await.unwrap()
    }

    /// 学员给教练发 n 条消息
    pub fn send_from(&self, student: u64, n: usize) -> Vec<MessageId> {
        (0..n)
            .map(|i| self.backend.send_message(student, COACH, format!("msg {} from {}", i, student)).id)
            .collect()
    }
}

/// 轮询等待条件成立，最多 2 秒
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn message(id: MessageId, from: u64, to: u64, sent_at: i64, read_at: Option<i64>) -> Message {
    Message {
        id,
        sender_id: from,
        receiver_id: to,
        sent_at,
        read_at,
        content: format!("message {}", id),
    }
}

/// 返回某个联系人的摘要之后，立刻让该学员再发一条消息，并给实时通道留出
/// 处理时间：这条消息在摘要里没有，却在加载完成前就被合并进了存储
pub struct LateArrivalGateway {
    inner: Arc<MemoryBackend>,
    armed: Mutex<Option<UserId>>,
}

impl LateArrivalGateway {
    pub fn new(inner: Arc<MemoryBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: Mutex::new(None),
        })
    }

    /// 下一次查询 `student` 的摘要时注入一条消息
    pub fn arm(&self, student: UserId) {
        *self.armed.lock() = Some(student);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }
}

#[async_trait]
impl BackendGateway for LateArrivalGateway {
    async fn list_profiles(&self, role: Role) -> Result<Vec<Profile>> {
        self.inner.list_profiles(role).await
    }

    async fn conversation_summary(&self, user_id: UserId, contact_id: UserId) -> Result<ConversationSummary> {
        let summary = self.inner.conversation_summary(user_id, contact_id).await?;
        let fire = {
            let mut armed = self.armed.lock();
            if *armed == Some(contact_id) {
                armed.take()
            } else {
                None
            }
        };
        if let Some(student) = fire {
            self.inner.send_message(student, user_id, "sent while loading");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(summary)
    }

    async fn fetch_conversation(&self, user_id: UserId, contact_id: UserId) -> Result<Vec<Message>> {
        self.inner.fetch_conversation(user_id, contact_id).await
    }

    async fn mark_read(&self, reader: UserId, ids: &[MessageId]) -> Result<()> {
        self.inner.mark_read(reader, ids).await
    }
}
