use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backend::{BackendGateway, ChangeFeed};
use crate::error::{FitcoachSDKError, Result};
use crate::events::{EventFilter, EventManager};
use crate::session::InboxSession;
use crate::storage::entities::CurrentUser;
use crate::storage::KvStore;

/// Fitcoach SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitcoachConfig {
    /// 数据存储目录（sled KV 位于其下的 kv/ 目录）
    pub data_dir: PathBuf,
    /// 事件配置
    pub event_config: EventConfig,
    /// 已读同步配置
    pub read_sync: ReadSyncConfig,
    /// 调试模式
    pub debug_mode: bool,
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
    /// 调试模式下只记录匹配这些过滤器的事件，为空时记录全部
    pub filters: Vec<EventFilter>,
}

/// 已读同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadSyncConfig {
    /// 定时复查间隔（秒）
    pub review_interval_secs: u64,
    /// 重新获得焦点后到刷新之间的稳定延迟（毫秒）
    pub focus_settle_delay_ms: u64,
    /// 已读标记缓存保留天数，会话启动时清理更早的条目
    pub read_mark_retention_days: u64,
    /// 未知消息更新的缓冲上限
    pub stale_update_capacity: usize,
}

impl ReadSyncConfig {
    pub fn review_interval(&self) -> Duration {
        Duration::from_secs(self.review_interval_secs)
    }

    pub fn focus_settle_delay(&self) -> Duration {
        Duration::from_millis(self.focus_settle_delay_ms)
    }

    pub fn read_mark_retention(&self) -> Duration {
        Duration::from_secs(self.read_mark_retention_days * 24 * 3600)
    }
}

impl Default for FitcoachConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            event_config: EventConfig::default(),
            read_sync: ReadSyncConfig::default(),
            debug_mode: false,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filters: Vec::new(),
        }
    }
}

impl Default for ReadSyncConfig {
    fn default() -> Self {
        Self {
            review_interval_secs: 30,
            focus_settle_delay_ms: 1500,
            read_mark_retention_days: 30,
            stale_update_capacity: 256,
        }
    }
}

/// 获取默认数据目录 ~/.fitcoach/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".fitcoach")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".fitcoach")
    } else {
        PathBuf::from("./fitcoach_data")
    }
}

/// Fitcoach SDK 配置构建器
pub struct FitcoachConfigBuilder {
    config: FitcoachConfig,
}

impl FitcoachConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FitcoachConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event_config = config;
        self
    }

    pub fn read_sync(mut self, config: ReadSyncConfig) -> Self {
        self.config.read_sync = config;
        self
    }

    pub fn review_interval_secs(mut self, secs: u64) -> Self {
        self.config.read_sync.review_interval_secs = secs;
        self
    }

    pub fn focus_settle_delay_ms(mut self, ms: u64) -> Self {
        self.config.read_sync.focus_settle_delay_ms = ms;
        self
    }

    pub fn read_mark_retention_days(mut self, days: u64) -> Self {
        self.config.read_sync.read_mark_retention_days = days;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> FitcoachConfig {
        self.config
    }
}

impl Default for FitcoachConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FitcoachConfig {
    pub fn builder() -> FitcoachConfigBuilder {
        FitcoachConfigBuilder::new()
    }
}

/// SDK 主接口
///
/// 分层结构：
/// - 存储层：KvStore（已读标记缓存）
/// - 事件层：EventManager
/// - 会话层：InboxSession（每个登录用户一个）
pub struct FitcoachSDK {
    config: FitcoachConfig,
    backend: Arc<dyn BackendGateway>,
    feed: Arc<dyn ChangeFeed>,
    kv_store: Arc<KvStore>,
    event_manager: Arc<EventManager>,
    session: Arc<RwLock<Option<Arc<InboxSession>>>>,
    initialized: Arc<RwLock<bool>>,
    shutting_down: Arc<RwLock<bool>>,
}

impl FitcoachSDK {
    /// 异步初始化 SDK
    ///
    /// 分层初始化顺序：1. 存储层 → 2. 事件层
    pub async fn initialize(
        config: FitcoachConfig,
        backend: Arc<dyn BackendGateway>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 FitcoachSDK...");
        Self::validate_config(&config)?;

        // === 第1层：KV 存储 ===
        let kv_store = Arc::new(KvStore::new(&config.data_dir).await?);

        // === 第2层：事件管理器 ===
        let event_manager = Arc::new(EventManager::new(config.event_config.buffer_size));

        if config.debug_mode {
            info!("调试模式已开启: {:?}", config);
            let filters = config.event_config.filters.clone();
            event_manager
                .add_listener("*", move |event| {
                    if filters.is_empty() || filters.iter().any(|f| f.matches(event)) {
                        debug!("📨 事件: type={}, contact_id={:?}", event.event_type(), event.contact_id());
                    }
                })
                .await;
        }
        info!("✅ FitcoachSDK 初始化完成: data_dir={}", config.data_dir.display());

        Ok(Arc::new(Self {
            config,
            backend,
            feed,
            kv_store,
            event_manager,
            session: Arc::new(RwLock::new(None)),
            initialized: Arc::new(RwLock::new(true)),
            shutting_down: Arc::new(RwLock::new(false)),
        }))
    }

    fn validate_config(config: &FitcoachConfig) -> Result<()> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(FitcoachSDKError::Config("数据目录不能为空".to_string()));
        }
        if config.event_config.buffer_size == 0 {
            return Err(FitcoachSDKError::Config("事件缓冲区大小不能为0".to_string()));
        }
        if config.read_sync.review_interval_secs == 0 {
            return Err(FitcoachSDKError::Config("复查间隔不能为0".to_string()));
        }
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<()> {
        if *self.shutting_down.read().await {
            return Err(FitcoachSDKError::ShuttingDown("SDK 正在关闭".to_string()));
        }
        if !*self.initialized.read().await {
            return Err(FitcoachSDKError::NotInitialized("SDK 未初始化".to_string()));
        }
        Ok(())
    }

    /// 登录后启动收件箱会话；已有其他用户的会话时先结束它（保留其缓存）
    pub async fn sign_in(&self, user: CurrentUser) -> Result<Arc<InboxSession>> {
        self.ensure_ready().await?;

        let mut slot = self.session.write().await;
        if let Some(existing) = slot.take() {
            if existing.user().id == user.id && existing.is_active() {
                *slot = Some(existing.clone());
                return Ok(existing);
            }
            existing.shutdown(false).await?;
        }

        let session = InboxSession::start(
            user,
            self.backend.clone(),
            self.feed.clone(),
            self.kv_store.clone(),
            self.event_manager.clone(),
            &self.config.read_sync,
        )
        .await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// 退出登录：停止后台任务并清空该用户的已读标记缓存
    pub async fn sign_out(&self) -> Result<()> {
        let session = self.session.write().await.take();
        match session {
            Some(session) => {
                info!("用户退出登录: user_id={}", session.user().id);
                session.shutdown(true).await
            }
            None => Ok(()),
        }
    }

    /// 当前会话
    pub async fn session(&self) -> Result<Arc<InboxSession>> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| FitcoachSDKError::NotInitialized("尚未登录".to_string()))
    }

    /// App 切换到前台（窗口获得焦点）
    pub async fn on_app_foreground(&self) -> Result<()> {
        match self.session.read().await.clone() {
            Some(session) => session.on_focus().await,
            None => Ok(()),
        }
    }

    /// App 切换到后台（窗口失去焦点）
    pub async fn on_app_background(&self) -> Result<()> {
        match self.session.read().await.clone() {
            Some(session) => session.on_blur().await,
            None => Ok(()),
        }
    }

    pub fn events(&self) -> Arc<EventManager> {
        self.event_manager.clone()
    }

    pub fn config(&self) -> &FitcoachConfig {
        &self.config
    }

    pub fn kv_store(&self) -> Arc<KvStore> {
        self.kv_store.clone()
    }

    /// 异步关闭 SDK（不清空缓存）
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 FitcoachSDK...");
        {
            let mut shutting_down = self.shutting_down.write().await;
            *shutting_down = true;
        }

        if let Some(session) = self.session.write().await.take() {
            session.shutdown(false).await?;
        }
        if let Err(e) = self.kv_store.flush().await {
            warn!("关闭时刷盘失败: {}", e);
        }
        self.event_manager.clear_listeners().await;

        {
            let mut initialized = self.initialized.write().await;
            *initialized = false;
        }
        info!("FitcoachSDK 关闭完成");
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.read().await
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.shutting_down.read().await
    }
}
