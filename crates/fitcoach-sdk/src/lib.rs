//! Fitcoach SDK - 教练/学员私信的已读状态同步引擎
//!
//! 本 SDK 让 "未读数" 和逐条消息的已读标记在以下触发源之间保持一致：
//! - 👆 用户操作：打开会话、全部标记已读（乐观更新，失败回滚）
//! - ⏱️ 定时复查与窗口焦点恢复后的权威刷新
//! - 📡 实时变更流推送（幂等、与顺序无关的合并）
//! - 💾 跨重启保留的已读标记缓存（sled），避免重复的网络请求
//! - ⚙️ 事件系统：统一的事件广播和回调机制
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fitcoach_sdk::{CurrentUser, FitcoachConfig, FitcoachSDK, MemoryBackend, Role};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(MemoryBackend::new());
//!     let config = FitcoachConfig::builder()
//!         .data_dir("/path/to/data")
//!         .build();
//!
//!     let sdk = FitcoachSDK::initialize(config, backend.clone(), backend).await?;
//!     let session = sdk.sign_in(CurrentUser::new(1, "Coach Li", Role::Professor)).await?;
//!
//!     for contact in session.contacts() {
//!         println!("{}: {} 条未读", contact.name, contact.unread_count);
//!     }
//!
//!     // 打开会话：未读数立即清零，随后批量标记已读
//!     session.open_conversation(2).await?;
//!
//!     sdk.sign_out().await?;
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod utils;
pub mod storage;
pub mod backend;
pub mod events;
pub mod store;
pub mod loader;
pub mod batcher;
pub mod optimistic;
pub mod realtime;
pub mod view;
pub mod lifecycle;
pub mod session;
pub mod sdk;

// 重新导出核心类型，方便使用
pub use error::{FitcoachSDKError, Result};
pub use storage::entities::{
    ChangeEvent, ChangeOp, Contact, ConversationSummary, CurrentUser, Message, MessageId, Profile, Role, UserId,
};
pub use storage::{KvStore, ReadMarkCache};
pub use backend::{BackendGateway, ChangeFeed, ChangeFilter, ChangeSubscription, MemoryBackend};
pub use events::{event_builders, EventFilter, EventManager, EventStats, FilteredEventReceiver, InboxEvent};
pub use store::{ContactStore, LoadGuard, LoadedContact, MergeOutcome, UnreadSnapshot};
pub use loader::ContactLoader;
pub use batcher::{BatchOutcome, BatcherStats, ReadMarkBatcher};
pub use optimistic::{OptimisticMutator, OptimisticTxn};
pub use realtime::RealtimeReconciler;
pub use view::{ReviewScope, ViewContext};
pub use lifecycle::{FocusRefreshHook, LifecycleHook, LifecycleManager};
pub use session::InboxSession;
pub use sdk::{EventConfig, FitcoachConfig, FitcoachConfigBuilder, FitcoachSDK, ReadSyncConfig};
