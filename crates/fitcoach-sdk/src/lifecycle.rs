//! SDK 生命周期管理
//!
//! 管理 App 前后台（窗口焦点）切换等一级生命周期事件，统一触发各模块的状态切换。

use crate::error::Result;
use tracing::{info, warn};
use std::sync::Arc;
use async_trait::async_trait;

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应生命周期变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台（失去焦点）时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台（重新获得焦点）时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
        }
    }

    /// 获取已注册的 Hook 数量
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// 注册生命周期回调 Hook
    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    /// 通知所有 Hook：App 切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败会记录错误但继续执行其他 Hook，最后返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到后台");

        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        info!("✅ 所有模块后台切换完成");
        Ok(())
    }

    /// 通知所有 Hook：App 切换到前台
    ///
    /// 按注册顺序执行，某个 Hook 失败会记录错误但继续执行其他 Hook，最后返回第一个错误
    pub async fn notify_foreground(&self) -> Result<()> {
        info!("🔄 通知所有模块：App 切换到前台");

        let mut first_error = None;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        info!("✅ 所有模块前台切换完成");
        Ok(())
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

// 焦点刷新 Hook（会话启动时自动注册）
mod focus_hook;
pub use focus_hook::FocusRefreshHook;
