//! 焦点刷新 Hook
//!
//! App 重新获得焦点时，在稳定延迟后做一次权威刷新，作为独立于实时通道的收敛机制。
//! 连续的焦点事件只保留最后一次刷新；切到后台时取消尚未执行的刷新。

use crate::error::Result;
use crate::lifecycle::LifecycleHook;
use crate::realtime::RealtimeReconciler;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct FocusRefreshHook {
    reconciler: Arc<RealtimeReconciler>,
    cancel: CancellationToken,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl FocusRefreshHook {
    pub fn new(reconciler: Arc<RealtimeReconciler>, cancel: CancellationToken) -> Self {
        Self {
            reconciler,
            cancel,
            pending: Mutex::new(None),
        }
    }

    /// 取出尚未完成的刷新任务（用于等待其完成）
    pub fn take_pending(&self) -> Option<JoinHandle<()>> {
        self.pending.lock().take()
    }

    fn abort_pending(&self) {
        if let Some(handle) = self.pending.lock().take() {
            if !handle.is_finished() {
                debug!("取消尚未执行的焦点刷新");
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl LifecycleHook for FocusRefreshHook {
    /// 失去焦点：取消待执行的刷新
    async fn on_background(&self) -> Result<()> {
        self.abort_pending();
        Ok(())
    }

    /// 重新获得焦点：安排一次延迟刷新，不阻塞调用方
    async fn on_foreground(&self) -> Result<()> {
        self.abort_pending();
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let reconciler = self.reconciler.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            match reconciler.reconcile_after_focus(&cancel).await {
                Ok(()) => info!("[Focus Hook] ✅ 焦点刷新完成"),
                Err(e) if cancel.is_cancelled() => debug!("[Focus Hook] 会话已结束，跳过刷新: {}", e),
                Err(e) => warn!("[Focus Hook] ⚠️ 焦点刷新失败: {}", e),
            }
        });
        *self.pending.lock() = Some(handle);
        Ok(())
    }
}
