//! 批次上下文
//!
//! 每个批次持有自己的会话、取消令牌、参数与进度通道，
//! 所有组件都通过它访问这些资源，批次之间互不干扰。

use std::future::Future;
use std::sync::Arc;

use fleet_transport::{Hypervisor, VmRef};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::report::OperationStatus;
use crate::{ExecutorError, ExecutorSettings, Result};

/// 进度事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// 操作状态变化
    Status {
        vm: String,
        operation: String,
        status: OperationStatus,
    },
    /// 克隆进度百分比
    CloneProgress { vm: String, percent: u8 },
}

/// 批次上下文
#[derive(Clone)]
pub struct BatchContext {
    pub session: Arc<dyn Hypervisor>,
    pub settings: Arc<ExecutorSettings>,
    pub cancel: CancellationToken,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl BatchContext {
    pub fn new(session: Arc<dyn Hypervisor>, settings: ExecutorSettings) -> Self {
        Self {
            session,
            settings: Arc::new(settings),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, sender: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn session(&self) -> &dyn Hypervisor {
        self.session.as_ref()
    }

    /// 发送进度事件（接收端已关闭时静默丢弃）
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.progress {
            if sender.send(event).is_err() {
                debug!("进度接收端已关闭");
            }
        }
    }

    /// 按名称解析虚拟机，不存在时返回 `VmNotFound`
    pub async fn resolve_vm(&self, name: &str) -> Result<VmRef> {
        self.session
            .find_vm(name)
            .await?
            .ok_or_else(|| ExecutorError::VmNotFound(name.to_string()))
    }
}

// ============================================
// 可刷新的虚拟机句柄
// ============================================

/// 句柄 + 名称
///
/// 读取返回句柄失效时，按名称重新解析并重试一次。
pub struct VmHandle {
    vm: VmRef,
}

impl VmHandle {
    pub fn new(vm: VmRef) -> Self {
        Self { vm }
    }

    pub fn get(&self) -> &VmRef {
        &self.vm
    }

    /// 按名称重新解析
    pub async fn refresh(&mut self, ctx: &BatchContext) -> Result<()> {
        self.vm = ctx.resolve_vm(&self.vm.name).await?;
        Ok(())
    }

    /// 带失效重试的读取
    pub async fn read<T, F, Fut>(&mut self, ctx: &BatchContext, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn Hypervisor>, VmRef) -> Fut,
        Fut: Future<Output = fleet_transport::Result<T>>,
    {
        match f(Arc::clone(&ctx.session), self.vm.clone()).await {
            Err(e) if e.is_stale() => {
                debug!("虚拟机 {} 句柄失效，重新解析: {}", self.vm.name, e);
                self.refresh(ctx).await?;
                Ok(f(Arc::clone(&ctx.session), self.vm.clone()).await?)
            }
            other => Ok(other?),
        }
    }
}
