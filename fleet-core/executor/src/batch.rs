//! 批量执行器
//!
//! 按工作项顺序、逐个操作串行执行。单个操作的失败只记录不中断；
//! 取消在操作之间检查，已开始的操作会执行到结束。

use std::sync::Arc;

use fleet_transport::{Hypervisor, VmRef};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clone::clone_vm;
use crate::context::{BatchContext, ProgressEvent};
use crate::customize::customize_vm;
use crate::fleet::{FleetConfig, VmConfig};
use crate::guest_ready::{Pinger, SystemPinger};
use crate::hardware::reconfigure;
use crate::operation::{Operation, WorkItem};
use crate::power::{power_off_checked, power_on};
use crate::report::{BatchReport, OperationStatus};
use crate::snapshot::{create_snapshot, revert_to_snapshot};
use crate::task_waiter::wait_for_task;
use crate::{ExecutorError, ExecutorSettings, Result};

/// 批量执行器
pub struct BatchExecutor {
    session: Arc<dyn Hypervisor>,
    fleet: Arc<FleetConfig>,
    settings: ExecutorSettings,
    progress: Option<UnboundedSender<ProgressEvent>>,
    pinger: Arc<dyn Pinger>,
}

impl BatchExecutor {
    pub fn new(session: Arc<dyn Hypervisor>, fleet: FleetConfig, settings: ExecutorSettings) -> Self {
        Self {
            session,
            fleet: Arc::new(fleet),
            settings,
            progress: None,
            pinger: Arc::new(SystemPinger),
        }
    }

    /// 订阅进度事件
    pub fn with_progress(mut self, sender: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// 替换可达性探测实现
    pub fn with_pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pinger = pinger;
        self
    }

    /// 执行整个批次，结束时（无论成功、部分失败或取消）释放会话一次
    pub async fn run(&self, items: Vec<WorkItem>, cancel: CancellationToken) -> BatchReport {
        let mut ctx = BatchContext::new(Arc::clone(&self.session), self.settings.clone())
            .with_cancel(cancel);
        if let Some(sender) = &self.progress {
            ctx = ctx.with_progress(sender.clone());
        }

        let pending: Vec<(&str, &Operation)> = items
            .iter()
            .flat_map(|item| item.operations.iter().map(move |op| (item.vm.as_str(), op)))
            .collect();
        let mut report = BatchReport::new(pending.len());

        info!("🚀 开始执行批次: {} 台虚拟机, {} 个操作", items.len(), pending.len());

        for (index, &(vm, op)) in pending.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                let skipped = &pending[index..];
                for &(vm, op) in skipped {
                    report.record_interrupted(vm, op.name());
                    emit_status(&ctx, vm, op, OperationStatus::Interrupted);
                }
                warn!("🛑 批次已取消，{} 个操作未执行", skipped.len());
                report.push_error(format!("批次已中断，{} 个操作未执行", skipped.len()));
                break;
            }

            info!("▶️  [{}/{}] {} {}", index + 1, pending.len(), op.description(), vm);
            report.record_active(vm, op.name());
            emit_status(&ctx, vm, op, OperationStatus::Active);

            match self.execute(&ctx, vm, op).await {
                Ok(()) => {
                    report.record_success(vm, op.name());
                    emit_status(&ctx, vm, op, OperationStatus::Success);
                }
                Err(e) => {
                    let message = format!("操作 '{}' 在 {} 上失败: {}", op, vm, e);
                    error!("❌ {}", message);
                    report.record_error(vm, op.name(), message);
                    emit_status(&ctx, vm, op, OperationStatus::Error);
                }
            }
        }

        self.session.disconnect().await;

        info!(
            "🏁 批次结束: 成功 {}/{}, 错误 {}",
            report.success_count,
            report.total_operations,
            report.errors.len()
        );
        report
    }

    /// 在后台任务中执行批次
    pub fn spawn(self, items: Vec<WorkItem>) -> BatchHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(items, token).await });
        BatchHandle { cancel, join }
    }

    async fn execute(&self, ctx: &BatchContext, vm_name: &str, op: &Operation) -> Result<()> {
        let resolve = || ctx.resolve_vm(vm_name);

        match op {
            // 克隆自己解析源虚拟机
            Operation::Clone => {
                clone_vm(ctx, self.config_for(vm_name)?).await?;
            }
            Operation::Delete => {
                let vm = resolve().await?;
                delete_vm(ctx, &vm).await?;
            }
            Operation::Hardware => {
                let vm = resolve().await?;
                let config = self.config_for(vm_name)?;
                reconfigure(
                    ctx,
                    &vm,
                    config.cpu_count,
                    config.memory_mb,
                    config.network.as_deref(),
                )
                .await?;
            }
            Operation::Customize => {
                let vm = resolve().await?;
                customize_vm(ctx, &vm, self.config_for(vm_name)?, self.pinger.as_ref()).await?;
            }
            Operation::Snapshot { name } => {
                let vm = resolve().await?;
                create_snapshot(ctx, &vm, name.as_deref(), self.fleet.get(vm_name)).await?;
            }
            Operation::Revert { name } => {
                let vm = resolve().await?;
                revert_to_snapshot(ctx, &vm, name).await?;
            }
            Operation::PowerOff => {
                let vm = resolve().await?;
                power_off_checked(ctx, &vm).await?;
            }
            Operation::PowerOn => {
                let vm = resolve().await?;
                power_on(ctx, &vm).await?;
            }
        }
        Ok(())
    }

    fn config_for(&self, vm: &str) -> Result<&VmConfig> {
        self.fleet
            .get(vm)
            .ok_or_else(|| ExecutorError::InvalidRequest(format!("舰队定义中没有虚拟机 {}", vm)))
    }
}

/// 关机后删除虚拟机及其磁盘
pub async fn delete_vm(ctx: &BatchContext, vm: &VmRef) -> Result<()> {
    power_off_checked(ctx, vm).await?;

    info!("🗑️  删除虚拟机: {}", vm.name);
    let task = ctx.session().destroy(vm).await?;
    wait_for_task(task.as_ref(), &format!("删除 {}", vm.name), &ctx.settings).await?;
    info!("✅ 虚拟机 {} 已删除", vm.name);
    Ok(())
}

fn emit_status(ctx: &BatchContext, vm: &str, op: &Operation, status: OperationStatus) {
    ctx.emit(ProgressEvent::Status {
        vm: vm.to_string(),
        operation: op.name().to_string(),
        status,
    });
}

/// 后台批次句柄
pub struct BatchHandle {
    cancel: CancellationToken,
    join: JoinHandle<BatchReport>,
}

impl BatchHandle {
    /// 请求取消（协作式，正在执行的操作会完成）
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 等待批次结束并取回报告
    pub async fn join(self) -> Result<BatchReport> {
        self.join
            .await
            .map_err(|e| ExecutorError::operation_failed("批次执行", e.to_string()))
    }
}
