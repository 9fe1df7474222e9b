//! 克隆编排
//!
//! 源虚拟机先关机并回滚到配置的源快照，断开光驱后整盘复制到目标数据存储。

use fleet_transport::{
    CloneSpec, DeviceChange, ReconfigSpec, RelocateSpec, VirtualDevice, VmRef,
};
use tracing::{debug, info, warn};

use crate::context::ProgressEvent;
use crate::fleet::VmConfig;
use crate::power::power_off_checked;
use crate::snapshot::revert_to_snapshot;
use crate::task_waiter::{wait_for_task, wait_for_task_every};
use crate::{BatchContext, ExecutorError, Result};

/// 单调不减的进度跟踪
///
/// 任务未报告进度时沿用上一次的值，回退的读数被忽略。
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<u8>,
}

impl ProgressTracker {
    /// 记录一次读数，进度前进时返回新值
    pub fn observe(&mut self, reported: Option<u8>) -> Option<u8> {
        let current = self.last.unwrap_or(0);
        let next = reported.map(|p| p.min(100)).unwrap_or(current).max(current);
        if self.last.is_none() || next > current {
            self.last = Some(next);
            return Some(next);
        }
        None
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }
}

/// 按配置克隆虚拟机，返回新虚拟机
pub async fn clone_vm(ctx: &BatchContext, config: &VmConfig) -> Result<VmRef> {
    let session = ctx.session();

    let source_name = config.source_vm.as_deref().ok_or_else(|| {
        ExecutorError::InvalidRequest(format!("虚拟机 {} 未配置源虚拟机", config.name))
    })?;
    let datastore_name = config.datastore.as_deref().ok_or_else(|| {
        ExecutorError::InvalidRequest(format!("虚拟机 {} 未配置目标数据存储", config.name))
    })?;

    let source = ctx.resolve_vm(source_name).await?;
    let datastore = session
        .host_datastores(&source)
        .await?
        .into_iter()
        .find(|ds| ds.name == datastore_name)
        .ok_or_else(|| {
            ExecutorError::operation_failed(
                "查找数据存储",
                format!("数据存储 {} 在源虚拟机所在主机上不存在", datastore_name),
            )
        })?;

    power_off_checked(ctx, &source).await?;

    match config.source_snapshot.as_deref() {
        Some(snapshot) => {
            revert_to_snapshot(ctx, &source, snapshot).await?;
        }
        None => warn!("⚠️  {} 未配置源快照，从当前状态克隆", config.name),
    }

    disconnect_cdroms(ctx, &source).await;

    let spec = CloneSpec {
        name: config.name.clone(),
        relocate: RelocateSpec {
            datastore,
            pool: session.host_resource_pool(&source).await?,
            disallow_disk_sharing: true,
        },
        power_on: false,
        num_cpus: config.cpu_count,
        memory_mb: config.memory_mb,
    };

    info!("🧬 克隆 {} -> {} ({})", source.name, spec.name, spec.relocate.datastore.name);
    let task = session.clone_vm(&source, &spec).await?;

    let mut tracker = ProgressTracker::default();
    let result = wait_for_task_every(
        task.as_ref(),
        "克隆虚拟机",
        &ctx.settings,
        ctx.settings.clone_progress_poll(),
        |reported| {
            if let Some(percent) = tracker.observe(reported) {
                debug!("克隆进度 {}: {}%", config.name, percent);
                ctx.emit(ProgressEvent::CloneProgress {
                    vm: config.name.clone(),
                    percent,
                });
            }
        },
    )
    .await?;

    if tracker.last() != Some(100) {
        ctx.emit(ProgressEvent::CloneProgress {
            vm: config.name.clone(),
            percent: 100,
        });
    }

    let cloned = match result {
        Some(vm) => vm,
        None => ctx.resolve_vm(&config.name).await?,
    };
    info!("✅ 克隆完成: {}", cloned.name);
    Ok(cloned)
}

/// 断开所有光驱（失败只记录警告）
async fn disconnect_cdroms(ctx: &BatchContext, vm: &VmRef) {
    let devices = match ctx.session().devices(vm).await {
        Ok(devices) => devices,
        Err(e) => {
            warn!("⚠️  读取 {} 设备列表失败: {}", vm.name, e);
            return;
        }
    };

    let spec = ReconfigSpec {
        device_changes: devices
            .iter()
            .filter(|d| d.is_cdrom())
            .map(|d: &VirtualDevice| DeviceChange::DisconnectCdRom { device_key: d.key })
            .collect(),
        ..ReconfigSpec::default()
    };
    if spec.is_empty() {
        return;
    }

    info!("💿 断开 {} 的 {} 个光驱", vm.name, spec.device_changes.len());
    let outcome = async {
        let task = ctx.session().reconfigure(vm, &spec).await?;
        wait_for_task(task.as_ref(), "断开光驱", &ctx.settings).await
    }
    .await;
    if let Err(e) = outcome {
        warn!("⚠️  断开光驱失败，继续克隆: {}", e);
    }
}
