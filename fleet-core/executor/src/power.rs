//! 电源控制
//!
//! 关机优先走 Guest 优雅关机，超时或不可用时退回强制关机。

use fleet_transport::VmRef;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::task_waiter::wait_for_task;
use crate::{BatchContext, ExecutorError, Result};

/// 开机结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOnOutcome {
    /// 本来就在运行
    AlreadyOn,
    /// 已开机
    PoweredOn,
}

/// 关机结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerOffOutcome {
    /// 本来就是关机状态
    AlreadyOff,
    /// Guest 优雅关机成功
    Graceful,
    /// 退回强制关机并成功
    Forced,
    /// 强制关机失败
    ForcedFailed(String),
}

impl PowerOffOutcome {
    /// 是否改变了虚拟机的电源状态
    pub fn changed_state(&self) -> bool {
        matches!(self, Self::Graceful | Self::Forced)
    }
}

/// 开机（已运行时为空操作）
pub async fn power_on(ctx: &BatchContext, vm: &VmRef) -> Result<PowerOnOutcome> {
    let session = ctx.session();

    if session.power_state(vm).await?.is_on() {
        debug!("虚拟机 {} 已在运行", vm.name);
        return Ok(PowerOnOutcome::AlreadyOn);
    }

    info!("▶️  开机: {}", vm.name);
    let task = session.power_on(vm).await?;
    wait_for_task(task.as_ref(), &format!("开机 {}", vm.name), &ctx.settings).await?;
    info!("✅ 虚拟机 {} 已开机", vm.name);
    Ok(PowerOnOutcome::PoweredOn)
}

/// 关机（已关机时为空操作）
///
/// 强制关机失败不会返回错误，而是以 [`PowerOffOutcome::ForcedFailed`] 交给调用方决定。
pub async fn power_off(ctx: &BatchContext, vm: &VmRef) -> Result<PowerOffOutcome> {
    let session = ctx.session();
    let settings = &ctx.settings;

    if session.power_state(vm).await?.is_off() {
        debug!("虚拟机 {} 已关机", vm.name);
        return Ok(PowerOffOutcome::AlreadyOff);
    }

    let tools_running = match session.tools_status(vm).await {
        Ok(status) => status.is_running(),
        Err(e) => {
            warn!("⚠️  读取 {} 的 Guest Agent 状态失败: {}，按未运行处理", vm.name, e);
            false
        }
    };

    if tools_running {
        info!("⏹️  请求 Guest 优雅关机: {}", vm.name);
        match session.shutdown_guest(vm).await {
            Ok(()) => {
                if wait_powered_off(ctx, vm).await {
                    info!("✅ 虚拟机 {} 已优雅关机", vm.name);
                    return Ok(PowerOffOutcome::Graceful);
                }
                warn!(
                    "⚠️  虚拟机 {} 在 {:?} 内未完成关机，改为强制关机",
                    vm.name,
                    settings.shutdown_timeout()
                );
            }
            Err(e) => warn!("⚠️  优雅关机请求失败: {}，改为强制关机", e),
        }
    } else {
        info!("Guest Agent 未运行，直接强制关机: {}", vm.name);
    }

    match force_power_off(ctx, vm).await {
        Ok(()) => {
            info!("✅ 虚拟机 {} 已强制关机", vm.name);
            Ok(PowerOffOutcome::Forced)
        }
        Err(e) => {
            error!("❌ 虚拟机 {} 强制关机失败: {}", vm.name, e);
            Ok(PowerOffOutcome::ForcedFailed(e.to_string()))
        }
    }
}

/// 关机，并按配置把强制关机失败升级为错误
pub async fn power_off_checked(ctx: &BatchContext, vm: &VmRef) -> Result<PowerOffOutcome> {
    let outcome = power_off(ctx, vm).await?;
    match outcome {
        PowerOffOutcome::ForcedFailed(message) if ctx.settings.escalate_forced_poweroff_failure => {
            Err(ExecutorError::operation_failed("强制关机", message))
        }
        other => Ok(other),
    }
}

/// 重启：运行中先关机再开机，已关机则直接开机
pub async fn reboot(ctx: &BatchContext, vm: &VmRef) -> Result<()> {
    if ctx.session().power_state(vm).await?.is_on() {
        power_off_checked(ctx, vm).await?;
        tokio::time::sleep(ctx.settings.reboot_pause()).await;
    }
    power_on(ctx, vm).await?;
    Ok(())
}

async fn force_power_off(ctx: &BatchContext, vm: &VmRef) -> Result<()> {
    let task = ctx.session().power_off(vm).await?;
    wait_for_task(task.as_ref(), &format!("强制关机 {}", vm.name), &ctx.settings).await?;
    Ok(())
}

/// 轮询电源状态直到关机或超时
async fn wait_powered_off(ctx: &BatchContext, vm: &VmRef) -> bool {
    let deadline = Instant::now() + ctx.settings.shutdown_timeout();

    while Instant::now() < deadline {
        tokio::time::sleep(ctx.settings.shutdown_poll()).await;
        match ctx.session().power_state(vm).await {
            Ok(state) if state.is_off() => return true,
            Ok(_) => {}
            Err(e) => {
                warn!("读取电源状态失败: {}", e);
                return false;
            }
        }
    }
    false
}
