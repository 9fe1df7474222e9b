//! Guest 就绪探测
//!
//! 三个条件各自单调收敛：Guest Agent 运行、获得 IP、IP 可 ping 通。
//! 三者全部满足即就绪；超时后报告哪些条件始终未满足。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fleet_transport::{GuestNic, IpAddressState, VmRef};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::VmHandle;
use crate::{BatchContext, ExecutorError, Result};

/// 未满足的就绪条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingCondition {
    /// Guest Agent 未运行
    ToolsNotRunning,
    /// 未获取到 IP
    IpNotDetected,
    /// ping 不通
    PingFailed,
}

impl std::fmt::Display for MissingCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::ToolsNotRunning => "Guest Agent 未运行",
            Self::IpNotDetected => "未获取到 IP",
            Self::PingFailed => "ping 不通",
        };
        write!(f, "{}", text)
    }
}

/// 就绪探测状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestReadiness {
    pub tools_ready: bool,
    pub ip_detected: bool,
    pub ping_success: bool,
    /// 最近一次读到的 IP（可能在轮询之间变化）
    pub ip_address: Option<String>,
}

impl GuestReadiness {
    pub fn is_ready(&self) -> bool {
        self.tools_ready && self.ip_detected && self.ping_success
    }

    pub fn missing(&self) -> Vec<MissingCondition> {
        let mut missing = Vec::new();
        if !self.tools_ready {
            missing.push(MissingCondition::ToolsNotRunning);
        }
        if !self.ip_detected {
            missing.push(MissingCondition::IpNotDetected);
        }
        if !self.ping_success {
            missing.push(MissingCondition::PingFailed);
        }
        missing
    }

    fn status_line(&self) -> String {
        format!(
            "Agent: {}, IP: {}, Ping: {}",
            if self.tools_ready { "就绪" } else { "等待" },
            self.ip_address.as_deref().unwrap_or("等待"),
            if self.ping_success { "成功" } else { "等待" },
        )
    }
}

// ============================================
// Ping
// ============================================

/// 可达性探测
#[async_trait]
pub trait Pinger: Send + Sync {
    /// 发送一次探测，成功返回 true
    async fn ping(&self, address: &str, timeout: Duration) -> bool;
}

/// 调用系统 ping 命令
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPinger;

#[async_trait]
impl Pinger for SystemPinger {
    async fn ping(&self, address: &str, timeout: Duration) -> bool {
        let mut cmd = Command::new("ping");
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w", &timeout.as_millis().to_string(), address]);
        } else {
            cmd.args(["-c", "1", "-W", &timeout.as_secs().max(1).to_string(), address]);
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        match tokio::time::timeout(timeout + Duration::from_secs(1), cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("无法执行 ping: {}", e);
                false
            }
            Err(_) => false,
        }
    }
}

// ============================================
// 探测
// ============================================

/// 从 Guest 网卡中选出 IP
///
/// 有状态地址列表时只取 preferred 地址；只有旧式地址列表时取第一个。
pub fn pick_ip(nics: &[GuestNic]) -> Option<String> {
    for nic in nics {
        let found = if !nic.ip_config.is_empty() {
            nic.ip_config
                .iter()
                .find(|ip| ip.state == IpAddressState::Preferred)
                .map(|ip| ip.address.clone())
        } else {
            nic.ip_addresses.first().cloned()
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

/// 等待 Guest 就绪
pub async fn wait_for_guest_ready(
    ctx: &BatchContext,
    vm: &VmRef,
    pinger: &dyn Pinger,
) -> Result<GuestReadiness> {
    let settings = &ctx.settings;
    let start = Instant::now();
    let deadline = start + settings.guest_ready_timeout();
    let mut last_report = start;
    let mut handle = VmHandle::new(vm.clone());
    let mut state = GuestReadiness::default();

    info!("⏳ 等待 Guest 系统就绪: {} (超时 {:?})", vm.name, settings.guest_ready_timeout());

    while Instant::now() < deadline {
        match probe_once(ctx, &mut handle, pinger, &mut state).await {
            Ok(()) => {
                if state.is_ready() {
                    info!("✅ Guest 系统已就绪: {} ({:?})", vm.name, start.elapsed());
                    return Ok(state);
                }

                if last_report.elapsed() >= settings.guest_ready_report() {
                    info!("⏳ {} 当前状态: {}", vm.name, state.status_line());
                    last_report = Instant::now();
                }

                tokio::time::sleep(settings.guest_ready_poll()).await;
            }
            Err(e) => {
                warn!("⚠️  读取 {} 状态失败: {}", vm.name, e);
                tokio::time::sleep(settings.guest_ready_error_backoff()).await;
            }
        }
    }

    Err(ExecutorError::GuestNotReady {
        missing: state.missing(),
    })
}

async fn probe_once(
    ctx: &BatchContext,
    handle: &mut VmHandle,
    pinger: &dyn Pinger,
    state: &mut GuestReadiness,
) -> Result<()> {
    // 句柄按会话缓存，长时间轮询期间每轮都按名称重新解析
    handle.refresh(ctx).await?;

    let tools = handle
        .read(ctx, |s, vm| async move { s.tools_status(&vm).await })
        .await?;
    if tools.is_running() {
        if !state.tools_ready {
            info!("✅ Guest Agent 已运行");
        }
        state.tools_ready = true;
    }

    let mut ip_now = None;
    if state.tools_ready {
        let nics = handle
            .read(ctx, |s, vm| async move { s.guest_nics(&vm).await })
            .await?;
        ip_now = pick_ip(&nics);
        if let Some(ip) = &ip_now {
            if !state.ip_detected {
                info!("✅ 检测到 IP: {}", ip);
            }
            state.ip_detected = true;
            state.ip_address = Some(ip.clone());
        }
    }

    if let Some(ip) = ip_now {
        if !state.ping_success && pinger.ping(&ip, ctx.settings.ping_timeout()).await {
            info!("✅ ping 成功: {}", ip);
            state.ping_success = true;
        }
    }

    Ok(())
}
