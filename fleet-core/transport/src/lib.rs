//! Fleet 传输层
//!
//! 负责与虚拟化主机的会话管理，向编排层暴露统一的 [`Hypervisor`] 能力接口：
//! 虚拟机查找、状态读取、异步任务提交以及 Guest 内命令执行。

pub mod config;
pub mod connection;
pub mod libvirt;
pub mod model;
pub mod qga;
pub mod session;
pub mod task;

pub use config::{TransportConfig, TransportKind};
pub use connection::{check_reachable, connect, ConnectionState, HostConnection};
pub use libvirt::LibvirtSession;
pub use model::*;
pub use session::Hypervisor;
pub use task::{BackgroundTask, ProgressHandle, Task, TaskFault, TaskInfo, TaskState};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 传输层错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("连接失败: {0}")]
    ConnectionFailed(String),

    #[error("主机 {host}:{port} 不可达")]
    Unreachable { host: String, port: u16 },

    #[error("虚拟机 {0} 不存在")]
    DomainNotFound(String),

    #[error("虚拟机句柄已失效: {0}")]
    StaleHandle(String),

    #[error("连接超时")]
    Timeout,

    #[error("连接已断开")]
    Disconnected,

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Libvirt 错误: {0}")]
    LibvirtError(String),

    #[error("外部命令执行失败: {0}")]
    CommandFailed(String),

    #[error("响应解析失败: {0}")]
    ParseError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("Guest 登录凭据无效")]
    GuestLoginInvalid,

    #[error("Guest 操作失败: {0}")]
    GuestOperationsFault(String),

    #[error("Guest Agent 不可用")]
    ToolsUnavailable,

    #[error("Guest 命令执行失败: {0}")]
    GuestExecFailed(String),
}

impl TransportError {
    /// 句柄是否已失效（需要按名称重新解析）
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleHandle(_) | Self::DomainNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

// ============================================
// 电源状态 / Guest Agent 状态
// ============================================

/// 虚拟机电源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    /// 运行中
    PoweredOn,
    /// 已关闭
    PoweredOff,
    /// 挂起
    Suspended,
}

impl PowerState {
    /// 从 virt::sys::virDomainState 创建
    ///
    /// 正在关机 (SHUTDOWN) 的域仍视为运行中，直到真正进入 SHUTOFF。
    pub fn from_virt_state(state: virt::sys::virDomainState) -> Self {
        match state {
            virt::sys::VIR_DOMAIN_RUNNING
            | virt::sys::VIR_DOMAIN_BLOCKED
            | virt::sys::VIR_DOMAIN_SHUTDOWN => Self::PoweredOn,
            virt::sys::VIR_DOMAIN_PAUSED | virt::sys::VIR_DOMAIN_PMSUSPENDED => Self::Suspended,
            _ => Self::PoweredOff,
        }
    }

    /// 获取中文显示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PoweredOn => "运行中",
            Self::PoweredOff => "已关闭",
            Self::Suspended => "挂起",
        }
    }

    /// 获取带 emoji 的显示名称
    pub fn display_with_emoji(&self) -> &'static str {
        match self {
            Self::PoweredOn => "运行中 ✅",
            Self::PoweredOff => "已关闭 ⚫",
            Self::Suspended => "挂起 🌙",
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    pub fn is_off(&self) -> bool {
        matches!(self, Self::PoweredOff)
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Guest Agent 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolsStatus {
    /// 正在运行并响应
    Running,
    /// 已安装但未响应
    NotRunning,
    /// 未安装
    NotInstalled,
}

impl ToolsStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}
