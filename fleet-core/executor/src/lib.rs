//! Fleet 执行器
//!
//! 虚拟机批量操作编排引擎：按工作项顺序执行克隆、删除、开关机、
//! 快照、硬件重配置与 Guest 系统定制，逐操作隔离错误并汇总报告。

pub mod batch;
pub mod clone;
pub mod context;
pub mod customize;
pub mod fleet;
pub mod guest_ready;
pub mod hardware;
pub mod operation;
pub mod power;
pub mod report;
pub mod settings;
pub mod snapshot;
pub mod task_waiter;

pub use batch::{delete_vm, BatchExecutor, BatchHandle};
pub use clone::clone_vm;
pub use context::{BatchContext, ProgressEvent, VmHandle};
pub use customize::{
    classify_os, customize_vm, netmask_to_prefix, prefix_to_netmask, CustomizeOutcome, OsFamily,
};
pub use fleet::{load_fleet_config, parse_fleet_csv, FleetConfig, VmConfig, UNGROUPED};
pub use guest_ready::{wait_for_guest_ready, GuestReadiness, MissingCondition, Pinger, SystemPinger};
pub use hardware::reconfigure;
pub use operation::{BatchRequest, Operation, VmOperations, WorkItem};
pub use power::{power_off, power_off_checked, power_on, reboot, PowerOffOutcome, PowerOnOutcome};
pub use report::{BatchReport, BatchSummary, OperationStatus};
pub use settings::{ExecutorSettings, RevertPolicy};
pub use snapshot::{
    create_snapshot, find_snapshot, list_snapshot_names, revert_to_snapshot, RevertOutcome,
    SnapshotLookup,
};
pub use task_waiter::wait_for_task;

use fleet_transport::TransportError;
use thiserror::Error;

/// 错误分类（供程序化处理，展示仍使用 Display 文本）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 会话级连接/认证失败，整批致命
    Connectivity,
    /// 配置加载失败，整批致命
    Configuration,
    /// 虚拟机不存在
    VmNotFound,
    /// 单个操作失败
    OperationFailed,
    /// Guest 就绪等待超时
    GuestNotReady,
    /// 被取消
    Interrupted,
    /// 请求本身无效
    InvalidRequest,
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("无法连接到虚拟化主机: {0}")]
    ConnectivityFailed(String),

    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    #[error("虚拟机 {0} 不存在")]
    VmNotFound(String),

    #[error("{description}失败: {message}")]
    OperationFailed { description: String, message: String },

    #[error("等待 Guest 系统就绪超时: {}", join_conditions(.missing))]
    GuestNotReady { missing: Vec<MissingCondition> },

    #[error("快照 {name} 不存在")]
    SnapshotNotFound { name: String },

    #[error("操作已中断")]
    Interrupted,

    #[error("无效请求: {0}")]
    InvalidRequest(String),

    #[error("Guest 登录凭据无效")]
    GuestLoginInvalid,

    #[error("Guest 操作失败: {0}")]
    GuestOperationsFault(String),

    #[error("Guest Agent 不可用或未运行")]
    ToolsUnavailable,

    #[error("Guest 命令执行失败: {0}")]
    GuestCommandFailed(String),

    #[error("传输错误: {0}")]
    Transport(TransportError),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(String),
}

impl ExecutorError {
    pub fn operation_failed(description: &str, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            description: description.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectivityFailed(_) => ErrorKind::Connectivity,
            Self::ConfigLoadFailed(_) => ErrorKind::Configuration,
            Self::VmNotFound(_) => ErrorKind::VmNotFound,
            Self::GuestNotReady { .. } => ErrorKind::GuestNotReady,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::OperationFailed { .. }
            | Self::SnapshotNotFound { .. }
            | Self::GuestLoginInvalid
            | Self::GuestOperationsFault(_)
            | Self::ToolsUnavailable
            | Self::GuestCommandFailed(_)
            | Self::Transport(_)
            | Self::IoError(_)
            | Self::SerdeError(_) => ErrorKind::OperationFailed,
        }
    }
}

impl From<TransportError> for ExecutorError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::GuestLoginInvalid => Self::GuestLoginInvalid,
            TransportError::GuestOperationsFault(msg) => Self::GuestOperationsFault(msg),
            TransportError::ToolsUnavailable => Self::ToolsUnavailable,
            TransportError::GuestExecFailed(msg) => Self::GuestCommandFailed(msg),
            other => Self::Transport(other),
        }
    }
}

fn join_conditions(missing: &[MissingCondition]) -> String {
    missing
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
