//! 执行器参数
//!
//! 所有超时与轮询间隔集中在这里，便于配置文件覆盖，也便于测试缩短时间。

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 回滚快照策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertPolicy {
    /// 总是执行回滚任务
    #[default]
    Always,
    /// 已处于目标快照时跳过
    SkipIfCurrent,
}

/// 执行器参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// 优雅关机等待时间（秒）
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// 优雅关机期间轮询电源状态的间隔（秒）
    #[serde(default = "default_shutdown_poll")]
    pub shutdown_poll_secs: u64,

    /// 重启时关机与开机之间的停顿（秒）
    #[serde(default = "default_reboot_pause")]
    pub reboot_pause_secs: u64,

    /// 强制关机失败时是否作为错误上报
    #[serde(default = "default_true")]
    pub escalate_forced_poweroff_failure: bool,

    /// 任务提交后首次读取状态前的等待（毫秒）
    #[serde(default = "default_task_grace")]
    pub task_grace_ms: u64,

    /// 任务轮询间隔（毫秒）
    #[serde(default = "default_task_poll")]
    pub task_poll_ms: u64,

    /// 克隆进度轮询间隔（秒）
    #[serde(default = "default_clone_progress_poll")]
    pub clone_progress_poll_secs: u64,

    /// Guest 就绪超时（秒）
    #[serde(default = "default_guest_ready_timeout")]
    pub guest_ready_timeout_secs: u64,

    /// Guest 就绪轮询间隔（秒）
    #[serde(default = "default_guest_ready_poll")]
    pub guest_ready_poll_secs: u64,

    /// 读取 Guest 状态出错后的退避（秒）
    #[serde(default = "default_guest_ready_backoff")]
    pub guest_ready_error_backoff_secs: u64,

    /// 就绪状态快照的输出间隔（秒）
    #[serde(default = "default_guest_ready_report")]
    pub guest_ready_report_secs: u64,

    /// 单次 ping 超时（秒）
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// 是否等待 Guest 命令退出并检查退出码
    #[serde(default = "default_true")]
    pub wait_for_guest_commands: bool,

    /// 单条 Guest 命令的最长等待（秒）
    #[serde(default = "default_guest_command_timeout")]
    pub guest_command_timeout_secs: u64,

    /// Guest 命令退出码轮询间隔（秒）
    #[serde(default = "default_guest_command_poll")]
    pub guest_command_poll_secs: u64,

    /// 回滚快照策略
    #[serde(default)]
    pub revert_policy: RevertPolicy,

    /// Ubuntu/Debian netplan 配置使用的网卡名
    #[serde(default = "default_netplan_interface")]
    pub netplan_interface: String,

    /// CentOS/RHEL network-scripts 使用的网卡名
    #[serde(default = "default_ifcfg_interface")]
    pub ifcfg_interface: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout(),
            shutdown_poll_secs: default_shutdown_poll(),
            reboot_pause_secs: default_reboot_pause(),
            escalate_forced_poweroff_failure: default_true(),
            task_grace_ms: default_task_grace(),
            task_poll_ms: default_task_poll(),
            clone_progress_poll_secs: default_clone_progress_poll(),
            guest_ready_timeout_secs: default_guest_ready_timeout(),
            guest_ready_poll_secs: default_guest_ready_poll(),
            guest_ready_error_backoff_secs: default_guest_ready_backoff(),
            guest_ready_report_secs: default_guest_ready_report(),
            ping_timeout_secs: default_ping_timeout(),
            wait_for_guest_commands: default_true(),
            guest_command_timeout_secs: default_guest_command_timeout(),
            guest_command_poll_secs: default_guest_command_poll(),
            revert_policy: RevertPolicy::default(),
            netplan_interface: default_netplan_interface(),
            ifcfg_interface: default_ifcfg_interface(),
        }
    }
}

impl ExecutorSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_secs(self.shutdown_poll_secs)
    }

    pub fn reboot_pause(&self) -> Duration {
        Duration::from_secs(self.reboot_pause_secs)
    }

    pub fn task_grace(&self) -> Duration {
        Duration::from_millis(self.task_grace_ms)
    }

    pub fn task_poll(&self) -> Duration {
        Duration::from_millis(self.task_poll_ms)
    }

    pub fn clone_progress_poll(&self) -> Duration {
        Duration::from_secs(self.clone_progress_poll_secs)
    }

    pub fn guest_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.guest_ready_timeout_secs)
    }

    pub fn guest_ready_poll(&self) -> Duration {
        Duration::from_secs(self.guest_ready_poll_secs)
    }

    pub fn guest_ready_error_backoff(&self) -> Duration {
        Duration::from_secs(self.guest_ready_error_backoff_secs)
    }

    pub fn guest_ready_report(&self) -> Duration {
        Duration::from_secs(self.guest_ready_report_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn guest_command_timeout(&self) -> Duration {
        Duration::from_secs(self.guest_command_timeout_secs)
    }

    pub fn guest_command_poll(&self) -> Duration {
        Duration::from_secs(self.guest_command_poll_secs)
    }

    pub fn with_revert_policy(mut self, policy: RevertPolicy) -> Self {
        self.revert_policy = policy;
        self
    }

    pub fn with_escalate_forced_poweroff_failure(mut self, escalate: bool) -> Self {
        self.escalate_forced_poweroff_failure = escalate;
        self
    }

    pub fn with_guest_ready_timeout(mut self, secs: u64) -> Self {
        self.guest_ready_timeout_secs = secs;
        self
    }
}

// 默认值函数
fn default_shutdown_timeout() -> u64 {
    60
}

fn default_shutdown_poll() -> u64 {
    2
}

fn default_reboot_pause() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_task_grace() -> u64 {
    100
}

fn default_task_poll() -> u64 {
    100
}

fn default_clone_progress_poll() -> u64 {
    1
}

fn default_guest_ready_timeout() -> u64 {
    300
}

fn default_guest_ready_poll() -> u64 {
    5
}

fn default_guest_ready_backoff() -> u64 {
    10
}

fn default_guest_ready_report() -> u64 {
    30
}

fn default_ping_timeout() -> u64 {
    2
}

fn default_guest_command_timeout() -> u64 {
    120
}

fn default_guest_command_poll() -> u64 {
    1
}

fn default_netplan_interface() -> String {
    "ens33".to_string()
}

fn default_ifcfg_interface() -> String {
    "eth0".to_string()
}
