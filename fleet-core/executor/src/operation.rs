//! 操作定义与批量请求

use serde::{Deserialize, Serialize};

use crate::{ExecutorError, Result};

/// 单个虚拟机操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    /// 按配置从源虚拟机克隆
    Clone,
    /// 关机并删除
    Delete,
    /// CPU / 内存 / 网卡重配置
    Hardware,
    /// Guest 系统网络与主机名定制
    Customize,
    /// 创建快照（名称缺省时取配置或时间戳）
    Snapshot { name: Option<String> },
    /// 回滚到指定快照
    Revert { name: String },
    /// 关机
    #[serde(rename = "poweroff")]
    PowerOff,
    /// 开机
    #[serde(rename = "poweron")]
    PowerOn,
}

impl Operation {
    /// 所有合法的操作名称
    pub const NAMES: [&'static str; 8] = [
        "clone", "delete", "hardware", "customize", "snapshot", "revert", "poweroff", "poweron",
    ];

    /// 由操作名称与请求级参数构造
    pub fn parse(name: &str, snapshot_name: Option<&str>, revert_name: Option<&str>) -> Result<Self> {
        match name {
            "clone" => Ok(Self::Clone),
            "delete" => Ok(Self::Delete),
            "hardware" => Ok(Self::Hardware),
            "customize" => Ok(Self::Customize),
            "snapshot" => Ok(Self::Snapshot {
                name: snapshot_name
                    .filter(|n| !n.trim().is_empty())
                    .map(str::to_string),
            }),
            "revert" => match revert_name.filter(|n| !n.trim().is_empty()) {
                Some(n) => Ok(Self::Revert {
                    name: n.to_string(),
                }),
                None => Err(ExecutorError::InvalidRequest(
                    "未指定要回滚的快照名称".to_string(),
                )),
            },
            "poweroff" => Ok(Self::PowerOff),
            "poweron" => Ok(Self::PowerOn),
            other => Err(ExecutorError::InvalidRequest(format!(
                "未知操作: {} (可选: {})",
                other,
                Self::NAMES.join(", ")
            ))),
        }
    }

    /// 操作名称
    pub fn name(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Delete => "delete",
            Self::Hardware => "hardware",
            Self::Customize => "customize",
            Self::Snapshot { .. } => "snapshot",
            Self::Revert { .. } => "revert",
            Self::PowerOff => "poweroff",
            Self::PowerOn => "poweron",
        }
    }

    /// 中文描述
    pub fn description(&self) -> &'static str {
        match self {
            Self::Clone => "克隆",
            Self::Delete => "删除",
            Self::Hardware => "硬件重配置",
            Self::Customize => "系统定制",
            Self::Snapshot { .. } => "创建快照",
            Self::Revert { .. } => "回滚快照",
            Self::PowerOff => "关机",
            Self::PowerOn => "开机",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 状态表中的键: `{vm}_{operation}`
pub fn operation_key(vm: &str, operation: &str) -> String {
    format!("{}_{}", vm, operation)
}

/// 工作项：一台虚拟机及其有序操作列表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub vm: String,
    pub operations: Vec<Operation>,
}

impl WorkItem {
    pub fn new(vm: &str, operations: Vec<Operation>) -> Self {
        Self {
            vm: vm.to_string(),
            operations,
        }
    }
}

/// 请求中的单台虚拟机
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmOperations {
    pub vm: String,
    pub operations: Vec<String>,
}

/// 批量请求（界面层提交的原始形式）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub vm_operations: Vec<VmOperations>,
    #[serde(default)]
    pub snapshot_name: Option<String>,
    #[serde(default)]
    pub revert_name: Option<String>,
}

impl BatchRequest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    /// 校验并转换为工作项；任何一个操作名称无效都拒绝整个请求
    pub fn into_work_items(self) -> Result<Vec<WorkItem>> {
        let snapshot = self.snapshot_name.as_deref();
        let revert = self.revert_name.as_deref();

        self.vm_operations
            .iter()
            .map(|entry| {
                let operations = entry
                    .operations
                    .iter()
                    .map(|name| Operation::parse(name, snapshot, revert))
                    .collect::<Result<Vec<_>>>()?;
                // 报告按 "{vm}_{operation}" 记录状态，同一虚拟机的重复操作无法区分
                for (i, op) in operations.iter().enumerate() {
                    if operations[..i].iter().any(|prev| prev.name() == op.name()) {
                        return Err(ExecutorError::InvalidRequest(format!(
                            "虚拟机 {} 的操作 {} 重复",
                            entry.vm,
                            op.name()
                        )));
                    }
                }
                Ok(WorkItem::new(&entry.vm, operations))
            })
            .collect()
    }
}
