//! 舰队定义加载
//!
//! 分号分隔的 CSV，每行描述一台目标虚拟机：
//!
//! ```text
//! groupName;sourceVM;vmName;vmHostname;targetDatastore;adaptersLan;cpuCount;MemoryMB;ip;netmask;ipGateway;ipDns;sourceSnapshotName;osUserName;osUserPassword;targetSnapshotName;targetSnapshotDescription
//! ```
//!
//! 缺少 `vmName` 的行被丢弃；缺少 `groupName` 的行归入 [`UNGROUPED`]。

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{ExecutorError, Result};

/// 未分组虚拟机的组名
pub const UNGROUPED: &str = "[no group]";

/// 单台虚拟机的配置（CSV 中的一行）
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub group: String,
    pub source_vm: Option<String>,
    /// 目标虚拟机名称（非空）
    pub name: String,
    pub hostname: Option<String>,
    pub datastore: Option<String>,
    pub network: Option<String>,
    pub cpu_count: Option<u32>,
    pub memory_mb: Option<u64>,
    pub ip: Option<String>,
    /// 点分掩码或前缀长度
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub dns: Option<String>,
    pub source_snapshot: Option<String>,
    pub os_user: Option<String>,
    #[serde(skip_serializing)]
    pub os_password: Option<String>,
    pub target_snapshot: Option<String>,
    pub target_snapshot_description: Option<String>,
}

impl std::fmt::Debug for VmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmConfig")
            .field("group", &self.group)
            .field("name", &self.name)
            .field("source_vm", &self.source_vm)
            .field("datastore", &self.datastore)
            .field("network", &self.network)
            .field("cpu_count", &self.cpu_count)
            .field("memory_mb", &self.memory_mb)
            .field("ip", &self.ip)
            .field("os_user", &self.os_user)
            .finish_non_exhaustive()
    }
}

impl VmConfig {
    pub fn new(name: &str) -> Self {
        Self {
            group: UNGROUPED.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// 加载后的舰队定义
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    /// 虚拟机配置（文件顺序）
    pub vms: Vec<VmConfig>,
    /// 组名列表（未分组在最前，其余按首次出现顺序）
    pub groups: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl FleetConfig {
    pub fn from_vms(vms: Vec<VmConfig>) -> Self {
        let mut groups = Vec::new();
        if vms.iter().any(|vm| vm.group == UNGROUPED) {
            groups.push(UNGROUPED.to_string());
        }
        for vm in &vms {
            if !groups.contains(&vm.group) {
                groups.push(vm.group.clone());
            }
        }

        let by_name = vms
            .iter()
            .enumerate()
            .map(|(i, vm)| (vm.name.clone(), i))
            .collect();

        Self {
            vms,
            groups,
            by_name,
        }
    }

    /// 按目标名称查找（重名时后出现的行生效）
    pub fn get(&self, name: &str) -> Option<&VmConfig> {
        self.by_name.get(name).map(|&i| &self.vms[i])
    }

    pub fn in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a VmConfig> + 'a {
        self.vms.iter().filter(move |vm| vm.group == group)
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }
}

/// CSV 原始行
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CsvRow {
    #[serde(rename = "groupName")]
    group_name: String,
    #[serde(rename = "sourceVM")]
    source_vm: String,
    #[serde(rename = "vmName")]
    vm_name: String,
    #[serde(rename = "vmHostname")]
    vm_hostname: String,
    #[serde(rename = "targetDatastore")]
    target_datastore: String,
    #[serde(rename = "adaptersLan")]
    adapters_lan: String,
    #[serde(rename = "cpuCount")]
    cpu_count: String,
    #[serde(rename = "MemoryMB")]
    memory_mb: String,
    ip: String,
    netmask: String,
    #[serde(rename = "ipGateway")]
    ip_gateway: String,
    #[serde(rename = "ipDns")]
    ip_dns: String,
    #[serde(rename = "sourceSnapshotName")]
    source_snapshot_name: String,
    #[serde(rename = "osUserName")]
    os_user_name: String,
    #[serde(rename = "osUserPassword")]
    os_user_password: String,
    #[serde(rename = "targetSnapshotName")]
    target_snapshot_name: String,
    #[serde(rename = "targetSnapshotDescription")]
    target_snapshot_description: String,
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// 凭据原样保留，只把空单元格视为未填写
fn verbatim(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, column: &str, line: u64) -> Result<Option<T>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed.parse::<T>().map(Some).map_err(|_| {
        ExecutorError::ConfigLoadFailed(format!(
            "第 {} 行 {} 不是有效数字: {}",
            line, column, trimmed
        ))
    })
}

impl CsvRow {
    fn into_config(self, line: u64) -> Result<Option<VmConfig>> {
        let Some(name) = non_empty(self.vm_name) else {
            return Ok(None);
        };

        Ok(Some(VmConfig {
            group: non_empty(self.group_name).unwrap_or_else(|| UNGROUPED.to_string()),
            source_vm: non_empty(self.source_vm),
            name,
            hostname: non_empty(self.vm_hostname),
            datastore: non_empty(self.target_datastore),
            network: non_empty(self.adapters_lan),
            cpu_count: parse_number(&self.cpu_count, "cpuCount", line)?,
            memory_mb: parse_number(&self.memory_mb, "MemoryMB", line)?,
            ip: non_empty(self.ip),
            netmask: non_empty(self.netmask),
            gateway: non_empty(self.ip_gateway),
            dns: non_empty(self.ip_dns),
            source_snapshot: non_empty(self.source_snapshot_name),
            os_user: non_empty(self.os_user_name),
            os_password: verbatim(self.os_user_password),
            target_snapshot: non_empty(self.target_snapshot_name),
            target_snapshot_description: non_empty(self.target_snapshot_description),
        }))
    }
}

/// 从任意输入解析舰队定义
pub fn parse_fleet_csv<R: Read>(mut reader: R) -> Result<FleetConfig> {
    let mut content = String::new();
    reader
        .read_to_string(&mut content)
        .map_err(|e| ExecutorError::ConfigLoadFailed(format!("读取 CSV 失败: {}", e)))?;
    let content = content.trim_start_matches('\u{feff}');

    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(content.as_bytes());

    let mut vms = Vec::new();
    for (index, record) in csv_reader.deserialize::<CsvRow>().enumerate() {
        // 表头占第 1 行
        let line = index as u64 + 2;
        let row = record
            .map_err(|e| ExecutorError::ConfigLoadFailed(format!("第 {} 行解析失败: {}", line, e)))?;
        match row.into_config(line)? {
            Some(vm) => vms.push(vm),
            None => debug!("第 {} 行缺少 vmName，已跳过", line),
        }
    }

    Ok(FleetConfig::from_vms(vms))
}

/// 从文件加载舰队定义
pub fn load_fleet_config(path: &Path) -> Result<FleetConfig> {
    let file = std::fs::File::open(path).map_err(|e| {
        ExecutorError::ConfigLoadFailed(format!("无法打开 {}: {}", path.display(), e))
    })?;
    let fleet = parse_fleet_csv(file)?;
    info!(
        "📋 已加载 {} 台虚拟机配置，{} 个分组 ({})",
        fleet.len(),
        fleet.groups.len(),
        path.display()
    );
    Ok(fleet)
}
