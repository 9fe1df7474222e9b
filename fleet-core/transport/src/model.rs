//! 虚拟化对象模型
//!
//! 这里的类型是后端无关的：libvirt 后端与测试用的内存后端都用它们描述
//! 虚拟机、快照树、设备以及各类重配置/克隆请求。

use serde::{Deserialize, Serialize};

// ============================================
// 虚拟机句柄
// ============================================

/// 虚拟机句柄
///
/// 只在当前会话内有效；域被重定义或删除后，基于它的读取会返回
/// [`crate::TransportError::StaleHandle`]，调用方需按名称重新解析。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef {
    /// 虚拟机名称
    pub name: String,
    /// 后端标识（libvirt 下为 UUID）
    pub id: String,
}

impl VmRef {
    pub fn new(name: &str, id: &str) -> Self {
        Self {
            name: name.to_string(),
            id: id.to_string(),
        }
    }
}

impl std::fmt::Display for VmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ============================================
// Guest 信息
// ============================================

/// Guest 操作系统标识
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestIdentity {
    /// 系统标识符（如 "ubuntu64Guest" / "centos"）
    pub guest_id: Option<String>,
    /// 完整名称（如 "Ubuntu 22.04.3 LTS"）
    pub guest_full_name: Option<String>,
}

/// IP 地址状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpAddressState {
    Preferred,
    Deprecated,
    Tentative,
    Unknown,
}

/// 带状态的 IP 地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressInfo {
    pub address: String,
    pub prefix_length: u8,
    pub state: IpAddressState,
}

/// Guest 网卡
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNic {
    /// 网卡名称（Guest 内部视角）
    pub name: Option<String>,
    /// MAC 地址
    pub mac_address: Option<String>,
    /// 新版接口：带状态的地址列表
    pub ip_config: Vec<IpAddressInfo>,
    /// 旧版接口：无状态的地址列表
    pub ip_addresses: Vec<String>,
}

// ============================================
// 快照树
// ============================================

/// 快照标识（在单个虚拟机内唯一）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 快照节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: SnapshotId,
    pub name: String,
    pub description: String,
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: SnapshotId(id.to_string()),
            name: name.to_string(),
            description: String::new(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<SnapshotNode>) -> Self {
        self.children = children;
        self
    }
}

/// 虚拟机的快照树
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTree {
    /// 根快照（按后端返回顺序）
    pub roots: Vec<SnapshotNode>,
    /// 当前快照
    pub current: Option<SnapshotId>,
}

impl SnapshotTree {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// 创建快照请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub name: String,
    pub description: String,
    /// 是否包含内存状态
    pub memory: bool,
    /// 是否静默文件系统
    pub quiesce: bool,
}

// ============================================
// 设备与主机资源
// ============================================

/// 虚拟设备类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// 光驱
    CdRom { connected: bool },
    /// 以太网卡
    Ethernet { network: Option<String> },
    /// 其他设备
    Other,
}

/// 虚拟设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    /// 设备键（在虚拟机内唯一）
    pub key: i32,
    /// 设备标签
    pub label: String,
    pub kind: DeviceKind,
}

impl VirtualDevice {
    pub fn is_cdrom(&self) -> bool {
        matches!(self.kind, DeviceKind::CdRom { .. })
    }

    pub fn is_ethernet(&self) -> bool {
        matches!(self.kind, DeviceKind::Ethernet { .. })
    }
}

/// 数据存储
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datastore {
    pub name: String,
    /// 存储目录（libvirt 存储池的 target path）
    pub path: Option<String>,
}

/// 网络后端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkBacking {
    /// 标准交换机网络
    Standard { network: String },
    /// 分布式交换机端口组
    Distributed {
        switch_uuid: String,
        portgroup_key: String,
    },
}

/// 主机可见的网络
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNetwork {
    pub name: String,
    pub backing: NetworkBacking,
}

/// 资源池
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub name: String,
}

// ============================================
// 重配置 / 克隆请求
// ============================================

/// 设备变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChange {
    /// 修改网卡后端
    EditNetworkBacking {
        device_key: i32,
        backing: NetworkBacking,
        connected: bool,
        start_connected: bool,
    },
    /// 断开光驱介质
    DisconnectCdRom { device_key: i32 },
}

/// 硬件重配置请求
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigSpec {
    pub num_cpus: Option<u32>,
    pub cores_per_socket: Option<u32>,
    pub memory_mb: Option<u64>,
    pub cpu_hot_add: Option<bool>,
    pub memory_hot_add: Option<bool>,
    pub device_changes: Vec<DeviceChange>,
}

impl ReconfigSpec {
    pub fn is_empty(&self) -> bool {
        self.num_cpus.is_none()
            && self.cores_per_socket.is_none()
            && self.memory_mb.is_none()
            && self.cpu_hot_add.is_none()
            && self.memory_hot_add.is_none()
            && self.device_changes.is_empty()
    }
}

/// 迁移规格
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocateSpec {
    pub datastore: Datastore,
    pub pool: ResourcePool,
    /// 复制全部磁盘，不与源共享后端
    pub disallow_disk_sharing: bool,
}

/// 克隆规格
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSpec {
    /// 目标虚拟机名称
    pub name: String,
    pub relocate: RelocateSpec,
    /// 克隆完成后是否开机
    pub power_on: bool,
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
}

// ============================================
// Guest 内命令执行
// ============================================

/// Guest 登录凭据
#[derive(Clone, PartialEq, Eq)]
pub struct GuestAuth {
    pub username: String,
    pub password: String,
}

impl GuestAuth {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl std::fmt::Debug for GuestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Guest 内要启动的程序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestProgram {
    /// 程序绝对路径
    pub path: String,
    /// 参数列表
    pub arguments: Vec<String>,
}

impl GuestProgram {
    pub fn new(path: &str, arguments: Vec<String>) -> Self {
        Self {
            path: path.to_string(),
            arguments,
        }
    }

    /// `/bin/bash -c "<script>"`
    pub fn shell(script: &str) -> Self {
        Self::new("/bin/bash", vec!["-c".to_string(), script.to_string()])
    }

    /// PowerShell 脚本（Windows）
    pub fn powershell(script: &str) -> Self {
        Self::new(
            "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe",
            vec![
                "-NoProfile".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-Command".to_string(),
                script.to_string(),
            ],
        )
    }
}
