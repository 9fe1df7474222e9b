//! 测试用内存虚拟化后端

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_executor::{ExecutorSettings, Pinger};
use fleet_transport::{
    CloneSpec, Datastore, DeviceChange, GuestAuth, GuestIdentity, GuestNic, GuestProgram,
    HostNetwork, Hypervisor, IpAddressInfo, IpAddressState, NetworkBacking, PowerState,
    ReconfigSpec, ResourcePool, Result, SnapshotId, SnapshotNode, SnapshotRequest, SnapshotTree,
    Task, TaskFault, TaskInfo, TaskState, ToolsStatus, TransportError, VirtualDevice, VmRef,
};
use tokio::time::Instant;

// ============================================
// 任务
// ============================================

/// 按脚本依次返回状态，最后一个状态保持不变
pub struct ScriptedTask {
    states: Mutex<VecDeque<TaskInfo>>,
}

impl ScriptedTask {
    pub fn new(states: Vec<TaskInfo>) -> Self {
        Self {
            states: Mutex::new(states.into()),
        }
    }

    pub fn succeeded(result: Option<VmRef>) -> Box<dyn Task> {
        Box::new(Self::new(vec![TaskInfo {
            state: TaskState::Success,
            result,
            ..TaskInfo::queued()
        }]))
    }

    pub fn failed(message: &str) -> Box<dyn Task> {
        Box::new(Self::new(vec![TaskInfo {
            state: TaskState::Error,
            error: Some(TaskFault::new(message)),
            ..TaskInfo::queued()
        }]))
    }
}

impl Task for ScriptedTask {
    fn info(&self) -> TaskInfo {
        let mut states = self.states.lock().unwrap();
        if states.len() > 1 {
            states.pop_front().unwrap()
        } else {
            states[0].clone()
        }
    }
}

// ============================================
// 虚拟机
// ============================================

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub id: String,
    pub power: PowerState,
    /// Guest Agent 在此时刻之后运行（None 表示开机即运行）
    pub tools_ready_at: Option<Instant>,
    pub tools_installed: bool,
    /// Guest 在此时刻之后报告 IP（None 表示从不）
    pub ip_ready_at: Option<Instant>,
    pub ip: String,
    pub identity: GuestIdentity,
    pub snapshots: SnapshotTree,
    pub devices: Vec<VirtualDevice>,
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub network: Option<NetworkBacking>,
    /// 是否响应 Guest 关机请求
    pub honors_shutdown: bool,
}

impl FakeVm {
    pub fn new(id: &str, power: PowerState) -> Self {
        Self {
            id: id.to_string(),
            power,
            tools_ready_at: None,
            tools_installed: true,
            ip_ready_at: Some(Instant::now()),
            ip: "10.0.0.50".to_string(),
            identity: GuestIdentity::default(),
            snapshots: SnapshotTree::default(),
            devices: vec![
                VirtualDevice {
                    key: 3000,
                    label: "CD/DVD drive 1".to_string(),
                    kind: fleet_transport::DeviceKind::CdRom { connected: true },
                },
                VirtualDevice {
                    key: 4000,
                    label: "Network adapter 1".to_string(),
                    kind: fleet_transport::DeviceKind::Ethernet { network: None },
                },
            ],
            num_cpus: Some(2),
            memory_mb: Some(2048),
            network: None,
            honors_shutdown: true,
        }
    }

    pub fn with_os(mut self, guest_id: &str, full_name: &str) -> Self {
        self.identity = GuestIdentity {
            guest_id: Some(guest_id.to_string()),
            guest_full_name: Some(full_name.to_string()),
        };
        self
    }

    pub fn with_snapshots(mut self, tree: SnapshotTree) -> Self {
        self.snapshots = tree;
        self
    }

    pub fn ignoring_shutdown(mut self) -> Self {
        self.honors_shutdown = false;
        self
    }

    pub fn without_tools(mut self) -> Self {
        self.tools_installed = false;
        self
    }

    fn tools_running(&self) -> bool {
        self.tools_installed
            && self.power.is_on()
            && self.tools_ready_at.map_or(true, |at| Instant::now() >= at)
    }
}

// ============================================
// 后端
// ============================================

#[derive(Default)]
pub struct FakeState {
    pub vms: HashMap<String, FakeVm>,
    pub datastores: Vec<Datastore>,
    pub networks: Vec<HostNetwork>,
    /// 动作调用日志，如 `power_on:web-01`
    pub calls: Vec<String>,
    pub disconnects: usize,
    pub fail_snapshot: bool,
    pub fail_force_off: bool,
    pub fail_reconfigure: bool,
    /// 读取 Guest Agent 状态时报错
    pub fail_tools_status: bool,
    /// 克隆任务依次报告的进度
    pub clone_progress: Vec<Option<u8>>,
    pub programs: Vec<(String, GuestProgram)>,
    /// 按程序内容匹配的退出码，未匹配返回 0
    pub exit_codes: Vec<(String, i32)>,
    pub next_pid: i64,
    pids: HashMap<i64, i32>,
    next_snapshot: usize,
}

#[derive(Default, Clone)]
pub struct FakeHypervisor {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock().unwrap();
            state.datastores = vec![Datastore {
                name: "fast-ssd".to_string(),
                path: Some("/var/lib/libvirt/fast".to_string()),
            }];
            state.networks = vec![HostNetwork {
                name: "prod".to_string(),
                backing: NetworkBacking::Standard {
                    network: "prod".to_string(),
                },
            }];
            state.next_pid = 100;
        }
        fake
    }

    pub fn with_vm(self, name: &str, vm: FakeVm) -> Self {
        self.state.lock().unwrap().vms.insert(name.to_string(), vm);
        self
    }

    pub fn vm(&self, name: &str) -> Option<FakeVm> {
        self.state.lock().unwrap().vms.get(name).cloned()
    }

    pub fn power(&self, name: &str) -> PowerState {
        self.vm(name).map(|vm| vm.power).unwrap_or(PowerState::PoweredOff)
    }

    pub fn update(&self, name: &str, f: impl FnOnce(&mut FakeVm)) {
        if let Some(vm) = self.state.lock().unwrap().vms.get_mut(name) {
            f(vm);
        }
    }

    pub fn set(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    pub fn programs(&self) -> Vec<(String, GuestProgram)> {
        self.state.lock().unwrap().programs.clone()
    }

    /// 重新注册虚拟机，旧句柄失效
    pub fn reregister(&self, name: &str) {
        self.update(name, |vm| vm.id = format!("{}-r", vm.id));
    }

    fn with_live_vm<T>(&self, vm: &VmRef, f: impl FnOnce(&mut FakeVm) -> T) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        match state.vms.get_mut(&vm.name) {
            Some(found) if found.id == vm.id => Ok(f(found)),
            _ => Err(TransportError::StaleHandle(vm.name.clone())),
        }
    }

    fn record(&self, call: &str, vm: &VmRef) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("{}:{}", call, vm.name));
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn find_vm(&self, name: &str) -> Result<Option<VmRef>> {
        let state = self.state.lock().unwrap();
        Ok(state.vms.get(name).map(|vm| VmRef::new(name, &vm.id)))
    }

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState> {
        self.with_live_vm(vm, |v| v.power)
    }

    async fn tools_status(&self, vm: &VmRef) -> Result<ToolsStatus> {
        if self.state.lock().unwrap().fail_tools_status {
            return Err(TransportError::LibvirtError("guest agent timed out".to_string()));
        }
        self.with_live_vm(vm, |v| {
            if !v.tools_installed {
                ToolsStatus::NotInstalled
            } else if v.tools_running() {
                ToolsStatus::Running
            } else {
                ToolsStatus::NotRunning
            }
        })
    }

    async fn guest_identity(&self, vm: &VmRef) -> Result<GuestIdentity> {
        self.with_live_vm(vm, |v| v.identity.clone())
    }

    async fn guest_nics(&self, vm: &VmRef) -> Result<Vec<GuestNic>> {
        self.with_live_vm(vm, |v| {
            let has_ip = v.tools_running() && v.ip_ready_at.map_or(false, |at| Instant::now() >= at);
            if !has_ip {
                return vec![GuestNic::default()];
            }
            vec![GuestNic {
                name: Some("ens33".to_string()),
                ip_config: vec![IpAddressInfo {
                    address: v.ip.clone(),
                    prefix_length: 24,
                    state: IpAddressState::Preferred,
                }],
                ..GuestNic::default()
            }]
        })
    }

    async fn snapshot_tree(&self, vm: &VmRef) -> Result<SnapshotTree> {
        self.with_live_vm(vm, |v| v.snapshots.clone())
    }

    async fn devices(&self, vm: &VmRef) -> Result<Vec<VirtualDevice>> {
        self.with_live_vm(vm, |v| v.devices.clone())
    }

    async fn host_datastores(&self, vm: &VmRef) -> Result<Vec<Datastore>> {
        self.with_live_vm(vm, |_| ())?;
        Ok(self.state.lock().unwrap().datastores.clone())
    }

    async fn host_networks(&self, vm: &VmRef) -> Result<Vec<HostNetwork>> {
        self.with_live_vm(vm, |_| ())?;
        Ok(self.state.lock().unwrap().networks.clone())
    }

    async fn host_resource_pool(&self, _vm: &VmRef) -> Result<ResourcePool> {
        Ok(ResourcePool {
            name: "default".to_string(),
        })
    }

    async fn power_on(&self, vm: &VmRef) -> Result<Box<dyn Task>> {
        self.record("power_on", vm);
        self.with_live_vm(vm, |v| v.power = PowerState::PoweredOn)?;
        Ok(ScriptedTask::succeeded(None))
    }

    async fn power_off(&self, vm: &VmRef) -> Result<Box<dyn Task>> {
        self.record("power_off", vm);
        if self.state.lock().unwrap().fail_force_off {
            return Ok(ScriptedTask::failed("domain is locked"));
        }
        self.with_live_vm(vm, |v| v.power = PowerState::PoweredOff)?;
        Ok(ScriptedTask::succeeded(None))
    }

    async fn create_snapshot(&self, vm: &VmRef, request: &SnapshotRequest) -> Result<Box<dyn Task>> {
        self.record("create_snapshot", vm);
        let mut state = self.state.lock().unwrap();
        if state.fail_snapshot {
            return Ok(ScriptedTask::failed("insufficient space"));
        }
        state.next_snapshot += 1;
        let id = format!("snap-{}", state.next_snapshot);
        let target = state
            .vms
            .get_mut(&vm.name)
            .filter(|v| v.id == vm.id)
            .ok_or_else(|| TransportError::StaleHandle(vm.name.clone()))?;
        target.snapshots.roots.push(SnapshotNode::new(&id, &request.name));
        target.snapshots.current = Some(SnapshotId(id));
        Ok(ScriptedTask::succeeded(None))
    }

    async fn revert_to_snapshot(&self, vm: &VmRef, snapshot: &SnapshotId) -> Result<Box<dyn Task>> {
        self.record("revert", vm);
        // 无内存快照回滚后处于关机状态
        self.with_live_vm(vm, |v| {
            v.snapshots.current = Some(snapshot.clone());
            v.power = PowerState::PoweredOff;
        })?;
        Ok(ScriptedTask::succeeded(None))
    }

    async fn reconfigure(&self, vm: &VmRef, spec: &ReconfigSpec) -> Result<Box<dyn Task>> {
        self.record("reconfigure", vm);
        if self.state.lock().unwrap().fail_reconfigure {
            return Ok(ScriptedTask::failed("invalid configuration"));
        }
        self.with_live_vm(vm, |v| {
            if spec.num_cpus.is_some() {
                v.num_cpus = spec.num_cpus;
            }
            if spec.memory_mb.is_some() {
                v.memory_mb = spec.memory_mb;
            }
            for change in &spec.device_changes {
                match change {
                    DeviceChange::EditNetworkBacking { backing, .. } => {
                        v.network = Some(backing.clone());
                    }
                    DeviceChange::DisconnectCdRom { device_key } => {
                        for dev in v.devices.iter_mut().filter(|d| d.key == *device_key) {
                            dev.kind = fleet_transport::DeviceKind::CdRom { connected: false };
                        }
                    }
                }
            }
        })?;
        Ok(ScriptedTask::succeeded(None))
    }

    async fn clone_vm(&self, source: &VmRef, spec: &CloneSpec) -> Result<Box<dyn Task>> {
        self.record("clone", source);
        let mut state = self.state.lock().unwrap();
        let template = state
            .vms
            .get(&source.name)
            .filter(|v| v.id == source.id)
            .cloned()
            .ok_or_else(|| TransportError::StaleHandle(source.name.clone()))?;

        let id = format!("{}-id", spec.name);
        let mut cloned = FakeVm::new(&id, PowerState::PoweredOff);
        cloned.identity = template.identity;
        cloned.devices = template.devices;
        cloned.num_cpus = spec.num_cpus.or(template.num_cpus);
        cloned.memory_mb = spec.memory_mb.or(template.memory_mb);
        if spec.power_on {
            cloned.power = PowerState::PoweredOn;
        }
        state.vms.insert(spec.name.clone(), cloned);

        let mut script: Vec<TaskInfo> = state
            .clone_progress
            .iter()
            .map(|p| TaskInfo {
                state: TaskState::Running,
                progress: *p,
                ..TaskInfo::queued()
            })
            .collect();
        script.push(TaskInfo {
            state: TaskState::Success,
            result: Some(VmRef::new(&spec.name, &id)),
            ..TaskInfo::queued()
        });
        Ok(Box::new(ScriptedTask::new(script)))
    }

    async fn destroy(&self, vm: &VmRef) -> Result<Box<dyn Task>> {
        self.record("destroy", vm);
        self.with_live_vm(vm, |_| ())?;
        self.state.lock().unwrap().vms.remove(&vm.name);
        Ok(ScriptedTask::succeeded(None))
    }

    async fn shutdown_guest(&self, vm: &VmRef) -> Result<()> {
        self.record("shutdown_guest", vm);
        self.with_live_vm(vm, |v| {
            if v.honors_shutdown {
                v.power = PowerState::PoweredOff;
            }
        })
    }

    async fn start_program_in_guest(
        &self,
        vm: &VmRef,
        _auth: &GuestAuth,
        program: &GuestProgram,
    ) -> Result<i64> {
        self.with_live_vm(vm, |_| ())?;
        let mut state = self.state.lock().unwrap();
        let script = program.arguments.join(" ");
        let code = state
            .exit_codes
            .iter()
            .find(|(needle, _)| script.contains(needle.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);

        state.next_pid += 1;
        let pid = state.next_pid;
        state.pids.insert(pid, code);
        state.programs.push((vm.name.clone(), program.clone()));
        Ok(pid)
    }

    async fn guest_process_exit_code(
        &self,
        _vm: &VmRef,
        _auth: &GuestAuth,
        pid: i64,
    ) -> Result<Option<i32>> {
        Ok(self.state.lock().unwrap().pids.get(&pid).copied())
    }

    async fn disconnect(&self) {
        self.state.lock().unwrap().disconnects += 1;
    }
}

// ============================================
// Ping
// ============================================

/// 固定结果的 ping
pub struct FakePinger {
    pub reachable: bool,
}

#[async_trait]
impl Pinger for FakePinger {
    async fn ping(&self, _address: &str, _timeout: Duration) -> bool {
        self.reachable
    }
}

pub fn reachable() -> Arc<FakePinger> {
    Arc::new(FakePinger { reachable: true })
}

pub fn settings() -> ExecutorSettings {
    ExecutorSettings::default()
}

pub fn on(id: &str) -> FakeVm {
    FakeVm::new(id, PowerState::PoweredOn)
}

pub fn off(id: &str) -> FakeVm {
    FakeVm::new(id, PowerState::PoweredOff)
}
