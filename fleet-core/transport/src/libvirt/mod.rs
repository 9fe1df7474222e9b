//! libvirt 后端
//!
//! 域操作走 virt 绑定（放在阻塞线程池中执行），Guest 状态走 QGA，
//! 快照 / 存储池 / 网络 / 克隆走 virsh 与 virt-clone。

pub mod virsh;
pub mod xml;

use async_trait::async_trait;
use tracing::{debug, info};
use virt::connect::Connect;
use virt::domain::Domain;

use crate::connection::HostConnection;
use crate::qga::{interfaces_to_nics, GuestExecCommand, QgaClient};
use crate::task::BackgroundTask;
use crate::{
    CloneSpec, Datastore, DeviceChange, GuestAuth, GuestIdentity, GuestNic, GuestProgram,
    HostNetwork, Hypervisor, NetworkBacking, PowerState, ReconfigSpec, ResourcePool, Result,
    SnapshotId, SnapshotRequest, SnapshotTree, Task, ToolsStatus, TransportError, VirtualDevice,
    VmRef,
};

use virsh::{build_snapshot_tree, Virsh};

/// VIR_DOMAIN_XML_INACTIVE
const XML_INACTIVE: u32 = 2;

/// libvirt 会话
pub struct LibvirtSession {
    connection: HostConnection,
    virsh: Virsh,
    agent_timeout: i32,
}

impl LibvirtSession {
    pub fn new(connection: HostConnection) -> Self {
        let virsh = Virsh::new(&connection.config().libvirt_uri());
        let agent_timeout = connection.config().agent_timeout;
        Self {
            connection,
            virsh,
            agent_timeout,
        }
    }

    /// 在阻塞线程中对域执行操作
    async fn with_domain<T, F>(&self, vm: &VmRef, f: F) -> Result<T>
    where
        F: FnOnce(&Connect, &Domain) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connection.get_connection().await?;
        on_domain(conn, vm.clone(), f).await
    }

    fn virsh_error(vm: &VmRef, e: TransportError) -> TransportError {
        match e {
            TransportError::CommandFailed(msg) if msg.contains("failed to get domain") => {
                TransportError::StaleHandle(vm.name.clone())
            }
            other => other,
        }
    }
}

async fn on_domain<T, F>(conn: Connect, vm: VmRef, f: F) -> Result<T>
where
    F: FnOnce(&Connect, &Domain) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let domain = Domain::lookup_by_uuid_string(&conn, &vm.id)
            .map_err(|_| TransportError::StaleHandle(vm.name.clone()))?;
        f(&conn, &domain)
    })
    .await
    .map_err(|e| TransportError::LibvirtError(format!("阻塞任务失败: {}", e)))?
}

fn libvirt_err(e: virt::error::Error) -> TransportError {
    TransportError::LibvirtError(e.to_string())
}

fn is_running(domain: &Domain) -> Result<bool> {
    let (state, _) = domain.get_state().map_err(libvirt_err)?;
    Ok(PowerState::from_virt_state(state).is_on())
}

/// 把一次重配置请求应用到域 XML 上
fn apply_reconfig(desc: &str, spec: &ReconfigSpec) -> Result<String> {
    let mut desc = desc.to_string();

    if let Some(cpus) = spec.num_cpus {
        desc = xml::set_vcpu(&desc, cpus)?;
    }
    // 已有 <topology> 时核数必须与 vCPU 数一致，否则 define 会被拒绝
    let cores = spec
        .cores_per_socket
        .or_else(|| spec.num_cpus.filter(|_| desc.contains("<topology")));
    if let Some(cores) = cores {
        desc = xml::set_topology(&desc, cores)?;
    }
    if let Some(memory_mb) = spec.memory_mb {
        desc = xml::set_memory(&desc, memory_mb)?;
    }
    if spec.cpu_hot_add.is_some() || spec.memory_hot_add.is_some() {
        debug!("libvirt 无 CPU/内存热添加开关，忽略");
    }

    for change in &spec.device_changes {
        match change {
            DeviceChange::EditNetworkBacking {
                device_key,
                backing,
                ..
            } => {
                let index = (device_key - xml::ETHERNET_KEY_BASE).max(0) as usize;
                desc = xml::set_interface_backing(&desc, index, backing)?;
            }
            DeviceChange::DisconnectCdRom { device_key } => {
                let index = (device_key - xml::CDROM_KEY_BASE).max(0) as usize;
                desc = xml::eject_cdrom(&desc, index)?;
            }
        }
    }

    Ok(desc)
}

#[async_trait]
impl Hypervisor for LibvirtSession {
    async fn find_vm(&self, name: &str) -> Result<Option<VmRef>> {
        let conn = self.connection.get_connection().await?;
        let name = name.to_string();

        tokio::task::spawn_blocking(move || match Domain::lookup_by_name(&conn, &name) {
            Ok(domain) => {
                let uuid = domain.get_uuid_string().map_err(libvirt_err)?;
                Ok(Some(VmRef::new(&name, &uuid)))
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("not found") || msg.contains("no domain") {
                    Ok(None)
                } else {
                    Err(TransportError::LibvirtError(msg))
                }
            }
        })
        .await
        .map_err(|e| TransportError::LibvirtError(format!("阻塞任务失败: {}", e)))?
    }

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState> {
        self.with_domain(vm, |_, domain| {
            let (state, _) = domain.get_state().map_err(libvirt_err)?;
            Ok(PowerState::from_virt_state(state))
        })
        .await
    }

    async fn tools_status(&self, vm: &VmRef) -> Result<ToolsStatus> {
        let timeout = self.agent_timeout;
        self.with_domain(vm, move |_, domain| {
            if !is_running(domain)? {
                return Ok(ToolsStatus::NotRunning);
            }
            match QgaClient::new(domain).with_timeout(timeout).ping() {
                Ok(()) => Ok(ToolsStatus::Running),
                Err(e) => {
                    debug!("QGA 未就绪: {}", e);
                    Ok(ToolsStatus::NotRunning)
                }
            }
        })
        .await
    }

    async fn guest_identity(&self, vm: &VmRef) -> Result<GuestIdentity> {
        let timeout = self.agent_timeout;
        self.with_domain(vm, move |_, domain| {
            let desc = domain.get_xml_desc(0).map_err(libvirt_err)?;
            let guest_id = xml::libosinfo_id(&desc)?;
            // libosinfo 的 Windows 标识形如 http://microsoft.com/win/10
            let guest_full_name = guest_id
                .as_deref()
                .filter(|id| id.contains("microsoft.com/win"))
                .map(|_| "Microsoft Windows".to_string());
            let mut identity = GuestIdentity {
                guest_id,
                guest_full_name,
            };

            if is_running(domain)? {
                if let Ok(info) = QgaClient::new(domain).with_timeout(timeout).get_osinfo() {
                    let from_agent = info.into_identity();
                    identity.guest_id = identity.guest_id.or(from_agent.guest_id);
                    identity.guest_full_name =
                        from_agent.guest_full_name.or(identity.guest_full_name);
                }
            }
            Ok(identity)
        })
        .await
    }

    async fn guest_nics(&self, vm: &VmRef) -> Result<Vec<GuestNic>> {
        let timeout = self.agent_timeout;
        self.with_domain(vm, move |_, domain| {
            if !is_running(domain)? {
                return Ok(Vec::new());
            }
            match QgaClient::new(domain)
                .with_timeout(timeout)
                .network_interfaces()
            {
                Ok(interfaces) => Ok(interfaces_to_nics(interfaces)),
                Err(TransportError::ToolsUnavailable) => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn snapshot_tree(&self, vm: &VmRef) -> Result<SnapshotTree> {
        let entries = self
            .virsh
            .snapshot_entries(&vm.name)
            .await
            .map_err(|e| Self::virsh_error(vm, e))?;
        let current = self
            .virsh
            .current_snapshot(&vm.name)
            .await
            .map_err(|e| Self::virsh_error(vm, e))?;

        Ok(SnapshotTree {
            roots: build_snapshot_tree(&entries),
            current: current.map(SnapshotId),
        })
    }

    async fn devices(&self, vm: &VmRef) -> Result<Vec<VirtualDevice>> {
        self.with_domain(vm, |_, domain| {
            let desc = domain.get_xml_desc(XML_INACTIVE).map_err(libvirt_err)?;
            xml::parse_devices(&desc)
        })
        .await
    }

    async fn host_datastores(&self, _vm: &VmRef) -> Result<Vec<Datastore>> {
        let mut datastores = Vec::new();
        for name in self.virsh.list_pools().await? {
            let pool_xml = self.virsh.run(&["pool-dumpxml", name.as_str()]).await?;
            datastores.push(Datastore {
                path: xml::pool_target_path(&pool_xml)?,
                name,
            });
        }
        Ok(datastores)
    }

    async fn host_networks(&self, _vm: &VmRef) -> Result<Vec<HostNetwork>> {
        Ok(self
            .virsh
            .list_networks()
            .await?
            .into_iter()
            .map(|name| HostNetwork {
                backing: NetworkBacking::Standard {
                    network: name.clone(),
                },
                name,
            })
            .collect())
    }

    async fn host_resource_pool(&self, _vm: &VmRef) -> Result<ResourcePool> {
        Ok(ResourcePool {
            name: "default".to_string(),
        })
    }

    async fn power_on(&self, vm: &VmRef) -> Result<Box<dyn Task>> {
        let conn = self.connection.get_connection().await?;
        let vm = vm.clone();
        Ok(Box::new(BackgroundTask::spawn("power on", move |_| async move {
            on_domain(conn, vm, |_, domain| {
                domain.create().map_err(libvirt_err)?;
                Ok(None)
            })
            .await
        })))
    }

    async fn power_off(&self, vm: &VmRef) -> Result<Box<dyn Task>> {
        let conn = self.connection.get_connection().await?;
        let vm = vm.clone();
        Ok(Box::new(BackgroundTask::spawn("power off", move |_| async move {
            on_domain(conn, vm, |_, domain| {
                domain.destroy().map_err(libvirt_err)?;
                Ok(None)
            })
            .await
        })))
    }

    async fn create_snapshot(
        &self,
        vm: &VmRef,
        request: &SnapshotRequest,
    ) -> Result<Box<dyn Task>> {
        let virsh = self.virsh.clone();
        let domain = vm.name.clone();
        let request = request.clone();

        Ok(Box::new(BackgroundTask::spawn("create snapshot", move |_| async move {
            let mut args = vec![
                "snapshot-create-as",
                domain.as_str(),
                "--name",
                request.name.as_str(),
                "--description",
                request.description.as_str(),
                "--atomic",
            ];
            if request.quiesce {
                args.push("--disk-only");
                args.push("--quiesce");
            } else if request.memory {
                args.push("--live");
            }
            virsh.run(&args).await?;
            Ok(None)
        })))
    }

    async fn revert_to_snapshot(
        &self,
        vm: &VmRef,
        snapshot: &SnapshotId,
    ) -> Result<Box<dyn Task>> {
        let virsh = self.virsh.clone();
        let domain = vm.name.clone();
        let snapshot = snapshot.0.clone();

        Ok(Box::new(BackgroundTask::spawn("revert snapshot", move |_| async move {
            virsh
                .run(&[
                    "snapshot-revert",
                    domain.as_str(),
                    "--snapshotname",
                    snapshot.as_str(),
                ])
                .await?;
            Ok(None)
        })))
    }

    async fn reconfigure(&self, vm: &VmRef, spec: &ReconfigSpec) -> Result<Box<dyn Task>> {
        let conn = self.connection.get_connection().await?;
        let vm = vm.clone();
        let spec = spec.clone();

        Ok(Box::new(BackgroundTask::spawn("reconfigure", move |_| async move {
            on_domain(conn, vm, move |conn, domain| {
                let desc = domain.get_xml_desc(XML_INACTIVE).map_err(libvirt_err)?;
                let updated = apply_reconfig(&desc, &spec)?;
                Domain::define_xml(conn, &updated).map_err(libvirt_err)?;
                Ok(None)
            })
            .await
        })))
    }

    async fn clone_vm(&self, source: &VmRef, spec: &CloneSpec) -> Result<Box<dyn Task>> {
        let conn = self.connection.get_connection().await?;
        let virsh = self.virsh.clone();
        let source = source.clone();
        let spec = spec.clone();

        let Some(pool_path) = spec.relocate.datastore.path.clone() else {
            return Err(TransportError::ConfigError(format!(
                "数据存储 {} 没有目标目录",
                spec.relocate.datastore.name
            )));
        };

        Ok(Box::new(BackgroundTask::spawn("clone", move |progress| async move {
            let disks = on_domain(conn.clone(), source.clone(), |_, domain| {
                let desc = domain.get_xml_desc(XML_INACTIVE).map_err(libvirt_err)?;
                xml::count_disks(&desc)
            })
            .await?;

            let files: Vec<String> = (0..disks)
                .map(|i| match i {
                    0 => format!("{}/{}.qcow2", pool_path, spec.name),
                    n => format!("{}/{}-{}.qcow2", pool_path, spec.name, n),
                })
                .collect();

            progress.set(5);
            virsh.virt_clone(&source.name, &spec.name, &files).await?;
            progress.set(90);

            let name = spec.name.clone();
            let overrides = ReconfigSpec {
                num_cpus: spec.num_cpus,
                cores_per_socket: spec.num_cpus,
                memory_mb: spec.memory_mb,
                ..ReconfigSpec::default()
            };
            let power_on = spec.power_on;

            let created = tokio::task::spawn_blocking(move || {
                let domain = Domain::lookup_by_name(&conn, &name).map_err(libvirt_err)?;
                if !overrides.is_empty() {
                    let desc = domain.get_xml_desc(XML_INACTIVE).map_err(libvirt_err)?;
                    let updated = apply_reconfig(&desc, &overrides)?;
                    Domain::define_xml(&conn, &updated).map_err(libvirt_err)?;
                }
                if power_on {
                    domain.create().map_err(libvirt_err)?;
                }
                let uuid = domain.get_uuid_string().map_err(libvirt_err)?;
                Ok::<_, TransportError>(VmRef::new(&name, &uuid))
            })
            .await
            .map_err(|e| TransportError::LibvirtError(format!("阻塞任务失败: {}", e)))??;

            info!("克隆完成: {} -> {}", source.name, created.name);
            Ok(Some(created))
        })))
    }

    async fn destroy(&self, vm: &VmRef) -> Result<Box<dyn Task>> {
        let virsh = self.virsh.clone();
        let domain = vm.name.clone();

        Ok(Box::new(BackgroundTask::spawn("destroy", move |_| async move {
            virsh
                .run(&[
                    "undefine",
                    domain.as_str(),
                    "--remove-all-storage",
                    "--snapshots-metadata",
                ])
                .await?;
            Ok(None)
        })))
    }

    async fn shutdown_guest(&self, vm: &VmRef) -> Result<()> {
        self.with_domain(vm, |_, domain| {
            domain.shutdown().map_err(libvirt_err)?;
            Ok(())
        })
        .await
    }

    async fn start_program_in_guest(
        &self,
        vm: &VmRef,
        auth: &GuestAuth,
        program: &GuestProgram,
    ) -> Result<i64> {
        // QGA 以 agent 自身的身份执行命令，凭据只用于日志
        debug!("以 {} 身份在 {} 中执行 {}", auth.username, vm.name, program.path);

        let timeout = self.agent_timeout;
        let cmd = GuestExecCommand {
            path: program.path.clone(),
            arg: program.arguments.clone(),
            capture_output: false,
        };
        self.with_domain(vm, move |_, domain| {
            QgaClient::new(domain).with_timeout(timeout).exec(cmd)
        })
        .await
    }

    async fn guest_process_exit_code(
        &self,
        vm: &VmRef,
        _auth: &GuestAuth,
        pid: i64,
    ) -> Result<Option<i32>> {
        let timeout = self.agent_timeout;
        self.with_domain(vm, move |_, domain| {
            let status = QgaClient::new(domain).with_timeout(timeout).exec_status(pid)?;
            if !status.exited {
                return Ok(None);
            }
            Ok(Some(
                status
                    .exit_code
                    .or(status.signal.map(|s| 128 + s))
                    .unwrap_or(0),
            ))
        })
        .await
    }

    async fn disconnect(&self) {
        self.connection.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "<domain><memory unit='KiB'>1048576</memory>\
        <vcpu placement='static'>1</vcpu>\
        <devices><disk type='file' device='cdrom'><source file='/iso/a.iso'/></disk>\
        <interface type='bridge'><source bridge='br0'/></interface></devices></domain>";

    #[test]
    fn test_apply_reconfig_full_request() {
        let spec = ReconfigSpec {
            num_cpus: Some(4),
            cores_per_socket: Some(4),
            memory_mb: Some(8192),
            cpu_hot_add: Some(true),
            memory_hot_add: Some(true),
            device_changes: vec![
                DeviceChange::EditNetworkBacking {
                    device_key: xml::ETHERNET_KEY_BASE,
                    backing: NetworkBacking::Standard {
                        network: "lan".to_string(),
                    },
                    connected: true,
                    start_connected: true,
                },
                DeviceChange::DisconnectCdRom {
                    device_key: xml::CDROM_KEY_BASE,
                },
            ],
        };

        let out = apply_reconfig(DOMAIN, &spec).unwrap();
        assert!(out.contains("<vcpu placement='static'>4</vcpu>"));
        assert!(out.contains("cores='4'"));
        assert!(out.contains("<memory unit='KiB'>8388608</memory>"));
        assert!(out.contains("<source network='lan'/>"));
        assert!(!out.contains("a.iso"));
    }

    #[test]
    fn test_cpu_override_rewrites_existing_topology() {
        let domain = "<domain><memory unit='KiB'>1048576</memory>\
            <vcpu placement='static'>2</vcpu>\
            <cpu mode='host-passthrough'><topology sockets='1' dies='1' cores='2' threads='1'/></cpu>\
            </domain>";
        let spec = ReconfigSpec {
            num_cpus: Some(4),
            ..ReconfigSpec::default()
        };

        let out = apply_reconfig(domain, &spec).unwrap();
        assert!(out.contains("<vcpu placement='static'>4</vcpu>"));
        assert!(out.contains("cores='4'"));
        assert!(!out.contains("cores='2'"));
    }

    #[test]
    fn test_cpu_override_without_topology_adds_none() {
        let spec = ReconfigSpec {
            num_cpus: Some(2),
            ..ReconfigSpec::default()
        };
        let out = apply_reconfig(DOMAIN, &spec).unwrap();
        assert!(!out.contains("<topology"));
    }

    #[test]
    fn test_apply_empty_reconfig_is_identity() {
        assert_eq!(apply_reconfig(DOMAIN, &ReconfigSpec::default()).unwrap(), DOMAIN);
    }
}
