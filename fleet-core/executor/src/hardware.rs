//! 硬件重配置

use fleet_transport::{DeviceChange, HostNetwork, ReconfigSpec, VirtualDevice, VmRef};
use tracing::info;

use crate::power::power_off_checked;
use crate::snapshot::restore_power;
use crate::task_waiter::wait_for_task;
use crate::{BatchContext, ExecutorError, Result};

/// 构建重配置请求
///
/// 单插槽拓扑：每插槽核数等于 CPU 数。CPU/内存热插拔总是打开。
pub fn build_reconfig_spec(
    cpu_count: Option<u32>,
    memory_mb: Option<u64>,
    network: Option<(&HostNetwork, &VirtualDevice)>,
) -> ReconfigSpec {
    let mut spec = ReconfigSpec {
        num_cpus: cpu_count,
        cores_per_socket: cpu_count,
        memory_mb,
        cpu_hot_add: Some(true),
        memory_hot_add: Some(true),
        device_changes: Vec::new(),
    };

    if let Some((net, nic)) = network {
        spec.device_changes.push(DeviceChange::EditNetworkBacking {
            device_key: nic.key,
            backing: net.backing.clone(),
            connected: true,
            start_connected: true,
        });
    }

    spec
}

/// 修改 CPU、内存与网络，完成后恢复原电源状态
pub async fn reconfigure(
    ctx: &BatchContext,
    vm: &VmRef,
    cpu_count: Option<u32>,
    memory_mb: Option<u64>,
    network: Option<&str>,
) -> Result<()> {
    let session = ctx.session();

    let backing = match network {
        Some(name) => Some(resolve_network(ctx, vm, name).await?),
        None => None,
    };

    let was_on = session.power_state(vm).await?.is_on();
    if was_on {
        power_off_checked(ctx, vm).await?;
    }

    let spec = build_reconfig_spec(
        cpu_count,
        memory_mb,
        backing.as_ref().map(|(net, nic)| (net, nic)),
    );

    info!(
        "🔧 重配置 {}: CPU={:?}, 内存={:?}MB, 网络={:?}",
        vm.name, cpu_count, memory_mb, network
    );
    let applied = async {
        let task = session.reconfigure(vm, &spec).await?;
        wait_for_task(task.as_ref(), "重配置虚拟机", &ctx.settings).await
    }
    .await;

    let restored = restore_power(ctx, vm, was_on).await;
    applied?;
    restored?;

    info!("✅ 虚拟机 {} 重配置完成", vm.name);
    Ok(())
}

/// 在主机可见网络中查找目标网络，并取第一块网卡
async fn resolve_network(
    ctx: &BatchContext,
    vm: &VmRef,
    name: &str,
) -> Result<(HostNetwork, VirtualDevice)> {
    let networks = ctx.session().host_networks(vm).await?;
    let net = networks
        .into_iter()
        .find(|n| n.name == name)
        .ok_or_else(|| ExecutorError::operation_failed("查找网络", format!("网络 {} 不存在", name)))?;

    let nic = ctx
        .session()
        .devices(vm)
        .await?
        .into_iter()
        .find(VirtualDevice::is_ethernet)
        .ok_or_else(|| {
            ExecutorError::operation_failed("查找网卡", format!("虚拟机 {} 没有网卡", vm.name))
        })?;

    Ok((net, nic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_transport::{DeviceKind, NetworkBacking};

    #[test]
    fn test_single_socket_topology() {
        let spec = build_reconfig_spec(Some(4), Some(8192), None);
        assert_eq!(spec.num_cpus, Some(4));
        assert_eq!(spec.cores_per_socket, Some(4));
        assert_eq!(spec.memory_mb, Some(8192));
        assert_eq!(spec.cpu_hot_add, Some(true));
        assert_eq!(spec.memory_hot_add, Some(true));
        assert!(spec.device_changes.is_empty());
    }

    #[test]
    fn test_network_change_targets_given_nic() {
        let net = HostNetwork {
            name: "prod".to_string(),
            backing: NetworkBacking::Distributed {
                switch_uuid: "dvs-1".to_string(),
                portgroup_key: "pg-7".to_string(),
            },
        };
        let nic = VirtualDevice {
            key: 4001,
            label: "Network adapter 2".to_string(),
            kind: DeviceKind::Ethernet { network: None },
        };

        let spec = build_reconfig_spec(None, None, Some((&net, &nic)));
        assert_eq!(spec.num_cpus, None);
        assert_eq!(
            spec.device_changes,
            vec![DeviceChange::EditNetworkBacking {
                device_key: 4001,
                backing: net.backing.clone(),
                connected: true,
                start_connected: true,
            }]
        );
    }
}
