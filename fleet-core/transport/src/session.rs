//! 虚拟化会话能力接口

use async_trait::async_trait;

use crate::{
    CloneSpec, Datastore, GuestAuth, GuestIdentity, GuestNic, GuestProgram, HostNetwork,
    PowerState, ReconfigSpec, ResourcePool, Result, SnapshotId, SnapshotRequest, SnapshotTree,
    Task, ToolsStatus, VirtualDevice, VmRef,
};

/// 已认证的虚拟化会话
///
/// 所有基于 [`VmRef`] 的读取都可能因句柄失效返回
/// [`crate::TransportError::StaleHandle`]。长耗时操作返回 [`Task`] 句柄，
/// 由调用方负责轮询。
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // ---------- 查找 ----------

    /// 按名称解析虚拟机，不存在时返回 `None`
    async fn find_vm(&self, name: &str) -> Result<Option<VmRef>>;

    // ---------- 状态读取 ----------

    async fn power_state(&self, vm: &VmRef) -> Result<PowerState>;

    async fn tools_status(&self, vm: &VmRef) -> Result<ToolsStatus>;

    async fn guest_identity(&self, vm: &VmRef) -> Result<GuestIdentity>;

    async fn guest_nics(&self, vm: &VmRef) -> Result<Vec<GuestNic>>;

    async fn snapshot_tree(&self, vm: &VmRef) -> Result<SnapshotTree>;

    async fn devices(&self, vm: &VmRef) -> Result<Vec<VirtualDevice>>;

    /// 虚拟机所在主机可见的数据存储
    async fn host_datastores(&self, vm: &VmRef) -> Result<Vec<Datastore>>;

    /// 虚拟机所在主机可见的网络
    async fn host_networks(&self, vm: &VmRef) -> Result<Vec<HostNetwork>>;

    /// 虚拟机所在主机的资源池
    async fn host_resource_pool(&self, vm: &VmRef) -> Result<ResourcePool>;

    // ---------- 异步任务 ----------

    async fn power_on(&self, vm: &VmRef) -> Result<Box<dyn Task>>;

    /// 强制关机
    async fn power_off(&self, vm: &VmRef) -> Result<Box<dyn Task>>;

    async fn create_snapshot(&self, vm: &VmRef, request: &SnapshotRequest)
        -> Result<Box<dyn Task>>;

    async fn revert_to_snapshot(&self, vm: &VmRef, snapshot: &SnapshotId)
        -> Result<Box<dyn Task>>;

    async fn reconfigure(&self, vm: &VmRef, spec: &ReconfigSpec) -> Result<Box<dyn Task>>;

    /// 克隆虚拟机，成功时任务结果为新虚拟机
    async fn clone_vm(&self, source: &VmRef, spec: &CloneSpec) -> Result<Box<dyn Task>>;

    /// 删除虚拟机及其磁盘
    async fn destroy(&self, vm: &VmRef) -> Result<Box<dyn Task>>;

    // ---------- 直接操作 ----------

    /// 请求 Guest 优雅关机（不等待完成）
    async fn shutdown_guest(&self, vm: &VmRef) -> Result<()>;

    /// 在 Guest 内启动程序，返回进程 ID
    async fn start_program_in_guest(
        &self,
        vm: &VmRef,
        auth: &GuestAuth,
        program: &GuestProgram,
    ) -> Result<i64>;

    /// 查询 Guest 内进程的退出码，尚未退出时返回 `None`
    async fn guest_process_exit_code(
        &self,
        vm: &VmRef,
        auth: &GuestAuth,
        pid: i64,
    ) -> Result<Option<i32>>;

    /// 释放会话（幂等，失败只记录日志）
    async fn disconnect(&self);
}
