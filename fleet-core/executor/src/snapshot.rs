//! 快照管理

use fleet_transport::{SnapshotNode, SnapshotRequest, SnapshotTree, VmRef};
use tracing::{info, warn};

use crate::fleet::VmConfig;
use crate::power::{power_off_checked, power_on};
use crate::task_waiter::wait_for_task;
use crate::{BatchContext, ExecutorError, Result, RevertPolicy};

/// 快照查找结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotLookup {
    Found(SnapshotNode),
    /// 有快照，但没有同名的
    NotFound,
    /// 虚拟机没有任何快照
    NoSnapshots,
}

/// 回滚结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertOutcome {
    Reverted,
    /// 已处于目标快照，按策略跳过
    AlreadyCurrent,
}

/// 先序深度优先查找，同名时第一个匹配生效
pub fn search_tree<'a>(tree: &'a SnapshotTree, name: &str) -> Option<&'a SnapshotNode> {
    fn recurse<'a>(nodes: &'a [SnapshotNode], name: &str) -> Option<&'a SnapshotNode> {
        for node in nodes {
            if node.name == name {
                return Some(node);
            }
            if let Some(found) = recurse(&node.children, name) {
                return Some(found);
            }
        }
        None
    }

    recurse(&tree.roots, name)
}

/// 先序展开所有快照名称（保留重名）
pub fn flatten_names(tree: &SnapshotTree) -> Vec<String> {
    fn recurse(nodes: &[SnapshotNode], out: &mut Vec<String>) {
        for node in nodes {
            out.push(node.name.clone());
            recurse(&node.children, out);
        }
    }

    let mut names = Vec::new();
    recurse(&tree.roots, &mut names);
    names
}

pub async fn find_snapshot(ctx: &BatchContext, vm: &VmRef, name: &str) -> Result<SnapshotLookup> {
    let tree = ctx.session().snapshot_tree(vm).await?;
    if tree.is_empty() {
        return Ok(SnapshotLookup::NoSnapshots);
    }
    Ok(match search_tree(&tree, name) {
        Some(node) => SnapshotLookup::Found(node.clone()),
        None => SnapshotLookup::NotFound,
    })
}

pub async fn list_snapshot_names(ctx: &BatchContext, vm: &VmRef) -> Result<Vec<String>> {
    let tree = ctx.session().snapshot_tree(vm).await?;
    Ok(flatten_names(&tree))
}

/// 确定快照名称与描述
///
/// 优先级：请求指定 > 配置 > 时间戳。请求指定名称时描述为空。
pub fn resolve_snapshot_name(
    requested: Option<&str>,
    config: Option<&VmConfig>,
) -> (String, String) {
    if let Some(name) = requested.filter(|n| !n.is_empty()) {
        return (name.to_string(), String::new());
    }

    let description = config
        .and_then(|c| c.target_snapshot_description.clone())
        .unwrap_or_default();
    let name = config
        .and_then(|c| c.target_snapshot.clone())
        .unwrap_or_else(|| {
            format!(
                "snapshot_{}",
                chrono::Local::now().format("%Y-%m-%dT%H-%M-%S")
            )
        });
    (name, description)
}

/// 创建快照，前后保持虚拟机电源状态不变
pub async fn create_snapshot(
    ctx: &BatchContext,
    vm: &VmRef,
    requested: Option<&str>,
    config: Option<&VmConfig>,
) -> Result<String> {
    let (name, description) = resolve_snapshot_name(requested, config);
    let was_on = ctx.session().power_state(vm).await?.is_on();

    if was_on {
        power_off_checked(ctx, vm).await?;
    }

    info!("📸 创建快照 '{}': {}", name, vm.name);
    let request = SnapshotRequest {
        name: name.clone(),
        description,
        memory: false,
        quiesce: false,
    };
    let created = async {
        let task = ctx.session().create_snapshot(vm, &request).await?;
        wait_for_task(task.as_ref(), &format!("创建快照 '{}'", name), &ctx.settings).await
    }
    .await;

    let restored = restore_power(ctx, vm, was_on).await;
    created?;
    restored?;

    info!("✅ 快照 '{}' 已创建", name);
    Ok(name)
}

/// 回滚到快照，前后保持虚拟机电源状态不变
pub async fn revert_to_snapshot(ctx: &BatchContext, vm: &VmRef, name: &str) -> Result<RevertOutcome> {
    let tree = ctx.session().snapshot_tree(vm).await?;
    let Some(node) = search_tree(&tree, name) else {
        return Err(ExecutorError::SnapshotNotFound {
            name: name.to_string(),
        });
    };

    if ctx.settings.revert_policy == RevertPolicy::SkipIfCurrent
        && tree.current.as_ref() == Some(&node.id)
    {
        info!("虚拟机 {} 已处于快照 '{}'，跳过回滚", vm.name, name);
        return Ok(RevertOutcome::AlreadyCurrent);
    }

    let was_on = ctx.session().power_state(vm).await?.is_on();

    info!("⏪ 回滚 {} 到快照 '{}'", vm.name, name);
    let reverted = async {
        let task = ctx.session().revert_to_snapshot(vm, &node.id).await?;
        wait_for_task(task.as_ref(), &format!("回滚到快照 '{}'", name), &ctx.settings).await
    }
    .await;

    let restored = restore_power(ctx, vm, was_on).await;
    reverted?;
    restored?;

    info!("✅ 已回滚到快照 '{}'", name);
    Ok(RevertOutcome::Reverted)
}

/// 把电源状态恢复为 `was_on`
pub(crate) async fn restore_power(ctx: &BatchContext, vm: &VmRef, was_on: bool) -> Result<()> {
    let is_on = ctx.session().power_state(vm).await?.is_on();
    match (was_on, is_on) {
        (true, false) => {
            power_on(ctx, vm).await?;
        }
        (false, true) => {
            warn!("虚拟机 {} 原为关机状态，恢复关机", vm.name);
            power_off_checked(ctx, vm).await?;
        }
        _ => {}
    }
    Ok(())
}
