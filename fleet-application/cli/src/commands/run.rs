//! 批量执行命令

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use fleet_executor::{BatchExecutor, BatchRequest, FleetConfig, VmOperations};
use tokio::sync::mpsc;
use tracing::warn;

use super::output;
use crate::config::CliConfig;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// 批量请求 JSON 文件 ({"vmOperations": [...], "snapshotName": .., "revertName": ..})
    #[arg(short, long, conflicts_with_all = ["vms", "group"])]
    pub request: Option<PathBuf>,

    /// 目标虚拟机 (可重复)
    #[arg(long = "vm")]
    pub vms: Vec<String>,

    /// 目标分组 (分组内全部虚拟机)
    #[arg(short, long)]
    pub group: Option<String>,

    /// 操作列表, 逗号分隔 (clone, delete, hardware, customize, snapshot, revert, poweroff, poweron)
    #[arg(short, long, value_delimiter = ',')]
    pub ops: Vec<String>,

    /// 新快照名称
    #[arg(long)]
    pub snapshot_name: Option<String>,

    /// 回滚目标快照名称
    #[arg(long)]
    pub revert_name: Option<String>,

    /// 以 JSON 输出报告
    #[arg(long)]
    pub json: bool,
}

/// 由命令行参数组装批量请求
fn build_request(args: &RunArgs, fleet: &FleetConfig) -> Result<BatchRequest> {
    if let Some(path) = &args.request {
        return read_request(path);
    }

    let mut targets = args.vms.clone();
    if let Some(group) = &args.group {
        let members: Vec<String> = fleet.in_group(group).map(|vm| vm.name.clone()).collect();
        if members.is_empty() {
            anyhow::bail!("分组 {} 中没有虚拟机", group);
        }
        for name in members {
            if !targets.contains(&name) {
                targets.push(name);
            }
        }
    }

    if targets.is_empty() {
        anyhow::bail!("未指定目标虚拟机 (--vm / --group / --request)");
    }
    if args.ops.is_empty() {
        anyhow::bail!("未指定操作 (--ops)");
    }

    Ok(BatchRequest {
        vm_operations: targets
            .into_iter()
            .map(|vm| VmOperations {
                vm,
                operations: args.ops.clone(),
            })
            .collect(),
        snapshot_name: args.snapshot_name.clone(),
        revert_name: args.revert_name.clone(),
    })
}

fn read_request(path: &Path) -> Result<BatchRequest> {
    let content =
        fs::read_to_string(path).with_context(|| format!("读取请求文件失败: {:?}", path))?;
    BatchRequest::from_json(&content).with_context(|| format!("解析请求文件失败: {:?}", path))
}

pub async fn handle(config: &CliConfig, csv: Option<&Path>, args: RunArgs) -> Result<()> {
    // 舰队定义与请求都在连接之前校验
    let fleet = super::load_fleet(config, csv)?;
    let request = build_request(&args, &fleet)?;
    let items = request.into_work_items().context("批量请求无效")?;

    let session = super::connect(config).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = BatchExecutor::new(session, fleet, config.executor.clone())
        .with_progress(tx)
        .spawn(items);

    let cancel = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 收到中断信号，当前操作完成后停止");
            cancel.cancel();
        }
    });

    // 发送端随批次任务结束而关闭
    while let Some(event) = rx.recv().await {
        if !args.json {
            output::print_progress(&event);
        }
    }

    let report = handle.join().await?;
    interrupt.abort();

    if args.json {
        println!("{}", report.to_json()?);
    } else {
        output::print_report(&report);
    }

    if !report.is_success() {
        let summary = report.summary();
        anyhow::bail!(
            "批次未全部成功: 失败 {}, 中断 {}",
            summary.failed,
            summary.interrupted
        );
    }
    Ok(())
}
