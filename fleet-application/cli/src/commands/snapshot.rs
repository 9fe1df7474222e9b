//! 快照查看命令

use anyhow::Result;
use colored::Colorize;
use fleet_executor::{list_snapshot_names, BatchContext};

use crate::config::CliConfig;

/// 列出虚拟机的全部快照名称（前序遍历，可能重名）
pub async fn handle(config: &CliConfig, vm_name: &str) -> Result<()> {
    let session = super::connect(config).await?;
    let ctx = BatchContext::new(session.clone(), config.executor.clone());

    let result = async {
        let vm = ctx.resolve_vm(vm_name).await?;
        list_snapshot_names(&ctx, &vm).await
    }
    .await;

    session.disconnect().await;

    let names = result?;
    if names.is_empty() {
        println!("{} {}", vm_name.cyan(), "没有快照".yellow());
        return Ok(());
    }

    println!("{} 的快照 ({} 个):", vm_name.cyan().bold(), names.len());
    for name in names {
        println!("  {} {}", "•".green(), name);
    }
    Ok(())
}
