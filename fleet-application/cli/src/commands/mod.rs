//! CLI 命令实现

pub mod fleet;
pub mod output;
pub mod run;
pub mod snapshot;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_executor::{load_fleet_config, FleetConfig};
use fleet_transport::Hypervisor;
use tracing::info;

use crate::config::CliConfig;

/// 加载舰队定义
pub fn load_fleet(config: &CliConfig, csv: Option<&Path>) -> Result<FleetConfig> {
    let path = config.csv_path(csv)?;
    let fleet = load_fleet_config(&path)
        .with_context(|| format!("加载舰队定义失败: {:?}", path))?;
    info!("📋 已加载舰队定义: {} 台虚拟机, {} 个分组", fleet.len(), fleet.groups.len());
    Ok(fleet)
}

/// 建立虚拟化会话
pub async fn connect(config: &CliConfig) -> Result<Arc<dyn Hypervisor>> {
    let transport = config.hypervisor.to_transport_config();
    let session = fleet_transport::connect(&transport)
        .await
        .with_context(|| format!("无法连接到虚拟化主机 {}", transport.libvirt_uri()))?;
    Ok(Arc::new(session))
}
