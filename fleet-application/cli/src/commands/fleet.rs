//! 舰队定义查看命令

use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use fleet_executor::VmConfig;
use serde::Serialize;

use super::output::{output_formatted, TableRow};
use crate::config::CliConfig;

/// 虚拟机列表行
#[derive(Debug, Serialize)]
pub struct VmRow {
    pub group: String,
    pub name: String,
    pub source: String,
    pub datastore: String,
    pub cpu: String,
    pub memory_mb: String,
    pub ip: String,
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

impl From<&VmConfig> for VmRow {
    fn from(vm: &VmConfig) -> Self {
        Self {
            group: vm.group.clone(),
            name: vm.name.clone(),
            source: or_dash(vm.source_vm.clone()),
            datastore: or_dash(vm.datastore.clone()),
            cpu: or_dash(vm.cpu_count.map(|c| c.to_string())),
            memory_mb: or_dash(vm.memory_mb.map(|m| m.to_string())),
            ip: or_dash(vm.ip.clone()),
        }
    }
}

impl TableRow for VmRow {
    fn headers() -> Vec<&'static str> {
        vec!["分组", "虚拟机", "源虚拟机", "数据存储", "CPU", "内存(MB)", "IP"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.group.clone(),
            self.name.clone(),
            self.source.clone(),
            self.datastore.clone(),
            self.cpu.clone(),
            self.memory_mb.clone(),
            self.ip.clone(),
        ]
    }
}

/// 列出分组
pub fn groups(config: &CliConfig, csv: Option<&Path>) -> Result<()> {
    let fleet = super::load_fleet(config, csv)?;

    if fleet.groups.is_empty() {
        println!("{}", "舰队定义为空".yellow());
        return Ok(());
    }

    for group in &fleet.groups {
        let count = fleet.in_group(group).count();
        println!("{} {:<24} {} 台", "•".green(), group, count);
    }
    Ok(())
}

/// 列出虚拟机
pub fn vms(config: &CliConfig, csv: Option<&Path>, group: Option<&str>, format: &str) -> Result<()> {
    let fleet = super::load_fleet(config, csv)?;

    let rows: Vec<VmRow> = fleet
        .vms
        .iter()
        .filter(|vm| group.map_or(true, |g| vm.group == g))
        .map(VmRow::from)
        .collect();

    if rows.is_empty() && format == "table" {
        println!("{}", "没有匹配的虚拟机".yellow());
        return Ok(());
    }

    output_formatted(&rows, format)
}
