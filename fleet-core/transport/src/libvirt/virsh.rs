//! virsh / virt-clone 命令封装
//!
//! virt 0.4 绑定没有快照、存储池、网络列表以及整机克隆的接口，
//! 这部分通过本机的 virsh 与 virt-clone 完成。

use tokio::process::Command;
use tracing::debug;

use crate::{Result, SnapshotId, SnapshotNode, TransportError};

/// virsh 调用器（绑定到一个连接 URI）
#[derive(Debug, Clone)]
pub struct Virsh {
    uri: String,
}

impl Virsh {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
        }
    }

    /// 执行 virsh 子命令，返回标准输出
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("virsh -c {} {}", self.uri, args.join(" "));
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        run_command("virsh", &full).await
    }

    /// 执行 virt-clone
    pub async fn virt_clone(&self, source: &str, name: &str, files: &[String]) -> Result<String> {
        let mut args = vec![
            "--connect",
            self.uri.as_str(),
            "--original",
            source,
            "--name",
            name,
        ];
        for file in files {
            args.push("--file");
            args.push(file.as_str());
        }
        debug!("virt-clone {}", args.join(" "));
        run_command("virt-clone", &args).await
    }

    // ---------- 快照 ----------

    /// 读取快照（父快照在前）及其父子关系
    pub async fn snapshot_entries(&self, domain: &str) -> Result<Vec<(String, Option<String>)>> {
        let output = self
            .run(&["snapshot-list", domain, "--name", "--topological"])
            .await?;

        let mut entries = Vec::new();
        for name in parse_name_list(&output) {
            // 根快照没有父快照，virsh 以错误形式返回
            let parent = match self
                .run(&["snapshot-parent", domain, "--snapshotname", name.as_str()])
                .await
            {
                Ok(out) => Some(out.trim().to_string()).filter(|p| !p.is_empty()),
                Err(_) => None,
            };
            entries.push((name, parent));
        }
        Ok(entries)
    }

    /// 当前快照名称
    pub async fn current_snapshot(&self, domain: &str) -> Result<Option<String>> {
        match self.run(&["snapshot-current", domain, "--name"]).await {
            Ok(out) => Ok(Some(out.trim().to_string()).filter(|n| !n.is_empty())),
            Err(TransportError::CommandFailed(msg)) if msg.contains("no current snapshot") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(parse_name_list(&self.run(&["pool-list", "--all", "--name"]).await?))
    }

    pub async fn list_networks(&self) -> Result<Vec<String>> {
        Ok(parse_name_list(&self.run(&["net-list", "--all", "--name"]).await?))
    }
}

async fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| TransportError::CommandFailed(format!("无法启动 {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TransportError::CommandFailed(format!(
            "{} 退出码 {:?}: {}",
            program,
            output.status.code(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `--name` 输出：每行一个名称，忽略空行
pub fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// 由 (名称, 父名称) 列表构建快照树
///
/// 兄弟节点保持输入顺序；父快照不存在的条目作为根。
pub fn build_snapshot_tree(entries: &[(String, Option<String>)]) -> Vec<SnapshotNode> {
    fn children_of(entries: &[(String, Option<String>)], parent: &str) -> Vec<SnapshotNode> {
        entries
            .iter()
            .filter(|(_, p)| p.as_deref() == Some(parent))
            .map(|(name, _)| node(entries, name))
            .collect()
    }

    fn node(entries: &[(String, Option<String>)], name: &str) -> SnapshotNode {
        SnapshotNode {
            id: SnapshotId(name.to_string()),
            name: name.to_string(),
            description: String::new(),
            children: children_of(entries, name),
        }
    }

    entries
        .iter()
        .filter(|(_, parent)| match parent {
            None => true,
            Some(p) => !entries.iter().any(|(name, _)| name == p),
        })
        .map(|(name, _)| node(entries, name))
        .collect()
}
