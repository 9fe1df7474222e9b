//! Fleet CLI 应用

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Fleet - 虚拟机批量操作编排工具", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别 (RUST_LOG 优先)
    #[arg(short, long)]
    log_level: Option<String>,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 舰队定义文件 (覆盖配置中的 csv_file)
    #[arg(long, global = true)]
    csv: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出舰队定义中的分组
    Groups,

    /// 列出舰队定义中的虚拟机
    Vms {
        /// 只显示指定分组
        #[arg(short, long)]
        group: Option<String>,

        /// 输出格式 (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// 列出虚拟机的快照名称
    Snapshots {
        /// 虚拟机名称
        vm: String,
    },

    /// 执行批量操作
    Run(commands::run::RunArgs),
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;

    // 初始化日志
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    info!("Fleet CLI 启动");

    // 处理命令
    match cli.command {
        Commands::Groups => commands::fleet::groups(&config, cli.csv.as_deref())?,
        Commands::Vms { group, format } => {
            commands::fleet::vms(&config, cli.csv.as_deref(), group.as_deref(), &format)?
        }
        Commands::Snapshots { vm } => commands::snapshot::handle(&config, &vm).await?,
        Commands::Run(args) => commands::run::handle(&config, cli.csv.as_deref(), args).await?,
    }

    Ok(())
}
