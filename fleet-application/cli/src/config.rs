//! CLI 配置管理
//!
//! **数据存储方式**: TOML 文件，按以下顺序查找：
//! 1. 环境变量 `FLEET_CONFIG` 指向的文件
//! 2. 当前目录下的 `fleet.toml`
//! 3. `~/.config/fleet/config.toml`
//!
//! 文件中的值可以被 `FLEET_*` 环境变量覆盖。

use anyhow::{Context, Result};
use fleet_executor::ExecutorSettings;
use fleet_transport::{TransportConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// CLI 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// 虚拟化主机
    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    /// 舰队定义文件 (分号分隔 CSV)
    pub csv_file: Option<String>,

    /// 日志级别
    pub log_level: Option<String>,

    /// 执行器参数
    #[serde(default)]
    pub executor: ExecutorSettings,
}

/// 虚拟化主机配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    #[serde(default)]
    pub host: String,

    pub port: Option<u16>,

    #[serde(default = "default_user")]
    pub user: String,

    pub password: Option<String>,

    #[serde(default)]
    pub ignore_tls_verify: bool,

    #[serde(default)]
    pub transport: TransportKind,

    /// 直接指定的 libvirt URI
    pub uri: Option<String>,
}

fn default_user() -> String {
    "root".to_string()
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: None,
            user: default_user(),
            password: None,
            ignore_tls_verify: false,
            transport: TransportKind::default(),
            uri: None,
        }
    }
}

impl HypervisorConfig {
    /// 转换为传输层配置
    pub fn to_transport_config(&self) -> TransportConfig {
        let mut config = TransportConfig::new(&self.host).with_user(&self.user);
        config.transport = self.transport;
        config.ignore_tls_verify = self.ignore_tls_verify;
        if let Some(port) = self.port {
            config = config.with_port(port);
        } else {
            config = config.with_port(default_port(self.transport));
        }
        if let Some(password) = &self.password {
            config = config.with_password(password);
        }
        if let Some(uri) = &self.uri {
            config = config.with_uri(uri);
        }
        config
    }
}

/// 各传输方式的默认端口
fn default_port(transport: TransportKind) -> u16 {
    match transport {
        TransportKind::Ssh => 22,
        TransportKind::Tcp => 16509,
        TransportKind::Tls => 16514,
    }
}

impl CliConfig {
    /// 默认配置文件路径
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("无法获取用户主目录")?;
        Ok(home.join(".config").join("fleet").join("config.toml"))
    }

    /// 按查找顺序定位配置文件
    pub fn locate(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            return Ok(Some(path.to_path_buf()));
        }

        if let Ok(path) = std::env::var("FLEET_CONFIG") {
            return Ok(Some(PathBuf::from(path)));
        }

        let local = PathBuf::from("fleet.toml");
        if local.exists() {
            return Ok(Some(local));
        }

        let home = Self::default_path()?;
        Ok(home.exists().then_some(home))
    }

    /// 加载配置并应用环境变量覆盖
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::locate(explicit)? {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// 从指定文件加载
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))
    }

    /// 应用 `FLEET_*` 覆盖
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let hv = &mut self.hypervisor;

        if let Some(host) = lookup("FLEET_HOST") {
            hv.host = host;
        }
        if let Some(port) = lookup("FLEET_PORT") {
            hv.port = Some(
                port.parse()
                    .with_context(|| format!("FLEET_PORT 不是有效端口: {}", port))?,
            );
        }
        if let Some(user) = lookup("FLEET_USER") {
            hv.user = user;
        }
        if let Some(password) = lookup("FLEET_PASSWORD") {
            hv.password = Some(password);
        }
        if let Some(flag) = lookup("FLEET_IGNORE_TLS") {
            hv.ignore_tls_verify = parse_flag(&flag)
                .with_context(|| format!("FLEET_IGNORE_TLS 取值无效: {}", flag))?;
        }
        if let Some(uri) = lookup("FLEET_URI") {
            hv.uri = Some(uri);
        }
        if let Some(csv) = lookup("FLEET_CSV_FILE") {
            self.csv_file = Some(csv);
        }
        if let Some(level) = lookup("FLEET_LOG_LEVEL") {
            self.log_level = Some(level);
        }

        Ok(())
    }

    /// 舰队定义文件路径（命令行参数优先）
    pub fn csv_path(&self, cli_override: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = cli_override {
            return Ok(path.to_path_buf());
        }
        self.csv_file
            .as_deref()
            .map(PathBuf::from)
            .context("未配置舰队定义文件 (csv_file / FLEET_CSV_FILE / --csv)")
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
