//! 传输层配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// qemu+ssh
    #[default]
    Ssh,
    /// qemu+tcp
    Tcp,
    /// qemu+tls
    Tls,
}

/// 传输层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// 主机名或 IP
    #[serde(default)]
    pub host: String,

    /// 管理端口（可达性检测也使用该端口）
    #[serde(default = "default_port")]
    pub port: u16,

    /// 登录用户
    #[serde(default = "default_user")]
    pub user: String,

    /// 登录密码（libvirt 后端由 libvirt 自身的认证配置负责，不直接使用）
    #[serde(default)]
    pub password: Option<String>,

    /// 是否跳过 TLS 证书校验
    #[serde(default)]
    pub ignore_tls_verify: bool,

    /// 传输方式
    #[serde(default)]
    pub transport: TransportKind,

    /// 直接指定的连接 URI（优先于 host/port/transport 拼接）
    #[serde(default)]
    pub uri: Option<String>,

    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// 可达性检测超时（秒）
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout: u64,

    /// Guest Agent 命令超时（秒）
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout: i32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: default_user(),
            password: None,
            ignore_tls_verify: false,
            transport: TransportKind::default(),
            uri: None,
            connect_timeout: default_connect_timeout(),
            reachability_timeout: default_reachability_timeout(),
            agent_timeout: default_agent_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.reachability_timeout)
    }

    /// 生成 libvirt 连接 URI
    pub fn libvirt_uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }

        match self.transport {
            TransportKind::Ssh => {
                format!("qemu+ssh://{}@{}:{}/system", self.user, self.host, self.port)
            }
            TransportKind::Tcp => format!("qemu+tcp://{}:{}/system", self.host, self.port),
            TransportKind::Tls => {
                let mut uri = format!("qemu+tls://{}:{}/system", self.host, self.port);
                if self.ignore_tls_verify {
                    uri.push_str("?no_verify=1");
                }
                uri
            }
        }
    }
}

// 默认值函数
fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reachability_timeout() -> u64 {
    3
}

fn default_agent_timeout() -> i32 {
    10
}
