//! 主机连接管理

use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use virt::connect::Connect;

use crate::{LibvirtSession, Result, TransportConfig, TransportError};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 连接失败
    Failed,
}

/// 主机连接
pub struct HostConnection {
    /// 传输配置
    config: Arc<TransportConfig>,

    /// Libvirt 连接
    connection: Arc<Mutex<Option<Connect>>>,

    /// 连接状态
    state: Arc<Mutex<ConnectionState>>,
}

impl HostConnection {
    pub fn new(config: Arc<TransportConfig>) -> Self {
        Self {
            config,
            connection: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
        }
    }

    /// 连接到主机
    pub async fn connect(&self) -> Result<()> {
        let uri = self.config.libvirt_uri();
        info!("连接到主机: {} ({})", self.config.host, uri);

        *self.state.lock().await = ConnectionState::Connecting;

        // 连接 Libvirt（带超时）
        let timeout = self.config.connect_timeout();
        let conn_result = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || Connect::open(Some(&uri))),
        )
        .await;

        let conn = match conn_result {
            Ok(Ok(Ok(conn))) => conn,
            Ok(Ok(Err(e))) => {
                *self.state.lock().await = ConnectionState::Failed;
                return Err(TransportError::ConnectionFailed(e.to_string()));
            }
            Ok(Err(_)) => {
                *self.state.lock().await = ConnectionState::Failed;
                return Err(TransportError::ConnectionFailed("任务失败".to_string()));
            }
            Err(_) => {
                *self.state.lock().await = ConnectionState::Failed;
                return Err(TransportError::Timeout);
            }
        };

        *self.connection.lock().await = Some(conn);
        *self.state.lock().await = ConnectionState::Connected;

        info!("成功连接到主机: {}", self.config.host);
        Ok(())
    }

    /// 断开连接（重复调用是空操作）
    pub async fn disconnect(&self) {
        let mut conn_guard = self.connection.lock().await;
        let Some(mut conn) = conn_guard.take() else {
            debug!("主机 {} 已断开，忽略重复断开", self.config.host);
            return;
        };

        info!("断开主机连接: {}", self.config.host);
        match tokio::task::spawn_blocking(move || conn.close()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("关闭 libvirt 连接失败: {}", e),
            Err(e) => warn!("关闭 libvirt 连接任务失败: {}", e),
        }

        *self.state.lock().await = ConnectionState::Disconnected;
    }

    /// 检查连接是否活跃
    pub async fn is_alive(&self) -> bool {
        let state = *self.state.lock().await;
        if state != ConnectionState::Connected {
            return false;
        }

        let conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.as_ref() {
            conn.is_alive().unwrap_or(false)
        } else {
            false
        }
    }

    /// 获取底层连接副本（用于阻塞调用）
    pub async fn get_connection(&self) -> Result<Connect> {
        let conn_guard = self.connection.lock().await;
        conn_guard.as_ref().cloned().ok_or(TransportError::Disconnected)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }
}

// ============================================
// 会话建立
// ============================================

/// TCP 可达性检测
pub async fn check_reachable(config: &TransportConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    debug!("检测主机可达性: {}", addr);

    match tokio::time::timeout(config.reachability_timeout(), TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            debug!("主机 {} 连接被拒绝: {}", addr, e);
            Err(TransportError::Unreachable {
                host: config.host.clone(),
                port: config.port,
            })
        }
        Err(_) => Err(TransportError::Unreachable {
            host: config.host.clone(),
            port: config.port,
        }),
    }
}

/// 建立虚拟化会话
///
/// 先做可达性检测再打开 libvirt 连接。任何失败都只记录日志并返回 `None`。
pub async fn connect(config: &TransportConfig) -> Option<LibvirtSession> {
    // 本地 URI（qemu:///system）没有可检测的端口
    if config.uri.is_none() || !config.host.is_empty() {
        if let Err(e) = check_reachable(config).await {
            error!("❌ {}", e);
            return None;
        }
    }

    let connection = HostConnection::new(Arc::new(config.clone()));
    match connection.connect().await {
        Ok(()) => Some(LibvirtSession::new(connection)),
        Err(e) => {
            error!("❌ 无法连接到主机 {}: {}", config.host, e);
            None
        }
    }
}
