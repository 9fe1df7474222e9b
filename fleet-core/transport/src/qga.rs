//! QEMU Guest Agent 通道
//!
//! libvirt 后端通过 QGA 提供 Guest 状态（agent 存活、系统信息、网卡地址）
//! 以及 Guest 内命令执行。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use virt::domain::Domain;

use crate::{GuestIdentity, GuestNic, IpAddressInfo, IpAddressState, Result, TransportError};

// ============================================================================
// 协议结构
// ============================================================================

/// QGA 命令的通用结构
#[derive(Debug, Serialize)]
struct QgaCommand<'a, T> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<T>,
}

/// QGA 响应的通用结构
#[derive(Debug, Deserialize)]
struct QgaResponse<T> {
    #[serde(rename = "return")]
    ret: Option<T>,
    error: Option<QgaErrorBody>,
}

#[derive(Debug, Deserialize)]
struct QgaErrorBody {
    #[serde(rename = "class")]
    error_class: String,
    desc: String,
}

/// guest-exec 命令参数
#[derive(Debug, Serialize)]
pub struct GuestExecCommand {
    /// 要执行的命令路径（绝对路径）
    pub path: String,

    /// 命令参数
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arg: Vec<String>,

    /// 是否捕获标准输出
    #[serde(rename = "capture-output")]
    pub capture_output: bool,
}

#[derive(Debug, Deserialize)]
struct GuestExecResult {
    pid: i64,
}

#[derive(Debug, Serialize)]
struct GuestExecStatusRequest {
    pid: i64,
}

/// guest-exec-status 返回结果
#[derive(Debug, Deserialize)]
pub struct GuestExecStatus {
    /// 进程是否已退出
    pub exited: bool,

    /// 退出码（如果已退出）
    #[serde(rename = "exitcode")]
    pub exit_code: Option<i32>,

    /// 信号编号（如果被信号终止）
    pub signal: Option<i32>,
}

/// guest-get-osinfo 返回结果
#[derive(Debug, Default, Deserialize)]
pub struct GuestOsInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "pretty-name")]
    pub pretty_name: Option<String>,
    #[serde(rename = "kernel-release")]
    pub kernel_release: Option<String>,
}

impl GuestOsInfo {
    pub fn into_identity(self) -> GuestIdentity {
        GuestIdentity {
            guest_id: self.id,
            guest_full_name: self.pretty_name.or(self.name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GuestIpAddress {
    #[serde(rename = "ip-address-type")]
    ip_address_type: String,
    #[serde(rename = "ip-address")]
    ip_address: String,
    prefix: u8,
}

/// guest-network-get-interfaces 返回的单个网卡
#[derive(Debug, Deserialize)]
pub struct GuestNetworkInterface {
    name: String,
    #[serde(rename = "hardware-address")]
    hardware_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<GuestIpAddress>,
}

/// 转换为后端无关的网卡列表
///
/// QGA 不报告地址状态；第一个非回环 IPv4 地址标记为 preferred，
/// 其余地址状态未知。回环网卡被忽略。
pub fn interfaces_to_nics(interfaces: Vec<GuestNetworkInterface>) -> Vec<GuestNic> {
    let mut preferred_assigned = false;

    interfaces
        .into_iter()
        .filter(|iface| iface.name != "lo" && !iface.name.starts_with("Loopback"))
        .map(|iface| {
            let ip_config = iface
                .ip_addresses
                .iter()
                .map(|ip| {
                    let is_v4 = ip.ip_address_type == "ipv4";
                    let state = if is_v4 && !preferred_assigned && !ip.ip_address.starts_with("127.")
                    {
                        preferred_assigned = true;
                        IpAddressState::Preferred
                    } else {
                        IpAddressState::Unknown
                    };
                    IpAddressInfo {
                        address: ip.ip_address.clone(),
                        prefix_length: ip.prefix,
                        state,
                    }
                })
                .collect();

            GuestNic {
                name: Some(iface.name),
                mac_address: iface.hardware_address,
                ip_config,
                ip_addresses: iface.ip_addresses.into_iter().map(|ip| ip.ip_address).collect(),
            }
        })
        .collect()
}

// ============================================================================
// 客户端
// ============================================================================

/// QEMU Guest Agent 客户端
pub struct QgaClient<'a> {
    domain: &'a Domain,
    timeout: i32, // 超时时间（秒）
}

impl<'a> QgaClient<'a> {
    pub fn new(domain: &'a Domain) -> Self {
        Self {
            domain,
            timeout: 10,
        }
    }

    pub fn with_timeout(mut self, timeout: i32) -> Self {
        self.timeout = timeout;
        self
    }

    fn execute_command<T, R>(&self, command: &str, args: Option<T>) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let cmd = QgaCommand {
            execute: command,
            arguments: args,
        };
        let cmd_json =
            serde_json::to_string(&cmd).map_err(|e| TransportError::ParseError(e.to_string()))?;

        debug!("发送 QGA 命令: {}", command);

        let response_json = self
            .domain
            .qemu_agent_command(&cmd_json, self.timeout, 0)
            .map_err(|e| classify_agent_error(&e.to_string()))?;

        parse_response(&response_json)
    }

    /// guest-ping
    pub fn ping(&self) -> Result<()> {
        #[derive(Serialize)]
        struct Empty {}

        let _: serde_json::Value = self.execute_command::<Empty, _>("guest-ping", None)?;
        Ok(())
    }

    /// guest-get-osinfo
    pub fn get_osinfo(&self) -> Result<GuestOsInfo> {
        #[derive(Serialize)]
        struct Empty {}

        self.execute_command::<Empty, GuestOsInfo>("guest-get-osinfo", None)
    }

    /// guest-network-get-interfaces
    pub fn network_interfaces(&self) -> Result<Vec<GuestNetworkInterface>> {
        #[derive(Serialize)]
        struct Empty {}

        self.execute_command::<Empty, _>("guest-network-get-interfaces", None)
    }

    /// guest-exec，返回 PID
    pub fn exec(&self, cmd: GuestExecCommand) -> Result<i64> {
        debug!("执行 Guest 命令: {}", cmd.path);

        let result: GuestExecResult = self
            .execute_command("guest-exec", Some(cmd))
            .map_err(|e| match e {
                TransportError::GuestOperationsFault(msg) => TransportError::GuestExecFailed(msg),
                other => other,
            })?;
        Ok(result.pid)
    }

    /// guest-exec-status
    pub fn exec_status(&self, pid: i64) -> Result<GuestExecStatus> {
        self.execute_command("guest-exec-status", Some(GuestExecStatusRequest { pid }))
    }
}

/// 解析 QGA 响应
fn parse_response<R: DeserializeOwned>(response_json: &str) -> Result<R> {
    let response: QgaResponse<R> = serde_json::from_str(response_json)
        .map_err(|e| TransportError::ParseError(e.to_string()))?;

    if let Some(error) = response.error {
        return Err(TransportError::GuestOperationsFault(format!(
            "{}: {}",
            error.error_class, error.desc
        )));
    }

    response
        .ret
        .ok_or_else(|| TransportError::GuestOperationsFault("QGA 未响应".to_string()))
}

/// 把 libvirt 报告的 agent 错误归类
fn classify_agent_error(message: &str) -> TransportError {
    let lower = message.to_lowercase();
    if lower.contains("agent is not connected")
        || lower.contains("agent is not responding")
        || lower.contains("agent not available")
        || lower.contains("domain is not running")
    {
        TransportError::ToolsUnavailable
    } else if lower.contains("permission denied") || lower.contains("authentication") {
        TransportError::GuestLoginInvalid
    } else {
        TransportError::GuestOperationsFault(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_command_serialization() {
        let cmd = GuestExecCommand {
            path: "/bin/bash".to_string(),
            arg: vec!["-c".to_string(), "hostname".to_string()],
            capture_output: false,
        };
        let json = serde_json::to_value(QgaCommand {
            execute: "guest-exec",
            arguments: Some(cmd),
        })
        .unwrap();

        assert_eq!(json["execute"], "guest-exec");
        assert_eq!(json["arguments"]["path"], "/bin/bash");
        assert_eq!(json["arguments"]["arg"][1], "hostname");
        assert_eq!(json["arguments"]["capture-output"], false);
    }

    #[test]
    fn test_parse_error_response() {
        let err = parse_response::<serde_json::Value>(
            r#"{"error":{"class":"GenericError","desc":"Failed to execute child process"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::GuestOperationsFault(msg) if msg.contains("GenericError")));
    }

    #[test]
    fn test_parse_exec_status() {
        let status: GuestExecStatus =
            parse_response(r#"{"return":{"exited":true,"exitcode":3}}"#).unwrap();
        assert!(status.exited);
        assert_eq!(status.exit_code, Some(3));
    }

    #[test]
    fn test_classify_agent_errors() {
        assert!(matches!(
            classify_agent_error("Guest agent is not responding: QEMU guest agent is not connected"),
            TransportError::ToolsUnavailable
        ));
        assert!(matches!(
            classify_agent_error("internal error: unable to execute QEMU agent command"),
            TransportError::GuestOperationsFault(_)
        ));
    }

    #[test]
    fn test_interfaces_mark_first_ipv4_preferred() {
        let json = r#"[
            {"name":"lo","ip-addresses":[{"ip-address-type":"ipv4","ip-address":"127.0.0.1","prefix":8}]},
            {"name":"ens33","hardware-address":"52:54:00:aa:bb:cc","ip-addresses":[
                {"ip-address-type":"ipv6","ip-address":"fe80::1","prefix":64},
                {"ip-address-type":"ipv4","ip-address":"10.0.0.21","prefix":24}
            ]},
            {"name":"ens34","ip-addresses":[{"ip-address-type":"ipv4","ip-address":"10.1.0.21","prefix":24}]}
        ]"#;
        let interfaces: Vec<GuestNetworkInterface> = serde_json::from_str(json).unwrap();
        let nics = interfaces_to_nics(interfaces);

        assert_eq!(nics.len(), 2);
        assert_eq!(nics[0].ip_config[1].state, IpAddressState::Preferred);
        assert_eq!(nics[0].ip_config[0].state, IpAddressState::Unknown);
        assert_eq!(nics[1].ip_config[0].state, IpAddressState::Unknown);
        assert_eq!(nics[0].ip_addresses, vec!["fe80::1", "10.0.0.21"]);
    }
}
