//! Guest 系统定制
//!
//! 按 Guest 操作系统族写入静态网络配置与主机名。
//! 识别顺序固定：windows 先于任何 linux 发行版检查，通用 linux 最后。

use fleet_transport::{GuestAuth, GuestIdentity, GuestProgram, VmRef};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::fleet::VmConfig;
use crate::guest_ready::{wait_for_guest_ready, Pinger};
use crate::power::power_on;
use crate::{BatchContext, ExecutorError, ExecutorSettings, Result};

/// 操作系统族
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Windows,
    Ubuntu,
    Debian,
    Centos,
    Redhat,
    RedOs,
    Astra,
    /// 无法细分的 Linux
    Linux,
    Unknown,
}

impl OsFamily {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Ubuntu => "ubuntu",
            Self::Debian => "debian",
            Self::Centos => "centos",
            Self::Redhat => "redhat",
            Self::RedOs => "redos",
            Self::Astra => "astra",
            Self::Linux => "linux",
            Self::Unknown => "unknown",
        }
    }

    /// 是否有对应的定制流程
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::RedOs | Self::Astra | Self::Unknown)
    }

    fn default_user(&self) -> &'static str {
        match self {
            Self::Windows => "Administrator",
            _ => "root",
        }
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 按 Guest 标识判断操作系统族（小写子串匹配）
pub fn classify_os(identity: &GuestIdentity) -> OsFamily {
    let combined = format!(
        "{} {}",
        identity.guest_id.as_deref().unwrap_or_default(),
        identity.guest_full_name.as_deref().unwrap_or_default()
    )
    .to_lowercase();

    let rules: [(&[&str], OsFamily); 8] = [
        (&["windows"], OsFamily::Windows),
        (&["ubuntu"], OsFamily::Ubuntu),
        (&["centos"], OsFamily::Centos),
        (&["debian"], OsFamily::Debian),
        (&["rhel", "red hat", "redhat"], OsFamily::Redhat),
        (&["redos"], OsFamily::RedOs),
        (&["astra"], OsFamily::Astra),
        (&["linux"], OsFamily::Linux),
    ];

    rules
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| combined.contains(n)))
        .map(|(_, family)| *family)
        .unwrap_or(OsFamily::Unknown)
}

// ============================================
// 网络参数
// ============================================

/// 掩码转前缀长度，接受点分掩码或前缀长度
pub fn netmask_to_prefix(netmask: &str) -> Option<u8> {
    let netmask = netmask.trim();
    if let Ok(prefix) = netmask.parse::<u8>() {
        return (prefix <= 32).then_some(prefix);
    }

    let octets = netmask
        .split('.')
        .map(|part| part.parse::<u8>().ok())
        .collect::<Option<Vec<_>>>()?;
    if octets.len() != 4 {
        return None;
    }

    let mask = u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]);
    // 必须是连续的 1
    (mask.leading_ones() == mask.count_ones()).then_some(mask.count_ones() as u8)
}

/// 前缀长度转点分掩码
pub fn prefix_to_netmask(prefix: u8) -> String {
    let mask = match prefix.min(32) {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    };
    let [a, b, c, d] = mask.to_be_bytes();
    format!("{}.{}.{}.{}", a, b, c, d)
}

/// 要写入 Guest 的网络与主机名设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestNetworkSettings {
    pub hostname: String,
    pub ip: String,
    pub prefix: u8,
    pub gateway: Option<String>,
    pub dns: Option<String>,
}

impl GuestNetworkSettings {
    /// 从虚拟机配置提取，缺少 IP 或掩码时报错。主机名缺省为虚拟机名。
    pub fn from_config(config: &VmConfig) -> Result<Self> {
        let ip = config
            .ip
            .clone()
            .ok_or_else(|| ExecutorError::InvalidRequest(format!("虚拟机 {} 未配置 IP", config.name)))?;
        let netmask = config.netmask.as_deref().ok_or_else(|| {
            ExecutorError::InvalidRequest(format!("虚拟机 {} 未配置子网掩码", config.name))
        })?;
        let prefix = netmask_to_prefix(netmask).ok_or_else(|| {
            ExecutorError::InvalidRequest(format!("无效的子网掩码: {}", netmask))
        })?;

        Ok(Self {
            hostname: config.hostname.clone().unwrap_or_else(|| config.name.clone()),
            ip,
            prefix,
            gateway: config.gateway.clone(),
            dns: config.dns.clone(),
        })
    }

    pub fn netmask(&self) -> String {
        prefix_to_netmask(self.prefix)
    }
}

// ============================================
// 脚本生成
// ============================================

/// 单引号包裹，供 sh 使用
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// 以 sudo 执行一段 sh 命令
fn sudo_sh(password: &str, command: &str) -> String {
    format!("echo {} | sudo -S sh -c {}", sh_quote(password), sh_quote(command))
}

fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Windows 网络与主机名脚本
pub fn windows_script(net: &GuestNetworkSettings) -> String {
    let gateway = net
        .gateway
        .as_deref()
        .map(|gw| format!(" -DefaultGateway {}", ps_quote(gw)))
        .unwrap_or_default();
    let dns = net
        .dns
        .as_deref()
        .map(|dns| {
            format!(
                "    Set-DnsClientServerAddress -InterfaceIndex $adapter.ifIndex -ServerAddresses {}\n",
                ps_quote(dns)
            )
        })
        .unwrap_or_default();

    format!(
        "$ErrorActionPreference = 'Stop'\n\
         $adapter = Get-NetAdapter | Where-Object {{ $_.Status -eq 'Up' }} | Select-Object -First 1\n\
         if (-not $adapter) {{ throw 'no active network adapter' }}\n\
         Set-NetIPInterface -InterfaceIndex $adapter.ifIndex -Dhcp Disabled\n\
         Get-NetIPAddress -InterfaceIndex $adapter.ifIndex -ErrorAction SilentlyContinue | Remove-NetIPAddress -Confirm:$false -ErrorAction SilentlyContinue\n\
         Remove-NetRoute -InterfaceIndex $adapter.ifIndex -DestinationPrefix '0.0.0.0/0' -Confirm:$false -ErrorAction SilentlyContinue\n\
         Set-DnsClientServerAddress -InterfaceIndex $adapter.ifIndex -ResetServerAddresses\n\
         New-NetIPAddress -InterfaceIndex $adapter.ifIndex -IPAddress {ip} -PrefixLength {prefix}{gateway} | Out-Null\n\
         {dns}\
         Rename-Computer -NewName {hostname} -Force\n",
        ip = ps_quote(&net.ip),
        prefix = net.prefix,
        gateway = gateway,
        dns = dns,
        hostname = ps_quote(&net.hostname),
    )
}

/// netplan 配置
pub fn netplan_yaml(net: &GuestNetworkSettings, interface: &str) -> String {
    let mut yaml = format!(
        "network:\n  version: 2\n  ethernets:\n    {}:\n      addresses:\n        - {}/{}\n",
        interface, net.ip, net.prefix
    );
    if let Some(dns) = &net.dns {
        yaml.push_str(&format!(
            "      nameservers:\n        addresses:\n          - {}\n        search: []\n",
            dns
        ));
    }
    if let Some(gateway) = &net.gateway {
        yaml.push_str(&format!(
            "      routes:\n        - to: default\n          via: {}\n",
            gateway
        ));
    }
    yaml
}

/// Ubuntu/Debian 命令序列（逐条执行）
///
/// 最后一条应用 netplan 后关机，调用方不等待它退出。
pub fn ubuntu_commands(net: &GuestNetworkSettings, password: &str, interface: &str) -> Vec<String> {
    let host = sh_quote(&net.hostname);
    vec![
        sudo_sh(password, &format!("echo {} > /etc/hostname", host)),
        sudo_sh(
            password,
            &format!(
                "sed -i '/127.0.1.1/d' /etc/hosts && echo {} >> /etc/hosts",
                sh_quote(&format!("127.0.1.1 {}", net.hostname))
            ),
        ),
        sudo_sh(password, &format!("hostnamectl set-hostname {}", host)),
        sudo_sh(password, "rm -f /etc/netplan/*"),
        sudo_sh(
            password,
            "echo 'network: {config: disabled}' > /etc/cloud/cloud.cfg.d/99-disable-network-config.cfg",
        ),
        sudo_sh(
            password,
            &format!(
                "printf '%s' {} > /etc/netplan/01-netcfg.yaml",
                sh_quote(&netplan_yaml(net, interface))
            ),
        ),
        sudo_sh(password, "netplan apply && shutdown now"),
    ]
}

/// CentOS/RHEL 命令序列（以 root 执行）
pub fn centos_commands(net: &GuestNetworkSettings, interface: &str) -> Vec<String> {
    let mut ifcfg = format!(
        "DEVICE={iface}\nBOOTPROTO=none\nONBOOT=yes\nIPADDR={ip}\nNETMASK={mask}\n",
        iface = interface,
        ip = net.ip,
        mask = net.netmask(),
    );
    if let Some(gateway) = &net.gateway {
        ifcfg.push_str(&format!("GATEWAY={}\n", gateway));
    }
    if let Some(dns) = &net.dns {
        ifcfg.push_str(&format!("DNS1={}\n", dns));
    }

    let host = sh_quote(&net.hostname);
    let localhost_line = sh_quote(&format!("127.0.0.1 localhost {}", net.hostname));
    vec![
        format!(
            "cat > /etc/sysconfig/network-scripts/ifcfg-{} <<'EOF'\n{}EOF",
            interface, ifcfg
        ),
        format!("echo {} > /etc/hostname", host),
        format!("hostnamectl set-hostname {}", host),
        "sed -i '/127.0.1.1/d' /etc/hosts || true".to_string(),
        format!(
            "grep -q '^127.0.0.1' /etc/hosts && sed -i 's/^127.0.0.1.*/127.0.0.1 localhost {host}/' /etc/hosts || echo {line} >> /etc/hosts",
            host = net.hostname,
            line = localhost_line
        ),
        "systemctl restart network".to_string(),
    ]
}

// ============================================
// 执行
// ============================================

/// 在 Guest 内启动程序；`wait` 且配置允许时等待退出并检查退出码
pub async fn run_guest_command(
    ctx: &BatchContext,
    vm: &VmRef,
    auth: &GuestAuth,
    program: &GuestProgram,
    wait: bool,
) -> Result<i64> {
    debug!("在 {} 中执行: {} {:?}", vm.name, program.path, program.arguments);
    let pid = ctx.session().start_program_in_guest(vm, auth, program).await?;
    debug!("Guest 进程已启动, PID: {}", pid);

    if wait && ctx.settings.wait_for_guest_commands {
        let code = wait_guest_exit(ctx, vm, auth, pid).await?;
        if code != 0 {
            return Err(ExecutorError::GuestCommandFailed(format!(
                "{} 退出码 {}",
                program.path, code
            )));
        }
    }

    Ok(pid)
}

async fn wait_guest_exit(ctx: &BatchContext, vm: &VmRef, auth: &GuestAuth, pid: i64) -> Result<i32> {
    let settings: &ExecutorSettings = &ctx.settings;
    let deadline = Instant::now() + settings.guest_command_timeout();

    loop {
        if let Some(code) = ctx.session().guest_process_exit_code(vm, auth, pid).await? {
            return Ok(code);
        }
        if Instant::now() >= deadline {
            return Err(ExecutorError::GuestCommandFailed(format!(
                "进程 {} 在 {:?} 内未退出",
                pid,
                settings.guest_command_timeout()
            )));
        }
        tokio::time::sleep(settings.guest_command_poll()).await;
    }
}

/// 定制结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomizeOutcome {
    Customized(OsFamily),
    /// 不支持的系统，已跳过
    Skipped(OsFamily),
}

/// 定制 Guest 系统：开机、等待就绪，再按系统族写入配置
pub async fn customize_vm(
    ctx: &BatchContext,
    vm: &VmRef,
    config: &VmConfig,
    pinger: &dyn Pinger,
) -> Result<CustomizeOutcome> {
    let identity = ctx.session().guest_identity(vm).await?;
    let family = classify_os(&identity);
    info!("🔍 检测到操作系统: {} ({})", family, vm.name);

    if !family.is_supported() {
        warn!("⚠️  暂不支持定制 {} 系统，跳过 {}", family, vm.name);
        return Ok(CustomizeOutcome::Skipped(family));
    }

    let net = GuestNetworkSettings::from_config(config)?;
    let auth = GuestAuth::new(
        config.os_user.as_deref().unwrap_or(family.default_user()),
        config.os_password.as_deref().unwrap_or_default(),
    );

    power_on(ctx, vm).await?;
    wait_for_guest_ready(ctx, vm, pinger).await?;

    match family {
        OsFamily::Windows => customize_windows(ctx, vm, &auth, &net).await?,
        OsFamily::Ubuntu | OsFamily::Debian => customize_ubuntu(ctx, vm, &auth, &net).await?,
        OsFamily::Centos | OsFamily::Redhat => customize_centos(ctx, vm, &auth, &net).await?,
        OsFamily::Linux => customize_generic_linux(ctx, vm, &auth, &net).await?,
        OsFamily::RedOs | OsFamily::Astra | OsFamily::Unknown => {
            return Ok(CustomizeOutcome::Skipped(family));
        }
    }

    info!("✅ {} 系统定制完成: {}", family, vm.name);
    Ok(CustomizeOutcome::Customized(family))
}

async fn customize_windows(
    ctx: &BatchContext,
    vm: &VmRef,
    auth: &GuestAuth,
    net: &GuestNetworkSettings,
) -> Result<()> {
    info!("🪟 配置 Windows 网络与主机名: {}", vm.name);
    let program = GuestProgram::powershell(&windows_script(net));
    run_guest_command(ctx, vm, auth, &program, true).await?;
    Ok(())
}

async fn customize_ubuntu(
    ctx: &BatchContext,
    vm: &VmRef,
    auth: &GuestAuth,
    net: &GuestNetworkSettings,
) -> Result<()> {
    info!("🐧 配置 Ubuntu/Debian 网络与主机名: {}", vm.name);
    let commands = ubuntu_commands(net, &auth.password, &ctx.settings.netplan_interface);
    let last = commands.len().saturating_sub(1);

    for (i, command) in commands.iter().enumerate() {
        // 最后一步会关机，Guest Agent 来不及报告退出码
        run_guest_command(ctx, vm, auth, &GuestProgram::shell(command), i != last).await?;
    }
    Ok(())
}

async fn customize_centos(
    ctx: &BatchContext,
    vm: &VmRef,
    auth: &GuestAuth,
    net: &GuestNetworkSettings,
) -> Result<()> {
    info!("🐧 配置 CentOS/RHEL 网络与主机名: {}", vm.name);
    for command in centos_commands(net, &ctx.settings.ifcfg_interface) {
        run_guest_command(ctx, vm, auth, &GuestProgram::shell(&command), true).await?;
    }
    Ok(())
}

async fn customize_generic_linux(
    ctx: &BatchContext,
    vm: &VmRef,
    auth: &GuestAuth,
    net: &GuestNetworkSettings,
) -> Result<()> {
    let ubuntu_err = match customize_ubuntu(ctx, vm, auth, net).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    warn!("⚠️  Ubuntu 方式配置失败: {}，改用 CentOS 方式", ubuntu_err);

    customize_centos(ctx, vm, auth, net).await.map_err(|centos_err| {
        ExecutorError::operation_failed(
            "配置 Linux",
            format!("Ubuntu 方式: {}; CentOS 方式: {}", ubuntu_err, centos_err),
        )
    })
}
