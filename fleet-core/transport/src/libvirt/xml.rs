//! 域 XML 编辑
//!
//! 重配置通过“读取持久化 XML → 修改 → 重新 define”完成。
//! 这里只做有限的几处定点替换，不引入完整的 XML DOM。

use regex::Regex;

use crate::{DeviceKind, NetworkBacking, Result, TransportError, VirtualDevice};

/// 光驱设备键起始值
pub const CDROM_KEY_BASE: i32 = 3000;
/// 网卡设备键起始值
pub const ETHERNET_KEY_BASE: i32 = 4000;

fn re(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| TransportError::ParseError(e.to_string()))
}

/// 设置 vCPU 数量
pub fn set_vcpu(xml: &str, count: u32) -> Result<String> {
    let vcpu = re(r"<vcpu([^>]*)>\s*\d+\s*</vcpu>")?;
    if !vcpu.is_match(xml) {
        return Err(TransportError::ParseError("域 XML 缺少 <vcpu> 元素".to_string()));
    }
    // current 属性会限制在线 vCPU 数，重配置后去掉
    let current = re(r#"\s+current=['"]\d+['"]"#)?;
    Ok(vcpu
        .replace(xml, |caps: &regex::Captures| {
            let attrs = current.replace_all(&caps[1], "");
            format!("<vcpu{}>{}</vcpu>", attrs, count)
        })
        .into_owned())
}

/// 设置单插槽 CPU 拓扑
pub fn set_topology(xml: &str, cores: u32) -> Result<String> {
    let topology_elem = format!(
        "<topology sockets='1' dies='1' cores='{}' threads='1'/>",
        cores
    );

    let topology = re(r"<topology[^>]*/>")?;
    if topology.is_match(xml) {
        return Ok(topology.replace(xml, topology_elem.as_str()).into_owned());
    }

    let cpu_self_closing = re(r"<cpu((?:\s[^>]*)?)/>")?;
    if cpu_self_closing.is_match(xml) {
        return Ok(cpu_self_closing
            .replace(xml, |caps: &regex::Captures| {
                format!("<cpu{}>{}</cpu>", &caps[1], topology_elem)
            })
            .into_owned());
    }

    let cpu_open = re(r"<cpu((?:\s[^>]*)?)>")?;
    if cpu_open.is_match(xml) {
        return Ok(cpu_open
            .replace(xml, |caps: &regex::Captures| {
                format!("<cpu{}>{}", &caps[1], topology_elem)
            })
            .into_owned());
    }

    Ok(xml.replacen("</domain>", &format!("<cpu>{}</cpu></domain>", topology_elem), 1))
}

/// 设置内存大小（同时更新 memory 与 currentMemory）
pub fn set_memory(xml: &str, memory_mb: u64) -> Result<String> {
    let kib = memory_mb * 1024;
    let memory = re(r"<memory[^>]*>\s*\d+\s*</memory>")?;
    if !memory.is_match(xml) {
        return Err(TransportError::ParseError("域 XML 缺少 <memory> 元素".to_string()));
    }
    let xml = memory
        .replace(xml, format!("<memory unit='KiB'>{}</memory>", kib).as_str())
        .into_owned();

    let current = re(r"<currentMemory[^>]*>\s*\d+\s*</currentMemory>")?;
    Ok(current
        .replace(
            &xml,
            format!("<currentMemory unit='KiB'>{}</currentMemory>", kib).as_str(),
        )
        .into_owned())
}

/// 改写第 `index` 块网卡的网络后端，并把链路置为 up
pub fn set_interface_backing(xml: &str, index: usize, backing: &NetworkBacking) -> Result<String> {
    let interface = re(r"(?s)<interface\s[^>]*>(.*?)</interface>")?;
    let Some(m) = interface.find_iter(xml).nth(index) else {
        return Err(TransportError::ParseError(format!("域 XML 中不存在第 {} 块网卡", index)));
    };

    let source_elem = match backing {
        NetworkBacking::Standard { network } => format!("<source network='{}'/>", network),
        NetworkBacking::Distributed {
            switch_uuid,
            portgroup_key,
        } => format!(
            "<source network='{}' portgroup='{}'/>",
            switch_uuid, portgroup_key
        ),
    };

    let source = re(r"<source[^>]*/>")?;
    let link = re(r"<link[^>]*/>")?;

    let block = m.as_str();
    let open_end = block.find('>').map(|i| i + 1).unwrap_or(0);
    let mut inner = block[open_end..block.len() - "</interface>".len()].to_string();
    inner = source.replace_all(&inner, "").into_owned();
    inner = link.replace_all(&inner, "").into_owned();

    let rewritten = format!(
        "<interface type='network'>{}<link state='up'/>{}</interface>",
        source_elem, inner
    );

    let mut out = String::with_capacity(xml.len() + 64);
    out.push_str(&xml[..m.start()]);
    out.push_str(&rewritten);
    out.push_str(&xml[m.end()..]);
    Ok(out)
}

/// 移除第 `index` 个光驱的介质
pub fn eject_cdrom(xml: &str, index: usize) -> Result<String> {
    let cdrom = re(r#"(?s)<disk\s[^>]*device=['"]cdrom['"][^>]*>.*?</disk>"#)?;
    let Some(m) = cdrom.find_iter(xml).nth(index) else {
        return Err(TransportError::ParseError(format!("域 XML 中不存在第 {} 个光驱", index)));
    };

    let source = re(r"(?s)<source[^>]*/>|<source[^>]*>.*?</source>")?;
    let block = source.replace_all(m.as_str(), "").into_owned();

    let mut out = String::with_capacity(xml.len());
    out.push_str(&xml[..m.start()]);
    out.push_str(&block);
    out.push_str(&xml[m.end()..]);
    Ok(out)
}

/// 解析光驱与网卡设备
pub fn parse_devices(xml: &str) -> Result<Vec<VirtualDevice>> {
    let mut devices = Vec::new();

    let cdrom = re(r#"(?s)<disk\s[^>]*device=['"]cdrom['"][^>]*>(.*?)</disk>"#)?;
    let source = re(r"<source[^>]*>")?;
    for (i, caps) in cdrom.captures_iter(xml).enumerate() {
        devices.push(VirtualDevice {
            key: CDROM_KEY_BASE + i as i32,
            label: format!("CD/DVD drive {}", i + 1),
            kind: DeviceKind::CdRom {
                connected: source.is_match(&caps[1]),
            },
        });
    }

    let interface = re(r"(?s)<interface\s[^>]*>(.*?)</interface>")?;
    let network = re(r#"<source\s[^>]*(?:network|bridge)=['"]([^'"]+)['"]"#)?;
    for (i, caps) in interface.captures_iter(xml).enumerate() {
        devices.push(VirtualDevice {
            key: ETHERNET_KEY_BASE + i as i32,
            label: format!("Network adapter {}", i + 1),
            kind: DeviceKind::Ethernet {
                network: network.captures(&caps[1]).map(|c| c[1].to_string()),
            },
        });
    }

    Ok(devices)
}

/// 读取存储池的目标目录
pub fn pool_target_path(pool_xml: &str) -> Result<Option<String>> {
    let path = re(r"(?s)<target>.*?<path>([^<]+)</path>")?;
    Ok(path.captures(pool_xml).map(|c| c[1].trim().to_string()))
}

/// 统计磁盘（不含光驱）数量
pub fn count_disks(xml: &str) -> Result<usize> {
    let disk = re(r#"<disk\s[^>]*device=['"]disk['"]"#)?;
    Ok(disk.find_iter(xml).count())
}

/// libosinfo 元数据中的系统标识（如 `http://ubuntu.com/ubuntu/22.04`）
pub fn libosinfo_id(xml: &str) -> Result<Option<String>> {
    let os = re(r#"<libosinfo:os\s+id=['"]([^'"]+)['"]"#)?;
    Ok(os.captures(xml).map(|c| c[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"<domain type='kvm'>
  <name>web-01</name>
  <memory unit='KiB'>2097152</memory>
  <currentMemory unit='KiB'>2097152</currentMemory>
  <vcpu placement='static' current='1'>2</vcpu>
  <cpu mode='host-passthrough' check='none'/>
  <devices>
    <disk type='file' device='disk'>
      <source file='/var/lib/libvirt/images/web-01.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/iso/ubuntu.iso'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:12:34:56'/>
      <source bridge='br0'/>
      <model type='virtio'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn test_set_vcpu_drops_current() {
        let xml = set_vcpu(DOMAIN, 4).unwrap();
        assert!(xml.contains("<vcpu placement='static'>4</vcpu>"));
    }

    #[test]
    fn test_set_topology_expands_self_closing_cpu() {
        let xml = set_topology(DOMAIN, 4).unwrap();
        assert!(xml.contains(
            "<cpu mode='host-passthrough' check='none'><topology sockets='1' dies='1' cores='4' threads='1'/></cpu>"
        ));

        // 已有 topology 时直接替换
        let again = set_topology(&xml, 8).unwrap();
        assert!(again.contains("cores='8'"));
        assert!(!again.contains("cores='4'"));
    }

    #[test]
    fn test_set_memory_updates_both_elements() {
        let xml = set_memory(DOMAIN, 4096).unwrap();
        assert!(xml.contains("<memory unit='KiB'>4194304</memory>"));
        assert!(xml.contains("<currentMemory unit='KiB'>4194304</currentMemory>"));
    }

    #[test]
    fn test_set_interface_backing() {
        let backing = NetworkBacking::Standard {
            network: "prod-net".to_string(),
        };
        let xml = set_interface_backing(DOMAIN, 0, &backing).unwrap();
        assert!(xml.contains("<interface type='network'><source network='prod-net'/><link state='up'/>"));
        assert!(xml.contains("<mac address='52:54:00:12:34:56'/>"));
        assert!(!xml.contains("br0"));

        assert!(set_interface_backing(DOMAIN, 1, &backing).is_err());
    }

    #[test]
    fn test_eject_cdrom_keeps_disk_source() {
        let xml = eject_cdrom(DOMAIN, 0).unwrap();
        assert!(!xml.contains("ubuntu.iso"));
        assert!(xml.contains("web-01.qcow2"));
        assert!(xml.contains("<target dev='sda' bus='sata'/>"));
    }

    #[test]
    fn test_parse_devices() {
        let devices = parse_devices(DOMAIN).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].key, CDROM_KEY_BASE);
        assert_eq!(devices[0].kind, DeviceKind::CdRom { connected: true });
        assert_eq!(
            devices[1].kind,
            DeviceKind::Ethernet {
                network: Some("br0".to_string())
            }
        );

        let ejected = parse_devices(&eject_cdrom(DOMAIN, 0).unwrap()).unwrap();
        assert_eq!(ejected[0].kind, DeviceKind::CdRom { connected: false });
    }

    #[test]
    fn test_count_disks_and_os_metadata() {
        assert_eq!(count_disks(DOMAIN).unwrap(), 1);
        assert_eq!(libosinfo_id(DOMAIN).unwrap(), None);

        let with_meta = DOMAIN.replace(
            "<name>web-01</name>",
            "<name>web-01</name><metadata><libosinfo:libosinfo xmlns:libosinfo='http://libosinfo.org/xmlns/libvirt/domain/1.0'><libosinfo:os id='http://ubuntu.com/ubuntu/22.04'/></libosinfo:libosinfo></metadata>",
        );
        assert_eq!(
            libosinfo_id(&with_meta).unwrap(),
            Some("http://ubuntu.com/ubuntu/22.04".to_string())
        );
    }

    #[test]
    fn test_pool_target_path() {
        let pool = "<pool type='dir'><name>ssd</name><target><path>/data/ssd</path></target></pool>";
        assert_eq!(pool_target_path(pool).unwrap(), Some("/data/ssd".to_string()));
    }
}
