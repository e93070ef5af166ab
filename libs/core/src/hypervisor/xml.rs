//! libvirt XML rendering and the small subset of parsing virter needs.
//!
//! Documents are rendered with `format!`; parsing builds a lightweight
//! element tree that tolerates declarations, comments and both quote styles.

use std::fmt::Write as _;

use virter_networking::{netmask_to_prefix, parse_ipv4, DhcpHost};

use super::{
    BackingStore, Capacity, DiskDevice, DomainDescriptor, DomainDisk, DomainInterface,
    HypervisorError, NetworkDescriptor, NetworkIp, VolumeDescriptor, VolumeFormat, VolumeTarget,
};

// ============================================================================
// Element tree
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a path of child names.
    pub fn path(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |el, name| el.child(name))
    }

    pub fn text(&self) -> &str {
        self.text.trim()
    }

    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(Element::text).filter(|t| !t.is_empty())
    }
}

fn malformed(msg: impl Into<String>) -> HypervisorError {
    HypervisorError::InvalidDescriptor(format!("malformed XML: {}", msg.into()))
}

/// Parse a document into its root element.
pub(crate) fn parse(input: &str) -> Result<Element, HypervisorError> {
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut rest = input;

    loop {
        let Some(lt) = rest.find('<') else {
            if !rest.trim().is_empty() {
                return Err(malformed("trailing text after root element"));
            }
            break;
        };
        if let Some(top) = stack.last_mut() {
            top.text.push_str(&unescape(&rest[..lt]));
        }
        rest = &rest[lt..];

        if rest.starts_with("<?") {
            let end = rest.find("?>").ok_or_else(|| malformed("unterminated declaration"))?;
            rest = &rest[end + 2..];
        } else if rest.starts_with("<!--") {
            let end = rest.find("-->").ok_or_else(|| malformed("unterminated comment"))?;
            rest = &rest[end + 3..];
        } else if rest.starts_with("<!") {
            let end = rest.find('>').ok_or_else(|| malformed("unterminated doctype"))?;
            rest = &rest[end + 1..];
        } else if let Some(after) = rest.strip_prefix("</") {
            let end = after.find('>').ok_or_else(|| malformed("unterminated end tag"))?;
            let name = after[..end].trim();
            let el = stack
                .pop()
                .ok_or_else(|| malformed(format!("unexpected </{name}>")))?;
            if el.name != name {
                return Err(malformed(format!("expected </{}>, found </{}>", el.name, name)));
            }
            attach(&mut stack, &mut root, el)?;
            rest = &after[end + 1..];
        } else {
            let end = tag_end(rest).ok_or_else(|| malformed("unterminated start tag"))?;
            let inner = &rest[1..end];
            let (inner, self_closing) = match inner.strip_suffix('/') {
                Some(i) => (i, true),
                None => (inner, false),
            };
            let el = parse_start_tag(inner)?;
            if self_closing {
                attach(&mut stack, &mut root, el)?;
            } else {
                stack.push(el);
            }
            rest = &rest[end + 1..];
        }
    }

    if let Some(open) = stack.last() {
        return Err(malformed(format!("unclosed <{}>", open.name)));
    }
    root.ok_or_else(|| malformed("empty document"))
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    el: Element,
) -> Result<(), HypervisorError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(el),
        None if root.is_none() => *root = Some(el),
        None => return Err(malformed("multiple root elements")),
    }
    Ok(())
}

/// Index of the `>` closing a start tag, skipping quoted attribute values.
fn tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_start_tag(inner: &str) -> Result<Element, HypervisorError> {
    let inner = inner.trim();
    let name_end = inner
        .find(char::is_whitespace)
        .unwrap_or(inner.len());
    let name = &inner[..name_end];
    if name.is_empty() {
        return Err(malformed("empty tag name"));
    }

    let mut attrs = Vec::new();
    let mut rest = inner[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| malformed(format!("attribute without value in <{name}>")))?;
        let key = rest[..eq].trim().to_string();
        let value_part = rest[eq + 1..].trim_start();
        let quote = value_part
            .chars()
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .ok_or_else(|| malformed(format!("unquoted attribute {key} in <{name}>")))?;
        let close = value_part[1..]
            .find(quote)
            .ok_or_else(|| malformed(format!("unterminated attribute {key} in <{name}>")))?;
        attrs.push((key, unescape(&value_part[1..1 + close])));
        rest = value_part[close + 2..].trim_start();
    }

    Ok(Element {
        name: name.to_string(),
        attrs,
        ..Default::default()
    })
}

pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

// ============================================================================
// Volumes
// ============================================================================

pub(crate) fn volume_xml(desc: &VolumeDescriptor) -> String {
    let mut xml = String::new();
    let _ = writeln!(xml, "<volume>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&desc.name));
    let _ = writeln!(
        xml,
        "  <capacity unit='{}'>{}</capacity>",
        escape(&desc.capacity.unit),
        desc.capacity.value
    );
    let _ = writeln!(
        xml,
        "  <target>\n    <format type='{}'/>\n  </target>",
        desc.target.format
    );
    if let Some(backing) = &desc.backing_store {
        let _ = writeln!(
            xml,
            "  <backingStore>\n    <path>{}</path>\n    <format type='{}'/>\n  </backingStore>",
            escape(&backing.path),
            backing.format
        );
    }
    xml.push_str("</volume>\n");
    xml
}

fn format_of(el: Option<&Element>) -> Result<VolumeFormat, HypervisorError> {
    match el.and_then(|f| f.attr("type")) {
        Some(t) => t.parse().map_err(HypervisorError::InvalidDescriptor),
        None => Ok(VolumeFormat::Raw),
    }
}

pub(crate) fn parse_volume(xml: &str) -> Result<VolumeDescriptor, HypervisorError> {
    let root = parse(xml)?;
    if root.name != "volume" {
        return Err(malformed(format!("expected <volume>, found <{}>", root.name)));
    }

    let name = root
        .child_text("name")
        .ok_or_else(|| malformed("volume without name"))?
        .to_string();

    let capacity = match root.child("capacity") {
        Some(c) => Capacity {
            value: c
                .text()
                .parse()
                .map_err(|_| malformed(format!("invalid capacity {:?}", c.text())))?,
            unit: c.attr("unit").unwrap_or("bytes").to_string(),
        },
        None => Capacity::bytes(0),
    };

    let format = format_of(root.path(&["target", "format"]))?;

    let backing_store = match root.child("backingStore") {
        Some(b) => match b.child_text("path") {
            Some(path) => Some(BackingStore {
                path: path.to_string(),
                format: format_of(b.child("format"))?,
            }),
            None => None,
        },
        None => None,
    };

    Ok(VolumeDescriptor {
        name,
        capacity,
        target: VolumeTarget { format },
        backing_store,
    })
}

// ============================================================================
// Networks
// ============================================================================

pub(crate) fn dhcp_host_xml(host: &DhcpHost) -> String {
    format!("<host mac='{}' ip='{}'/>", escape(&host.mac), host.ip)
}

pub(crate) fn network_xml(desc: &NetworkDescriptor) -> String {
    let mut xml = String::new();
    let _ = writeln!(xml, "<network>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&desc.name));
    if let Some(mode) = &desc.forward {
        let _ = writeln!(xml, "  <forward mode='{}'/>", escape(mode));
    }
    if let Some(bridge) = &desc.bridge {
        let _ = writeln!(xml, "  <bridge name='{}' stp='on' delay='0'/>", escape(bridge));
    }
    if let Some(domain) = &desc.domain {
        let _ = writeln!(xml, "  <domain name='{}'/>", escape(domain));
    }
    for ip in &desc.ips {
        let _ = writeln!(
            xml,
            "  <ip family='{}' address='{}' prefix='{}'>",
            escape(&ip.family),
            escape(&ip.address),
            ip.prefix
        );
        if ip.dhcp_range.is_some() || !ip.hosts.is_empty() {
            let _ = writeln!(xml, "    <dhcp>");
            if let Some((start, end)) = &ip.dhcp_range {
                let _ = writeln!(
                    xml,
                    "      <range start='{}' end='{}'/>",
                    escape(start),
                    escape(end)
                );
            }
            for host in &ip.hosts {
                let _ = writeln!(xml, "      {}", dhcp_host_xml(host));
            }
            let _ = writeln!(xml, "    </dhcp>");
        }
        let _ = writeln!(xml, "  </ip>");
    }
    xml.push_str("</network>\n");
    xml
}

pub(crate) fn parse_network(xml: &str) -> Result<NetworkDescriptor, HypervisorError> {
    let root = parse(xml)?;
    if root.name != "network" {
        return Err(malformed(format!("expected <network>, found <{}>", root.name)));
    }

    let name = root
        .child_text("name")
        .ok_or_else(|| malformed("network without name"))?
        .to_string();

    let mut ips = Vec::new();
    for ip in root.children_named("ip") {
        let family = ip.attr("family").unwrap_or("ipv4").to_string();
        let address = ip
            .attr("address")
            .ok_or_else(|| malformed("ip without address"))?
            .to_string();
        let prefix = match (ip.attr("prefix"), ip.attr("netmask")) {
            (Some(p), _) => p
                .parse()
                .map_err(|_| malformed(format!("invalid prefix {p}")))?,
            (None, Some(mask)) => {
                let mask = parse_ipv4(mask)
                    .map_err(|e| HypervisorError::InvalidDescriptor(e.to_string()))?;
                netmask_to_prefix(mask)
                    .map_err(|e| HypervisorError::InvalidDescriptor(e.to_string()))?
            }
            (None, None) if family == "ipv4" => 24,
            (None, None) => 64,
        };

        let dhcp = ip.child("dhcp");
        let dhcp_range = dhcp.and_then(|d| d.child("range")).and_then(|r| {
            Some((r.attr("start")?.to_string(), r.attr("end")?.to_string()))
        });

        let mut hosts = Vec::new();
        if let Some(dhcp) = dhcp {
            for host in dhcp.children_named("host") {
                // IPv6 and name-only host entries carry no IPv4/MAC mapping.
                let (Some(mac), Some(addr)) = (host.attr("mac"), host.attr("ip")) else {
                    continue;
                };
                if let Ok(addr) = parse_ipv4(addr) {
                    hosts.push(DhcpHost::new(mac, addr));
                }
            }
        }

        ips.push(NetworkIp {
            address,
            prefix,
            family,
            dhcp_range,
            hosts,
        });
    }

    Ok(NetworkDescriptor {
        name,
        bridge: root
            .child("bridge")
            .and_then(|b| b.attr("name"))
            .map(str::to_string),
        forward: root
            .child("forward")
            .map(|f| f.attr("mode").unwrap_or("nat").to_string()),
        domain: root
            .child("domain")
            .and_then(|d| d.attr("name"))
            .map(str::to_string),
        ips,
    })
}

// ============================================================================
// Domains
// ============================================================================

pub(crate) fn domain_xml(desc: &DomainDescriptor) -> String {
    let mut xml = String::new();
    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&desc.name));
    let _ = writeln!(xml, "  <memory unit='KiB'>{}</memory>", desc.memory_kib);
    let _ = writeln!(xml, "  <vcpu>{}</vcpu>", desc.vcpus);
    xml.push_str("  <os>\n    <type>hvm</type>\n    <boot dev='hd'/>\n  </os>\n");
    xml.push_str("  <features>\n    <acpi/>\n    <apic/>\n  </features>\n");
    xml.push_str("  <cpu mode='host-passthrough'/>\n");
    xml.push_str("  <on_poweroff>destroy</on_poweroff>\n");
    xml.push_str("  <on_reboot>restart</on_reboot>\n");
    xml.push_str("  <on_crash>destroy</on_crash>\n");
    xml.push_str("  <devices>\n");

    for disk in &desc.disks {
        let device = match disk.device {
            DiskDevice::Disk => "disk",
            DiskDevice::Cdrom => "cdrom",
        };
        let _ = writeln!(xml, "    <disk type='volume' device='{}'>", device);
        let _ = writeln!(
            xml,
            "      <driver name='qemu' type='{}' discard='unmap'/>",
            disk.format
        );
        let _ = writeln!(
            xml,
            "      <source pool='{}' volume='{}'/>",
            escape(&disk.pool),
            escape(&disk.volume)
        );
        let _ = writeln!(
            xml,
            "      <target dev='{}' bus='{}'/>",
            escape(&disk.target_dev),
            escape(&disk.bus)
        );
        if disk.device == DiskDevice::Cdrom {
            xml.push_str("      <readonly/>\n");
        }
        xml.push_str("    </disk>\n");
    }

    if desc.disks.iter().any(|d| d.bus == "scsi") {
        xml.push_str("    <controller type='scsi' model='virtio-scsi'/>\n");
    }

    for iface in &desc.interfaces {
        let _ = writeln!(xml, "    <interface type='network'>");
        let _ = writeln!(xml, "      <source network='{}'/>", escape(&iface.network));
        let _ = writeln!(xml, "      <mac address='{}'/>", escape(&iface.mac));
        let _ = writeln!(xml, "      <model type='{}'/>", escape(&iface.model));
        xml.push_str("    </interface>\n");
    }

    xml.push_str("    <serial type='pty'>\n      <target port='0'/>\n    </serial>\n");
    xml.push_str("    <console type='pty'>\n      <target type='serial' port='0'/>\n    </console>\n");
    xml.push_str("    <channel type='unix'>\n      <target type='virtio' name='org.qemu.guest_agent.0'/>\n    </channel>\n");
    xml.push_str("    <rng model='virtio'>\n      <backend model='random'>/dev/urandom</backend>\n    </rng>\n");
    xml.push_str("  </devices>\n");
    xml.push_str("</domain>\n");
    xml
}

fn memory_kib(el: &Element) -> Result<u64, HypervisorError> {
    let value: u64 = el
        .text()
        .parse()
        .map_err(|_| malformed(format!("invalid memory {:?}", el.text())))?;
    let bytes = Capacity {
        value,
        unit: el.attr("unit").unwrap_or("KiB").to_string(),
    }
    .to_bytes();
    Ok(bytes / 1024)
}

pub(crate) fn parse_domain(xml: &str) -> Result<DomainDescriptor, HypervisorError> {
    let root = parse(xml)?;
    if root.name != "domain" {
        return Err(malformed(format!("expected <domain>, found <{}>", root.name)));
    }

    let name = root
        .child_text("name")
        .ok_or_else(|| malformed("domain without name"))?
        .to_string();
    let memory_kib = match root.child("memory") {
        Some(m) => memory_kib(m)?,
        None => 0,
    };
    let vcpus = root
        .child_text("vcpu")
        .map(|v| v.parse().map_err(|_| malformed(format!("invalid vcpu {v}"))))
        .transpose()?
        .unwrap_or(1);

    let mut disks = Vec::new();
    let mut interfaces = Vec::new();
    if let Some(devices) = root.child("devices") {
        for disk in devices.children_named("disk") {
            let device = match disk.attr("device") {
                Some("cdrom") => DiskDevice::Cdrom,
                Some("disk") | None => DiskDevice::Disk,
                // floppies and LUNs are not managed by virter
                Some(_) => continue,
            };
            // Only pool-backed disks can be cleaned up through the pool.
            let Some(source) = disk.child("source") else {
                continue;
            };
            let (Some(pool), Some(volume)) = (source.attr("pool"), source.attr("volume")) else {
                continue;
            };
            let target = disk.child("target");
            disks.push(DomainDisk {
                device,
                pool: pool.to_string(),
                volume: volume.to_string(),
                format: format_of(disk.child("driver"))?,
                bus: target
                    .and_then(|t| t.attr("bus"))
                    .unwrap_or("virtio")
                    .to_string(),
                target_dev: target
                    .and_then(|t| t.attr("dev"))
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        for iface in devices.children_named("interface") {
            let Some(network) = iface.child("source").and_then(|s| s.attr("network")) else {
                continue;
            };
            interfaces.push(DomainInterface {
                network: network.to_string(),
                mac: iface
                    .child("mac")
                    .and_then(|m| m.attr("address"))
                    .unwrap_or_default()
                    .to_lowercase(),
                model: iface
                    .child("model")
                    .and_then(|m| m.attr("type"))
                    .unwrap_or("virtio")
                    .to_string(),
            });
        }
    }

    Ok(DomainDescriptor {
        name,
        memory_kib,
        vcpus,
        disks,
        interfaces,
    })
}
