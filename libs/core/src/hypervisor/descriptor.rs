//! Structured descriptors exchanged with the hypervisor.
//!
//! The libvirt backend renders these as XML; the in-memory backend stores
//! them as-is.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use virter_networking::{DhcpHost, Ipv4Network, NetworkError};

/// Volume capacity with its unit, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub value: u64,
    pub unit: String,
}

impl Capacity {
    /// Capacity expressed in bytes.
    pub fn bytes(value: u64) -> Self {
        Self {
            value,
            unit: "B".to_string(),
        }
    }

    /// Normalise to a byte count. Unknown units are treated as bytes.
    pub fn to_bytes(&self) -> u64 {
        let factor: u64 = match self.unit.as_str() {
            "K" | "KiB" => 1 << 10,
            "M" | "MiB" => 1 << 20,
            "G" | "GiB" => 1 << 30,
            "T" | "TiB" => 1 << 40,
            "KB" => 1_000,
            "MB" => 1_000_000,
            "GB" => 1_000_000_000,
            "TB" => 1_000_000_000_000,
            _ => 1,
        };
        self.value.saturating_mul(factor)
    }
}

/// On-disk format of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    #[default]
    Qcow2,
    Raw,
}

impl VolumeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qcow2" => Ok(VolumeFormat::Qcow2),
            "raw" => Ok(VolumeFormat::Raw),
            other => Err(format!("unsupported volume format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeTarget {
    pub format: VolumeFormat,
}

/// Backing file of a copy-on-write volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingStore {
    pub path: String,
    pub format: VolumeFormat,
}

/// Storage volume descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub name: String,
    pub capacity: Capacity,
    pub target: VolumeTarget,
    pub backing_store: Option<BackingStore>,
}

impl VolumeDescriptor {
    /// Empty qcow2 volume with zero capacity.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capacity: Capacity::bytes(0),
            target: VolumeTarget::default(),
            backing_store: None,
        }
    }
}

/// Size information for a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeInfo {
    /// Virtual size in bytes.
    pub capacity: u64,
    /// Bytes actually allocated on the backend.
    pub allocation: u64,
}

/// IP configuration of a managed network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIp {
    /// Address of the host side of the network, e.g. `192.168.122.1`.
    pub address: String,
    pub prefix: u8,
    /// `ipv4` or `ipv6`.
    pub family: String,
    /// Dynamic range handed out by the DHCP server, if any.
    pub dhcp_range: Option<(String, String)>,
    /// Static DHCP host entries.
    pub hosts: Vec<DhcpHost>,
}

/// Managed network descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub name: String,
    pub bridge: Option<String>,
    /// Forward mode (`nat`, `route`, ...); `None` for an isolated network.
    pub forward: Option<String>,
    pub domain: Option<String>,
    pub ips: Vec<NetworkIp>,
}

impl NetworkDescriptor {
    /// The first IPv4 section of the network.
    pub fn ipv4(&self) -> Option<&NetworkIp> {
        self.ips.iter().find(|ip| ip.family == "ipv4")
    }

    /// The IPv4 network used for VM addressing.
    pub fn ipv4_network(&self) -> Result<Ipv4Network, NetworkError> {
        let ip = self
            .ipv4()
            .ok_or_else(|| NetworkError::NotIpv4(format!("network {} has no IPv4 address", self.name)))?;
        let address = virter_networking::parse_ipv4(&ip.address)?;
        Ipv4Network::new(address, ip.prefix)
    }

    /// All static DHCP host entries across IPv4 sections.
    pub fn dhcp_hosts(&self) -> Vec<DhcpHost> {
        self.ips
            .iter()
            .filter(|ip| ip.family == "ipv4")
            .flat_map(|ip| ip.hosts.iter().cloned())
            .collect()
    }
}

/// Kind of disk device attached to a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDisk {
    pub device: DiskDevice,
    pub pool: String,
    pub volume: String,
    pub format: VolumeFormat,
    /// Bus name (`virtio`, `scsi`, `sata`, `ide`).
    pub bus: String,
    /// Guest device name (`vda`, `sda`, ...).
    pub target_dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInterface {
    pub network: String,
    pub mac: String,
    pub model: String,
}

/// Domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub name: String,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub disks: Vec<DomainDisk>,
    pub interfaces: Vec<DomainInterface>,
}

impl DomainDescriptor {
    /// MAC addresses of all interfaces.
    pub fn macs(&self) -> impl Iterator<Item = &str> {
        self.interfaces.iter().map(|i| i.mac.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_units() {
        assert_eq!(Capacity::bytes(10).to_bytes(), 10);
        let gib = Capacity {
            value: 2,
            unit: "GiB".to_string(),
        };
        assert_eq!(gib.to_bytes(), 2 << 30);
        let kb = Capacity {
            value: 3,
            unit: "KB".to_string(),
        };
        assert_eq!(kb.to_bytes(), 3_000);
    }

    #[test]
    fn test_volume_format_parse() {
        assert_eq!("raw".parse::<VolumeFormat>().unwrap(), VolumeFormat::Raw);
        assert_eq!(VolumeFormat::Qcow2.to_string(), "qcow2");
        assert!("vmdk".parse::<VolumeFormat>().is_err());
    }

    #[test]
    fn test_network_ipv4_required() {
        let desc = NetworkDescriptor {
            name: "v6only".to_string(),
            bridge: None,
            forward: None,
            domain: None,
            ips: vec![NetworkIp {
                address: "fd00::1".to_string(),
                prefix: 64,
                family: "ipv6".to_string(),
                dhcp_range: None,
                hosts: vec![],
            }],
        };
        assert!(desc.ipv4_network().is_err());
    }
}
