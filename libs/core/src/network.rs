//! DHCP address allocation and network management.
//!
//! A VM ID is a host offset in the network: the VM's address is the network
//! base plus its ID, and its MAC carries the ID in the low three octets.
//! Free IDs are found by scanning the static DHCP host entries.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};
use virter_networking::{normalize_mac, DhcpHost, Ipv4Network, NetworkError};

use crate::hypervisor::{
    ignore_not_found, DhcpUpdate, Hypervisor, HypervisorError, NetworkDescriptor, NetworkIp,
};

/// Errors from DHCP allocation and network management.
#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Address(#[from] NetworkError),

    #[error("ID {id} is already in use by a DHCP host entry for {ip} in network {network}")]
    IdCollision { id: u32, ip: Ipv4Addr, network: String },

    #[error("no free VM ID in network {0}")]
    Exhausted(String),

    #[error("static DHCP requires an explicit VM ID")]
    StaticNeedsId,

    #[error("ID {id} is outside the host range 1..={max} of network {network}")]
    IdOutOfRange { id: u32, max: u32, network: String },
}

/// Allocator for one hypervisor-managed network.
#[derive(Clone)]
pub struct DhcpAllocator {
    conn: Arc<dyn Hypervisor>,
    network: String,
}

impl std::fmt::Debug for DhcpAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhcpAllocator")
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl DhcpAllocator {
    pub fn new(conn: Arc<dyn Hypervisor>, network: impl Into<String>) -> Self {
        Self {
            conn,
            network: network.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    async fn describe(&self) -> Result<(NetworkDescriptor, Ipv4Network), DhcpError> {
        let desc = self.conn.network_descriptor(&self.network).await?;
        let net = desc.ipv4_network()?;
        Ok((desc, net))
    }

    fn check_range(&self, net: &Ipv4Network, id: u32) -> Result<(), DhcpError> {
        let max = net.max_host_offset();
        if id == 0 || id > max {
            return Err(DhcpError::IdOutOfRange {
                id,
                max,
                network: self.network.clone(),
            });
        }
        Ok(())
    }

    /// Pick the ID for a new VM.
    ///
    /// A non-zero `wanted` ID is returned unchanged once checked against the
    /// existing host entries and leases. Zero scans downward from the highest host
    /// offset. With static DHCP the network is not consulted and an ID must
    /// be given.
    pub async fn get_vm_id(&self, wanted: u32, static_dhcp: bool) -> Result<u32, DhcpError> {
        if static_dhcp {
            return match wanted {
                0 => Err(DhcpError::StaticNeedsId),
                id => Ok(id),
            };
        }

        let (desc, net) = self.describe().await?;
        let leases = self.conn.network_dhcp_leases(&self.network).await?;
        let used: HashSet<u32> = desc
            .dhcp_hosts()
            .iter()
            .map(|h| h.ip)
            .chain(leases.iter().map(|l| l.ip))
            .filter_map(|ip| net.offset_of(ip).ok())
            .collect();

        if wanted != 0 {
            self.check_range(&net, wanted)?;
            if used.contains(&wanted) {
                return Err(DhcpError::IdCollision {
                    id: wanted,
                    ip: net.address_at(wanted)?,
                    network: self.network.clone(),
                });
            }
            return Ok(wanted);
        }

        (1..=net.max_host_offset())
            .rev()
            .find(|id| !used.contains(id))
            .ok_or_else(|| DhcpError::Exhausted(self.network.clone()))
    }

    /// Address of VM `id`.
    pub async fn ip_for_id(&self, id: u32) -> Result<Ipv4Addr, DhcpError> {
        let (_, net) = self.describe().await?;
        self.check_range(&net, id)?;
        Ok(net.address_at(id)?)
    }

    /// Register `mac` with the address of VM `id`.
    pub async fn add_dhcp_host(&self, mac: &str, id: u32) -> Result<Ipv4Addr, DhcpError> {
        let ip = self.ip_for_id(id).await?;
        let host = DhcpHost::new(&normalize_mac(mac)?, ip);
        self.conn
            .network_update_dhcp_host(&self.network, DhcpUpdate::Add, &host)
            .await?;
        info!(network = %self.network, mac = %host.mac, ip = %ip, "Added DHCP host entry");
        Ok(ip)
    }

    /// Remove every host entry of `mac`, then try to release its leases.
    pub async fn remove_mac_dhcp_entries(&self, mac: &str) -> Result<(), DhcpError> {
        let mac = normalize_mac(mac)?;
        let desc = self.conn.network_descriptor(&self.network).await?;

        for host in desc.dhcp_hosts().iter().filter(|h| h.mac == mac) {
            self.conn
                .network_update_dhcp_host(&self.network, DhcpUpdate::Delete, host)
                .await?;
            debug!(network = %self.network, mac = %mac, ip = %host.ip, "Removed DHCP host entry");
        }

        let leases = match self.conn.network_dhcp_leases(&self.network).await {
            Ok(leases) => leases,
            Err(e) => {
                warn!(network = %self.network, error = %e, "Failed to list DHCP leases");
                return Ok(());
            }
        };
        for lease in leases.iter().filter(|l| l.mac.eq_ignore_ascii_case(&mac)) {
            match &desc.bridge {
                Some(bridge) => release_lease(bridge, lease.ip, &mac).await,
                None => warn!(network = %self.network, "Network has no bridge, lease not released"),
            }
        }
        Ok(())
    }

    /// Address currently leased to `mac`, falling back to its host entry.
    pub async fn lookup_ip(&self, mac: &str) -> Result<Option<Ipv4Addr>, DhcpError> {
        let mac = normalize_mac(mac)?;
        let leases = self.conn.network_dhcp_leases(&self.network).await?;
        if let Some(lease) = leases.iter().find(|l| l.mac.eq_ignore_ascii_case(&mac)) {
            return Ok(Some(lease.ip));
        }
        let desc = self.conn.network_descriptor(&self.network).await?;
        Ok(desc.dhcp_hosts().into_iter().find(|h| h.mac == mac).map(|h| h.ip))
    }
}

/// Ask dnsmasq to drop a lease. Failures are logged.
async fn release_lease(bridge: &str, ip: Ipv4Addr, mac: &str) {
    let ip = ip.to_string();
    let output = Command::new("dhcp_release")
        .args([bridge, ip.as_str(), mac])
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            debug!(bridge = %bridge, ip = %ip, mac = %mac, "Released DHCP lease");
        }
        Ok(out) => warn!(
            bridge = %bridge,
            ip = %ip,
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "dhcp_release failed"
        ),
        Err(e) => warn!(bridge = %bridge, ip = %ip, error = %e, "Failed to run dhcp_release"),
    }
}

/// Parameters for a new network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub name: String,
    /// Host address and prefix, e.g. `192.168.125.1/24`.
    pub address: Ipv4Network,
    /// Hand out dynamic addresses to unknown MACs.
    pub dhcp: bool,
    pub forward: Option<String>,
    pub domain: Option<String>,
    pub bridge: Option<String>,
}

/// Summary of a network for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSummary {
    pub name: String,
    pub active: bool,
    pub bridge: Option<String>,
    pub forward: Option<String>,
    pub address: Option<String>,
}

/// A domain interface attached to a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedVm {
    pub vm: String,
    pub mac: String,
    pub ip: Option<Ipv4Addr>,
    pub hostname: Option<String>,
}

/// Define and start a network.
pub async fn network_add(conn: &dyn Hypervisor, config: &NetworkConfig) -> Result<(), DhcpError> {
    let net = &config.address;
    let dhcp_range = if config.dhcp {
        let first = net.address_at(2)?;
        let last = net.address_at(net.max_host_offset())?;
        Some((first.to_string(), last.to_string()))
    } else {
        None
    };

    let desc = NetworkDescriptor {
        name: config.name.clone(),
        bridge: config.bridge.clone(),
        forward: config.forward.clone(),
        domain: config.domain.clone(),
        ips: vec![NetworkIp {
            address: net.address.to_string(),
            prefix: net.prefix_len,
            family: "ipv4".to_string(),
            dhcp_range,
            hosts: Vec::new(),
        }],
    };

    conn.network_define(&desc).await?;
    conn.network_start(&config.name).await?;
    info!(network = %config.name, address = %net, "Added network");
    Ok(())
}

/// Stop and undefine a network. Removing a missing network succeeds.
pub async fn network_rm(conn: &dyn Hypervisor, name: &str) -> Result<(), DhcpError> {
    match conn.network_is_active(name).await {
        Ok(true) => ignore_not_found(conn.network_destroy(name).await)?,
        Ok(false) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    ignore_not_found(conn.network_undefine(name).await)?;
    info!(network = %name, "Removed network");
    Ok(())
}

pub async fn network_list(conn: &dyn Hypervisor) -> Result<Vec<NetworkSummary>, DhcpError> {
    let mut out = Vec::new();
    for name in conn.network_list().await? {
        let desc = match conn.network_descriptor(&name).await {
            Ok(d) => d,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        let active = conn.network_is_active(&name).await.unwrap_or(false);
        out.push(NetworkSummary {
            name,
            active,
            bridge: desc.bridge.clone(),
            forward: desc.forward.clone(),
            address: desc.ipv4().map(|ip| format!("{}/{}", ip.address, ip.prefix)),
        });
    }
    Ok(out)
}

/// Domains with an interface on `network`.
pub async fn network_list_attached(
    conn: &dyn Hypervisor,
    network: &str,
) -> Result<Vec<AttachedVm>, DhcpError> {
    let desc = conn.network_descriptor(network).await?;
    let leases = conn.network_dhcp_leases(network).await?;
    let hosts = desc.dhcp_hosts();

    let mut out = Vec::new();
    for vm in conn.domain_list().await? {
        let dom = match conn.domain_descriptor(&vm).await {
            Ok(d) => d,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        for iface in dom.interfaces.iter().filter(|i| i.network == network) {
            let lease = leases.iter().find(|l| l.mac.eq_ignore_ascii_case(&iface.mac));
            let ip = lease
                .map(|l| l.ip)
                .or_else(|| hosts.iter().find(|h| h.mac.eq_ignore_ascii_case(&iface.mac)).map(|h| h.ip));
            out.push(AttachedVm {
                vm: vm.clone(),
                mac: iface.mac.clone(),
                ip,
                hostname: lease.and_then(|l| l.hostname.clone()),
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{DomainDescriptor, DomainInterface, MemoryHypervisor};
    use virter_networking::{mac_for_id, DhcpLease};

    fn network(name: &str, address: &str, prefix: u8) -> NetworkDescriptor {
        NetworkDescriptor {
            name: name.to_string(),
            bridge: Some("virbr9".to_string()),
            forward: Some("nat".to_string()),
            domain: None,
            ips: vec![NetworkIp {
                address: address.to_string(),
                prefix,
                family: "ipv4".to_string(),
                dhcp_range: None,
                hosts: Vec::new(),
            }],
        }
    }

    fn allocator() -> (Arc<MemoryHypervisor>, DhcpAllocator) {
        let hv = Arc::new(MemoryHypervisor::new().with_network(network("vnet", "192.168.0.1", 24)));
        let alloc = DhcpAllocator::new(hv.clone(), "vnet");
        (hv, alloc)
    }

    #[tokio::test]
    async fn test_dhcp_mapping_is_stable() {
        let (_, alloc) = allocator();
        let mac = mac_for_id(7);

        let first = alloc.add_dhcp_host(&mac, 7).await.unwrap();
        alloc.remove_mac_dhcp_entries(&mac).await.unwrap();
        let second = alloc.add_dhcp_host(&mac, 7).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, "192.168.0.7".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_free_id_scan_skips_used() {
        let (_, alloc) = allocator();
        alloc.add_dhcp_host(&mac_for_id(5), 5).await.unwrap();
        assert_eq!(alloc.get_vm_id(0, false).await.unwrap(), 254);

        alloc.add_dhcp_host(&mac_for_id(254), 254).await.unwrap();
        assert_eq!(alloc.get_vm_id(0, false).await.unwrap(), 253);
    }

    #[tokio::test]
    async fn test_wanted_id_collision() {
        let (_, alloc) = allocator();
        alloc.add_dhcp_host(&mac_for_id(5), 5).await.unwrap();
        assert!(matches!(
            alloc.get_vm_id(5, false).await,
            Err(DhcpError::IdCollision { id: 5, .. })
        ));
        assert_eq!(alloc.get_vm_id(6, false).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_wanted_id_out_of_range() {
        let (_, alloc) = allocator();
        assert!(matches!(
            alloc.get_vm_id(255, false).await,
            Err(DhcpError::IdOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_static_dhcp() {
        let (_, alloc) = allocator();
        assert!(matches!(
            alloc.get_vm_id(0, true).await,
            Err(DhcpError::StaticNeedsId)
        ));
        assert_eq!(alloc.get_vm_id(12, true).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_exhausted_network() {
        let hv = Arc::new(MemoryHypervisor::new().with_network(network("tiny", "10.0.0.1", 30)));
        let alloc = DhcpAllocator::new(hv, "tiny");
        alloc.add_dhcp_host(&mac_for_id(1), 1).await.unwrap();
        alloc.add_dhcp_host(&mac_for_id(2), 2).await.unwrap();
        assert!(matches!(
            alloc.get_vm_id(0, false).await,
            Err(DhcpError::Exhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_prefers_lease() {
        let (hv, alloc) = allocator();
        let mac = mac_for_id(9);
        alloc.add_dhcp_host(&mac, 9).await.unwrap();
        assert_eq!(
            alloc.lookup_ip(&mac).await.unwrap(),
            Some("192.168.0.9".parse().unwrap())
        );

        hv.add_lease(
            "vnet",
            DhcpLease {
                mac: mac.clone(),
                ip: "192.168.0.200".parse().unwrap(),
                hostname: Some("vm9".to_string()),
            },
        )
        .unwrap();
        assert_eq!(
            alloc.lookup_ip(&mac).await.unwrap(),
            Some("192.168.0.200".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_network_add_rm() {
        let hv = MemoryHypervisor::new();
        let config = NetworkConfig {
            name: "lab".to_string(),
            address: "192.168.125.1/24".parse().unwrap(),
            dhcp: true,
            forward: Some("nat".to_string()),
            domain: None,
            bridge: None,
        };
        network_add(&hv, &config).await.unwrap();

        let listed = network_list(&hv).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].active);
        assert_eq!(listed[0].address.as_deref(), Some("192.168.125.1/24"));

        network_rm(&hv, "lab").await.unwrap();
        network_rm(&hv, "lab").await.unwrap();
        assert!(network_list(&hv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_attached() {
        let (hv, alloc) = allocator();
        let mac = mac_for_id(3);
        alloc.add_dhcp_host(&mac, 3).await.unwrap();
        hv.domain_define(&DomainDescriptor {
            name: "vm3".to_string(),
            memory_kib: 1024,
            vcpus: 1,
            disks: Vec::new(),
            interfaces: vec![DomainInterface {
                network: "vnet".to_string(),
                mac: mac.clone(),
                model: "virtio".to_string(),
            }],
        })
        .await
        .unwrap();

        let attached = network_list_attached(hv.as_ref(), "vnet").await.unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].vm, "vm3");
        assert_eq!(attached[0].ip, Some("192.168.0.3".parse().unwrap()));
    }
}
