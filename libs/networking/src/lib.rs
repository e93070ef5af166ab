//! Networking utilities for virter.
//!
//! This library provides helpers for:
//! - IPv4 network arithmetic (addresses as 32-bit big-endian integers)
//! - Mapping VM IDs to host offsets, addresses and MAC addresses
//! - DHCP host entries and leases as reported by the hypervisor

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Only IPv4 networks can be used for VM addressing.
    #[error("unsupported address family: {0} is not IPv4")]
    NotIpv4(String),

    /// Address is outside the network.
    #[error("address {addr} is not contained in network {network}")]
    NotContained { addr: Ipv4Addr, network: String },

    /// Offset does not fit in the network.
    #[error("offset {offset} exceeds the host capacity of network {network}")]
    OffsetOutOfRange { offset: u32, network: String },

    /// Invalid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
}

// ============================================================================
// Address arithmetic
// ============================================================================

/// Convert an IPv4 address to its big-endian integer value.
pub fn ip_to_u32(addr: Ipv4Addr) -> u32 {
    u32::from_be_bytes(addr.octets())
}

/// Convert a big-endian integer value to an IPv4 address.
pub fn u32_to_ip(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value.to_be_bytes())
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    u32_to_ip(ip_to_u32(addr) & prefix_mask(prefix_len))
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

/// Convert a dotted netmask (e.g. 255.255.255.0) to a prefix length.
pub fn netmask_to_prefix(mask: Ipv4Addr) -> Result<u8, NetworkError> {
    let bits = ip_to_u32(mask);
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(NetworkError::InvalidPrefix(format!(
            "non-contiguous netmask {}",
            mask
        )));
    }
    Ok(prefix as u8)
}

/// Parse an address string, rejecting anything that is not IPv4.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, NetworkError> {
    match IpAddr::from_str(s.trim()) {
        Ok(IpAddr::V4(addr)) => Ok(addr),
        Ok(IpAddr::V6(_)) => Err(NetworkError::NotIpv4(s.to_string())),
        Err(_) => Err(NetworkError::InvalidAddress(s.to_string())),
    }
}

// ============================================================================
// IPv4 networks
// ============================================================================

/// An IPv4 network the VMs are attached to.
///
/// `address` keeps the address as configured (usually the host side of the
/// bridge, e.g. `192.168.122.1`); offsets are computed against the masked
/// base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Network {
    /// Address as configured on the network.
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Network {
    /// Create a new network.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "192.168.122.1/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = parse_ipv4(addr_str)?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Build from an address and a dotted netmask.
    pub fn from_netmask(address: &str, netmask: &str) -> Result<Self, NetworkError> {
        let address = parse_ipv4(address)?;
        let prefix_len = netmask_to_prefix(parse_ipv4(netmask)?)?;
        Self::new(address, prefix_len)
    }

    /// The masked base address of the network.
    pub fn base(&self) -> Ipv4Addr {
        mask_ipv4(self.address, self.prefix_len)
    }

    /// The dotted netmask.
    pub fn netmask(&self) -> Ipv4Addr {
        u32_to_ip(prefix_mask(self.prefix_len))
    }

    /// Check if an address is within this network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.base()
    }

    /// Number of addresses in the network.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    /// Largest offset usable for a host (excludes the broadcast address).
    pub fn max_host_offset(&self) -> u32 {
        self.size().saturating_sub(2) as u32
    }

    /// Offset of an address relative to the network base.
    pub fn offset_of(&self, addr: Ipv4Addr) -> Result<u32, NetworkError> {
        if !self.contains(addr) {
            return Err(NetworkError::NotContained {
                addr,
                network: self.to_string(),
            });
        }
        Ok(ip_to_u32(addr) - ip_to_u32(self.base()))
    }

    /// Address at a given offset from the network base.
    pub fn address_at(&self, offset: u32) -> Result<Ipv4Addr, NetworkError> {
        if u64::from(offset) >= self.size() {
            return Err(NetworkError::OffsetOutOfRange {
                offset,
                network: self.to_string(),
            });
        }
        Ok(u32_to_ip(ip_to_u32(self.base()) + offset))
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Network {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

// ============================================================================
// MAC addresses
// ============================================================================

/// Locally administered QEMU/KVM OUI used for generated MACs.
pub const QEMU_MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

/// Derive the deterministic MAC address for a VM ID.
///
/// The ID occupies the low three octets, big-endian.
pub fn mac_for_id(id: u32) -> String {
    let b = id.to_be_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        QEMU_MAC_PREFIX[0], QEMU_MAC_PREFIX[1], QEMU_MAC_PREFIX[2], b[1], b[2], b[3]
    )
}

/// Normalise a MAC address to lower-case colon-separated form.
pub fn normalize_mac(mac: &str) -> Result<String, NetworkError> {
    let parts: Vec<&str> = mac.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(NetworkError::InvalidMac(mac.to_string()));
    }

    let mut out = Vec::with_capacity(6);
    for part in parts {
        let byte =
            u8::from_str_radix(part, 16).map_err(|_| NetworkError::InvalidMac(mac.to_string()))?;
        out.push(format!("{:02x}", byte));
    }
    Ok(out.join(":"))
}

// ============================================================================
// DHCP
// ============================================================================

/// A static MAC -> IP mapping in the network's DHCP configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpHost {
    pub mac: String,
    pub ip: Ipv4Addr,
}

impl DhcpHost {
    pub fn new(mac: &str, ip: Ipv4Addr) -> Self {
        Self {
            mac: mac.to_lowercase(),
            ip,
        }
    }
}

/// An active DHCP lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_offset_within_network() {
        let net = Ipv4Network::from_cidr("192.168.0.0/24").unwrap();
        let offset = net.offset_of("192.168.0.13".parse().unwrap()).unwrap();
        assert_eq!(offset, 13);
    }

    #[test]
    fn test_offset_not_contained() {
        let net = Ipv4Network::from_cidr("10.0.0.0/24").unwrap();
        let err = net.offset_of("192.168.0.13".parse().unwrap()).unwrap_err();
        assert!(matches!(err, NetworkError::NotContained { .. }));
    }

    #[test]
    fn test_offset_uses_masked_base() {
        let net = Ipv4Network::from_cidr("192.168.122.1/24").unwrap();
        assert_eq!(net.base(), Ipv4Addr::new(192, 168, 122, 0));
        assert_eq!(
            net.address_at(7).unwrap(),
            Ipv4Addr::new(192, 168, 122, 7)
        );
    }

    #[rstest]
    #[case("192.168.0.0/24", 254)]
    #[case("10.0.0.0/16", 65534)]
    #[case("10.0.0.0/30", 2)]
    fn test_max_host_offset(#[case] cidr: &str, #[case] expected: u32) {
        let net = Ipv4Network::from_cidr(cidr).unwrap();
        assert_eq!(net.max_host_offset(), expected);
    }

    #[test]
    fn test_address_at_out_of_range() {
        let net = Ipv4Network::from_cidr("192.168.0.0/24").unwrap();
        assert!(net.address_at(256).is_err());
    }

    #[test]
    fn test_ipv6_rejected() {
        let err = Ipv4Network::from_cidr("fd00::/64").unwrap_err();
        assert!(matches!(err, NetworkError::NotIpv4(_)));
    }

    #[test]
    fn test_netmask_to_prefix() {
        assert_eq!(
            netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)).unwrap(),
            24
        );
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 0, 0)).unwrap(), 16);
        assert!(netmask_to_prefix(Ipv4Addr::new(255, 0, 255, 0)).is_err());
    }

    #[test]
    fn test_from_netmask() {
        let net = Ipv4Network::from_netmask("192.168.122.1", "255.255.255.0").unwrap();
        assert_eq!(net.prefix_len, 24);
        assert_eq!(net.to_string(), "192.168.122.1/24");
    }

    #[test]
    fn test_mac_for_id() {
        assert_eq!(mac_for_id(7), "52:54:00:00:00:07");
        assert_eq!(mac_for_id(0x01_02_03), "52:54:00:01:02:03");
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("52-54-00-AB-cd-0F").unwrap(),
            "52:54:00:ab:cd:0f"
        );
        assert!(normalize_mac("52:54:00").is_err());
        assert!(normalize_mac("zz:54:00:00:00:00").is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_offset_roundtrip(offset in 0u32..65536) {
            let net = Ipv4Network::from_cidr("10.1.0.0/16").unwrap();
            let addr = net.address_at(offset).unwrap();
            proptest::prop_assert_eq!(net.offset_of(addr).unwrap(), offset);
        }
    }
}
