//! In-process hypervisor.
//!
//! Holds pools, volumes (with their content), networks and domains in
//! memory. Behaves like libvirt for the subset virter relies on: volume
//! paths are stable keys, backing stores must exist at creation time,
//! transient domains disappear when stopped, DHCP host entries are unique.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use virter_networking::{DhcpHost, DhcpLease};

use super::{
    DhcpUpdate, DomainDescriptor, DownloadWriter, Hypervisor, HypervisorError, NetworkDescriptor,
    ObjectKind, UploadReader, VolumeDescriptor, VolumeInfo,
};

const POOL_ROOT: &str = "/var/lib/libvirt/images";

/// How a domain reacts to a graceful shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehaviour {
    /// The domain stops as soon as shutdown is requested.
    #[default]
    Immediate,
    /// The domain stops after it has been polled this many times.
    AfterPolls(u32),
    /// The guest ignores the request.
    Never,
}

struct Volume {
    desc: VolumeDescriptor,
    path: String,
    content: Vec<u8>,
}

struct Network {
    desc: NetworkDescriptor,
    active: bool,
    leases: Vec<DhcpLease>,
}

struct Domain {
    desc: DomainDescriptor,
    active: bool,
    persistent: bool,
    snapshots: Vec<String>,
    /// Remaining polls until a requested shutdown completes.
    stopping: Option<u32>,
}

#[derive(Default)]
struct State {
    pools: BTreeMap<String, BTreeMap<String, Volume>>,
    networks: BTreeMap<String, Network>,
    domains: BTreeMap<String, Domain>,
    failing_deletes: HashSet<String>,
}

impl State {
    fn pool(&self, pool: &str) -> Result<&BTreeMap<String, Volume>, HypervisorError> {
        self.pools
            .get(pool)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Pool, pool))
    }

    fn pool_mut(&mut self, pool: &str) -> Result<&mut BTreeMap<String, Volume>, HypervisorError> {
        self.pools
            .get_mut(pool)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Pool, pool))
    }

    fn volume(&self, pool: &str, name: &str) -> Result<&Volume, HypervisorError> {
        self.pool(pool)?
            .get(name)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Volume, name))
    }

    fn volume_mut(&mut self, pool: &str, name: &str) -> Result<&mut Volume, HypervisorError> {
        self.pool_mut(pool)?
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Volume, name))
    }

    fn path_exists(&self, path: &str) -> bool {
        self.pools
            .values()
            .flat_map(|vols| vols.values())
            .any(|v| v.path == path)
    }

    fn network(&self, name: &str) -> Result<&Network, HypervisorError> {
        self.networks
            .get(name)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Network, name))
    }

    fn network_mut(&mut self, name: &str) -> Result<&mut Network, HypervisorError> {
        self.networks
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Network, name))
    }

    fn domain(&self, name: &str) -> Result<&Domain, HypervisorError> {
        self.domains
            .get(name)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Domain, name))
    }

    fn domain_mut(&mut self, name: &str) -> Result<&mut Domain, HypervisorError> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Domain, name))
    }

    /// Mark a domain as stopped, dropping it if it was transient.
    fn stop_domain(&mut self, name: &str) {
        let remove = match self.domains.get_mut(name) {
            Some(dom) => {
                dom.active = false;
                dom.stopping = None;
                !dom.persistent
            }
            None => false,
        };
        if remove {
            self.domains.remove(name);
        }
    }
}

/// Hypervisor backed by process memory.
pub struct MemoryHypervisor {
    state: Mutex<State>,
    shutdown: ShutdownBehaviour,
}

impl MemoryHypervisor {
    /// Create an empty hypervisor without pools or networks.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            shutdown: ShutdownBehaviour::default(),
        }
    }

    /// Add an empty storage pool.
    pub fn with_pool(self, pool: &str) -> Self {
        self.lock().pools.entry(pool.to_string()).or_default();
        self
    }

    /// Add an active network.
    pub fn with_network(self, desc: NetworkDescriptor) -> Self {
        self.lock().networks.insert(
            desc.name.clone(),
            Network {
                desc,
                active: true,
                leases: Vec::new(),
            },
        );
        self
    }

    /// Set how domains react to shutdown requests.
    pub fn with_shutdown(mut self, behaviour: ShutdownBehaviour) -> Self {
        self.shutdown = behaviour;
        self
    }

    /// Record an active DHCP lease on a network.
    pub fn add_lease(&self, network: &str, lease: DhcpLease) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        let net = state.network_mut(network)?;
        net.leases.retain(|l| l.mac != lease.mac);
        net.leases.push(lease);
        Ok(())
    }

    /// Drop all leases held by a MAC address.
    pub fn remove_lease(&self, network: &str, mac: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        state.network_mut(network)?.leases.retain(|l| l.mac != mac);
        Ok(())
    }

    /// Attach a snapshot name to a domain.
    pub fn add_snapshot(&self, domain: &str, snapshot: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        state.domain_mut(domain)?.snapshots.push(snapshot.to_string());
        Ok(())
    }

    /// Make every future delete of the named volume fail.
    pub fn fail_deletes_of(&self, volume: &str) {
        self.lock().failing_deletes.insert(volume.to_string());
    }

    /// Undo [`fail_deletes_of`](Self::fail_deletes_of).
    pub fn allow_deletes_of(&self, volume: &str) {
        self.lock().failing_deletes.remove(volume);
    }

    /// Current content of a volume.
    pub fn volume_content(&self, pool: &str, name: &str) -> Result<Vec<u8>, HypervisorError> {
        Ok(self.lock().volume(pool, name)?.content.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // State stays consistent even if a holder panicked; every mutation
        // is completed before the guard drops.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MemoryHypervisor {
    async fn pool_exists(&self, pool: &str) -> Result<bool, HypervisorError> {
        Ok(self.lock().pools.contains_key(pool))
    }

    async fn volume_list(&self, pool: &str) -> Result<Vec<String>, HypervisorError> {
        Ok(self.lock().pool(pool)?.keys().cloned().collect())
    }

    async fn volume_create(
        &self,
        pool: &str,
        desc: &VolumeDescriptor,
    ) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        if state.pool(pool)?.contains_key(&desc.name) {
            return Err(HypervisorError::already_exists(ObjectKind::Volume, &desc.name));
        }
        if let Some(backing) = &desc.backing_store {
            if !state.path_exists(&backing.path) {
                return Err(HypervisorError::not_found(ObjectKind::Volume, &backing.path));
            }
        }

        debug!(pool = %pool, volume = %desc.name, "Creating volume");
        let path = format!("{}/{}/{}", POOL_ROOT, pool, desc.name);
        state.pool_mut(pool)?.insert(
            desc.name.clone(),
            Volume {
                desc: desc.clone(),
                path,
                content: Vec::new(),
            },
        );
        Ok(())
    }

    async fn volume_delete(&self, pool: &str, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        state.volume(pool, name)?;
        if state.failing_deletes.contains(name) {
            return Err(HypervisorError::Command {
                command: format!("vol-delete {name}"),
                stderr: "injected failure".to_string(),
            });
        }
        state.pool_mut(pool)?.remove(name);
        Ok(())
    }

    async fn volume_info(&self, pool: &str, name: &str) -> Result<VolumeInfo, HypervisorError> {
        let state = self.lock();
        let vol = state.volume(pool, name)?;
        let allocation = vol.content.len() as u64;
        Ok(VolumeInfo {
            capacity: vol.desc.capacity.to_bytes().max(allocation),
            allocation,
        })
    }

    async fn volume_path(&self, pool: &str, name: &str) -> Result<String, HypervisorError> {
        Ok(self.lock().volume(pool, name)?.path.clone())
    }

    async fn volume_descriptor(
        &self,
        pool: &str,
        name: &str,
    ) -> Result<VolumeDescriptor, HypervisorError> {
        Ok(self.lock().volume(pool, name)?.desc.clone())
    }

    async fn volume_lookup_by_path(
        &self,
        pool: &str,
        path: &str,
    ) -> Result<String, HypervisorError> {
        self.lock()
            .pool(pool)?
            .iter()
            .find(|(_, v)| v.path == path)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Volume, path))
    }

    async fn volume_upload(
        &self,
        pool: &str,
        name: &str,
        reader: UploadReader<'_>,
    ) -> Result<u64, HypervisorError> {
        // Fail early if the target is missing, before consuming the stream.
        self.lock().volume(pool, name)?;

        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        let len = content.len() as u64;

        self.lock().volume_mut(pool, name)?.content = content;
        Ok(len)
    }

    async fn volume_download(
        &self,
        pool: &str,
        name: &str,
        writer: DownloadWriter<'_>,
    ) -> Result<u64, HypervisorError> {
        let content = self.lock().volume(pool, name)?.content.clone();
        writer.write_all(&content).await?;
        writer.flush().await?;
        Ok(content.len() as u64)
    }

    async fn network_list(&self) -> Result<Vec<String>, HypervisorError> {
        Ok(self.lock().networks.keys().cloned().collect())
    }

    async fn network_descriptor(&self, name: &str) -> Result<NetworkDescriptor, HypervisorError> {
        Ok(self.lock().network(name)?.desc.clone())
    }

    async fn network_define(&self, desc: &NetworkDescriptor) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        match state.networks.get_mut(&desc.name) {
            Some(net) => net.desc = desc.clone(),
            None => {
                state.networks.insert(
                    desc.name.clone(),
                    Network {
                        desc: desc.clone(),
                        active: false,
                        leases: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn network_undefine(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        state.network(name)?;
        state.networks.remove(name);
        Ok(())
    }

    async fn network_start(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        let net = state.network_mut(name)?;
        if net.active {
            return Err(HypervisorError::InvalidOperation {
                kind: ObjectKind::Network,
                name: name.to_string(),
                reason: "network is already active".to_string(),
            });
        }
        net.active = true;
        Ok(())
    }

    async fn network_destroy(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        let net = state.network_mut(name)?;
        if !net.active {
            return Err(HypervisorError::InvalidOperation {
                kind: ObjectKind::Network,
                name: name.to_string(),
                reason: "network is not active".to_string(),
            });
        }
        net.active = false;
        net.leases.clear();
        Ok(())
    }

    async fn network_is_active(&self, name: &str) -> Result<bool, HypervisorError> {
        Ok(self.lock().network(name)?.active)
    }

    async fn network_update_dhcp_host(
        &self,
        network: &str,
        op: DhcpUpdate,
        host: &DhcpHost,
    ) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        let net = state.network_mut(network)?;
        let ip = net
            .desc
            .ips
            .iter_mut()
            .find(|ip| ip.family == "ipv4")
            .ok_or_else(|| HypervisorError::InvalidOperation {
                kind: ObjectKind::Network,
                name: network.to_string(),
                reason: "network has no IPv4 section".to_string(),
            })?;

        match op {
            DhcpUpdate::Add => {
                if ip.hosts.iter().any(|h| h.mac == host.mac || h.ip == host.ip) {
                    return Err(HypervisorError::InvalidOperation {
                        kind: ObjectKind::Network,
                        name: network.to_string(),
                        reason: format!(
                            "there is an existing dhcp host entry for {} or {}",
                            host.mac, host.ip
                        ),
                    });
                }
                ip.hosts.push(host.clone());
            }
            DhcpUpdate::Delete => {
                let before = ip.hosts.len();
                ip.hosts.retain(|h| !(h.mac == host.mac && h.ip == host.ip));
                if ip.hosts.len() == before {
                    return Err(HypervisorError::InvalidOperation {
                        kind: ObjectKind::Network,
                        name: network.to_string(),
                        reason: format!("couldn't locate a matching dhcp host entry for {}", host.mac),
                    });
                }
            }
        }
        Ok(())
    }

    async fn network_dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>, HypervisorError> {
        Ok(self.lock().network(network)?.leases.clone())
    }

    async fn domain_list(&self) -> Result<Vec<String>, HypervisorError> {
        Ok(self.lock().domains.keys().cloned().collect())
    }

    async fn domain_define(&self, desc: &DomainDescriptor) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        match state.domains.get_mut(&desc.name) {
            Some(dom) => {
                dom.desc = desc.clone();
                dom.persistent = true;
            }
            None => {
                state.domains.insert(
                    desc.name.clone(),
                    Domain {
                        desc: desc.clone(),
                        active: false,
                        persistent: true,
                        snapshots: Vec::new(),
                        stopping: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn domain_start(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        let disks = state.domain(name)?.desc.disks.clone();
        for disk in &disks {
            state.volume(&disk.pool, &disk.volume)?;
        }

        let dom = state.domain_mut(name)?;
        if dom.active {
            return Err(HypervisorError::InvalidOperation {
                kind: ObjectKind::Domain,
                name: name.to_string(),
                reason: "domain is already running".to_string(),
            });
        }
        dom.active = true;
        Ok(())
    }

    async fn domain_shutdown(&self, name: &str) -> Result<(), HypervisorError> {
        let behaviour = self.shutdown;
        let mut state = self.lock();
        if !state.domain(name)?.active {
            return Err(HypervisorError::InvalidOperation {
                kind: ObjectKind::Domain,
                name: name.to_string(),
                reason: "domain is not running".to_string(),
            });
        }

        match behaviour {
            ShutdownBehaviour::Immediate => state.stop_domain(name),
            ShutdownBehaviour::AfterPolls(n) => state.domain_mut(name)?.stopping = Some(n),
            ShutdownBehaviour::Never => {}
        }
        Ok(())
    }

    async fn domain_destroy(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        if !state.domain(name)?.active {
            return Err(HypervisorError::InvalidOperation {
                kind: ObjectKind::Domain,
                name: name.to_string(),
                reason: "domain is not running".to_string(),
            });
        }
        state.stop_domain(name);
        Ok(())
    }

    async fn domain_undefine(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        let dom = state.domain_mut(name)?;
        if !dom.persistent {
            return Err(HypervisorError::InvalidOperation {
                kind: ObjectKind::Domain,
                name: name.to_string(),
                reason: "cannot undefine transient domain".to_string(),
            });
        }
        if dom.active {
            dom.persistent = false;
        } else {
            state.domains.remove(name);
        }
        Ok(())
    }

    async fn domain_is_active(&self, name: &str) -> Result<bool, HypervisorError> {
        let mut state = self.lock();
        let (active, stopping) = {
            let dom = state.domain(name)?;
            (dom.active, dom.stopping)
        };
        match stopping {
            Some(0) => {
                state.stop_domain(name);
                Ok(false)
            }
            Some(n) => {
                state.domain_mut(name)?.stopping = Some(n - 1);
                Ok(true)
            }
            None => Ok(active),
        }
    }

    async fn domain_is_persistent(&self, name: &str) -> Result<bool, HypervisorError> {
        Ok(self.lock().domain(name)?.persistent)
    }

    async fn domain_descriptor(&self, name: &str) -> Result<DomainDescriptor, HypervisorError> {
        Ok(self.lock().domain(name)?.desc.clone())
    }

    async fn domain_snapshots(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        Ok(self.lock().domain(name)?.snapshots.clone())
    }

    async fn domain_snapshot_delete(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        let dom = state.domain_mut(name)?;
        let before = dom.snapshots.len();
        dom.snapshots.retain(|s| s != snapshot);
        if dom.snapshots.len() == before {
            return Err(HypervisorError::not_found(ObjectKind::Snapshot, snapshot));
        }
        Ok(())
    }
}
