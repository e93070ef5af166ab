//! VM lifecycle.
//!
//! A VM moves through absent → defined → running → stopped and ends up
//! either removed or committed into an image. [`VmManager::vm_run`] checks
//! every precondition before it touches anything, then performs its steps
//! in order without rolling back; [`VmManager::vm_rm`] converges from any
//! partial state and is safe to repeat.

pub mod args;
pub mod cloudinit;

mod access;
mod build;
mod remove;
mod run;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::image::ImageError;
use crate::layer::{LayerError, LayerStore};
use crate::network::{DhcpAllocator, DhcpError};
use crate::provision::ProvisionError;
use crate::ssh::{SshClient, SshError};
use crate::state::{StateStore, StateStoreError};

pub use access::VmSummary;
pub use args::{parse_size, ArgError, DiskArg};
pub use build::BuildConfig;
pub use cloudinit::{GenIsoImage, HostKeySource, IsoBuilder, SshKeygen};

/// Smallest boot volume handed to a VM.
pub const MIN_BOOT_SIZE: u64 = 10 << 30;

/// Suffix of the cloud-init seed volume.
pub const CIDATA_SUFFIX: &str = "-cidata";

/// Errors from VM lifecycle operations.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Dhcp(DhcpError),

    #[error("state store error: {0}")]
    State(#[from] StateStoreError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Argument(#[from] ArgError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("VM {0} already exists")]
    AlreadyExists(String),

    #[error("volume {volume} already exists in pool {pool}")]
    VolumeExists { pool: String, volume: String },

    #[error("VM ID {id} is already in use ({ip} in network {network})")]
    IdCollision { id: u32, ip: Ipv4Addr, network: String },

    #[error("MAC address {mac} is already used by domain {domain}")]
    MacInUse { mac: String, domain: String },

    #[error("VM not found: {0}")]
    NotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("VM {0} is running; request a shutdown to commit it")]
    NotStopped(String),

    #[error("VM {name} did not shut down within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("cancelled while waiting for VM {0}")]
    Cancelled(String),

    #[error("no IP address known for VM {0}")]
    NoAddress(String),

    #[error("invalid VM name {0:?}")]
    InvalidName(String),

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("{step} for VM {vm} failed: {source}")]
    Step {
        step: &'static str,
        vm: String,
        #[source]
        source: Box<VmError>,
    },
}

impl From<DhcpError> for VmError {
    fn from(err: DhcpError) -> Self {
        match err {
            DhcpError::IdCollision { id, ip, network } => VmError::IdCollision { id, ip, network },
            other => VmError::Dhcp(other),
        }
    }
}

impl VmError {
    pub fn is_not_found(&self) -> bool {
        match self {
            VmError::NotFound(_) => true,
            VmError::Hypervisor(e) => e.is_not_found(),
            VmError::Step { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            VmError::Cancelled(_) => true,
            VmError::Ssh(SshError::Cancelled(_)) => true,
            VmError::Provision(ProvisionError::Cancelled) => true,
            VmError::Step { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Attach step context to an error.
pub(crate) fn step<'a, E: Into<VmError>>(
    step: &'static str,
    vm: &'a str,
) -> impl FnOnce(E) -> VmError + 'a {
    move |e| VmError::Step {
        step,
        vm: vm.to_string(),
        source: Box::new(e.into()),
    }
}

/// Names usable as domain and volume names.
pub fn validate_name(name: &str) -> Result<(), VmError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with(['-', '.'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(VmError::InvalidName(name.to_string()))
    }
}

/// Settings of one VM to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub image: String,
    pub name: String,
    /// Requested ID; 0 picks a free one.
    pub id: u32,
    pub memory_kib: u64,
    pub vcpus: u32,
    /// Requested boot volume size in bytes.
    pub disk_size: Option<u64>,
    pub extra_disks: Vec<DiskArg>,
    pub static_dhcp: bool,
    /// Authorized keys for `user_name`.
    pub ssh_public_keys: Vec<String>,
    pub user_name: String,
    /// Wait until the VM accepts SSH before returning.
    pub wait_ssh: bool,
}

impl VmConfig {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            id: 0,
            memory_kib: 1 << 20,
            vcpus: 1,
            disk_size: None,
            extra_disks: Vec::new(),
            static_dhcp: false,
            ssh_public_keys: Vec::new(),
            user_name: "root".to_string(),
            wait_ssh: false,
        }
    }
}

/// Boot volume name of VM `name`.
pub fn boot_volume(name: &str) -> String {
    name.to_string()
}

/// Cloud-init seed volume name of VM `name`.
pub fn cidata_volume(name: &str) -> String {
    format!("{name}{CIDATA_SUFFIX}")
}

/// Volume name of extra disk `disk` of VM `name`.
pub fn disk_volume(name: &str, disk: &str) -> String {
    format!("{name}-{disk}")
}

/// Orchestrates VMs against one pool and one network.
#[derive(Clone)]
pub struct VmManager {
    store: LayerStore,
    dhcp: DhcpAllocator,
    state: Arc<StateStore>,
    iso: Arc<dyn IsoBuilder>,
    host_keys: Arc<dyn HostKeySource>,
    ssh: SshClient,
    ping_count: u32,
    ping_period: Duration,
    shutdown_poll: Duration,
}

impl std::fmt::Debug for VmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmManager")
            .field("pool", &self.store.pool())
            .field("network", &self.dhcp.network())
            .field("ping_count", &self.ping_count)
            .field("ping_period", &self.ping_period)
            .finish_non_exhaustive()
    }
}

impl VmManager {
    pub fn new(
        store: LayerStore,
        network: impl Into<String>,
        state: Arc<StateStore>,
        ssh: SshClient,
    ) -> Self {
        let dhcp = DhcpAllocator::new(store.conn().clone(), network);
        Self {
            store,
            dhcp,
            state,
            iso: Arc::new(GenIsoImage),
            host_keys: Arc::new(SshKeygen),
            ssh,
            ping_count: 300,
            ping_period: Duration::from_secs(1),
            shutdown_poll: Duration::from_millis(500),
        }
    }

    pub fn with_iso_builder(mut self, iso: Arc<dyn IsoBuilder>) -> Self {
        self.iso = iso;
        self
    }

    pub fn with_host_keys(mut self, host_keys: Arc<dyn HostKeySource>) -> Self {
        self.host_keys = host_keys;
        self
    }

    pub fn with_ping(mut self, count: u32, period: Duration) -> Self {
        self.ping_count = count.max(1);
        self.ping_period = period;
        self
    }

    pub fn with_shutdown_poll(mut self, poll: Duration) -> Self {
        self.shutdown_poll = poll;
        self
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    pub fn conn(&self) -> &Arc<dyn Hypervisor> {
        self.store.conn()
    }

    pub fn dhcp(&self) -> &DhcpAllocator {
        &self.dhcp
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn ssh(&self) -> &SshClient {
        &self.ssh
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("vm1", true)]
    #[case("build-centos.8_x", true)]
    #[case("", false)]
    #[case("-vm", false)]
    #[case("virter:work:x", false)]
    #[case("a/b", false)]
    fn test_validate_name(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_name(name).is_ok(), ok);
    }

    #[test]
    fn test_dhcp_collision_maps_to_vm_error() {
        let err: VmError = DhcpError::IdCollision {
            id: 7,
            ip: "192.168.0.7".parse().unwrap(),
            network: "default".to_string(),
        }
        .into();
        assert!(matches!(err, VmError::IdCollision { id: 7, .. }));
    }

    #[test]
    fn test_step_context_keeps_kind() {
        let err = step("domain start", "vm1")(HypervisorError::not_found(
            crate::hypervisor::ObjectKind::Domain,
            "vm1",
        ));
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("domain start for VM vm1 failed"));
    }

    #[test]
    fn test_volume_names() {
        assert_eq!(boot_volume("vm1"), "vm1");
        assert_eq!(cidata_volume("vm1"), "vm1-cidata");
        assert_eq!(disk_volume("vm1", "data"), "vm1-data");
    }
}
