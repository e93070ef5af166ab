//! Hypervisor connection facade.
//!
//! Every other component talks to the hypervisor through the [`Hypervisor`]
//! trait. It mirrors the small set of remote procedures virter needs:
//! storage pools and volumes, managed networks and their DHCP tables, and
//! domains.
//!
//! Two backends are provided:
//! - [`MemoryHypervisor`]: in-process state, used for tests and dry runs
//! - [`VirshHypervisor`]: drives a libvirt daemon through the `virsh` CLI

mod descriptor;
mod memory;
mod virsh;
mod xml;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use descriptor::{
    BackingStore, Capacity, DiskDevice, DomainDescriptor, DomainDisk, DomainInterface,
    NetworkDescriptor, NetworkIp, VolumeDescriptor, VolumeFormat, VolumeInfo, VolumeTarget,
};
pub use memory::{MemoryHypervisor, ShutdownBehaviour};
pub use virsh::VirshHypervisor;

use virter_networking::{DhcpHost, DhcpLease};

/// Kind of hypervisor object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Pool,
    Volume,
    Network,
    Domain,
    Snapshot,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ObjectKind::Pool => "storage pool",
            ObjectKind::Volume => "storage volume",
            ObjectKind::Network => "network",
            ObjectKind::Domain => "domain",
            ObjectKind::Snapshot => "snapshot",
        };
        f.write_str(s)
    }
}

/// Errors from hypervisor operations.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("invalid operation on {kind} {name}: {reason}")]
    InvalidOperation {
        kind: ObjectKind,
        name: String,
        reason: String,
    },

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

impl HypervisorError {
    pub fn not_found(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Not found, and the missing object is of `kind`.
    pub fn is_not_found_of(&self, kind: ObjectKind) -> bool {
        matches!(self, Self::NotFound { kind: k, .. } if *k == kind)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Operation applied to a network's DHCP host table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpUpdate {
    Add,
    Delete,
}

/// Reader handed to [`Hypervisor::volume_upload`].
pub type UploadReader<'a> = &'a mut (dyn AsyncRead + Send + Unpin);

/// Writer handed to [`Hypervisor::volume_download`].
pub type DownloadWriter<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Hypervisor facade.
///
/// Implementations are shared across tasks without client-side locking;
/// callers must tolerate objects appearing and disappearing between calls.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // ---- storage --------------------------------------------------------

    /// Check that a storage pool exists.
    async fn pool_exists(&self, pool: &str) -> Result<bool, HypervisorError>;

    /// List volume names in a pool.
    async fn volume_list(&self, pool: &str) -> Result<Vec<String>, HypervisorError>;

    /// Create a volume from a descriptor.
    async fn volume_create(
        &self,
        pool: &str,
        desc: &VolumeDescriptor,
    ) -> Result<(), HypervisorError>;

    /// Delete a volume.
    async fn volume_delete(&self, pool: &str, name: &str) -> Result<(), HypervisorError>;

    /// Capacity and allocation of a volume.
    async fn volume_info(&self, pool: &str, name: &str) -> Result<VolumeInfo, HypervisorError>;

    /// Filesystem path (key) of a volume.
    async fn volume_path(&self, pool: &str, name: &str) -> Result<String, HypervisorError>;

    /// Current descriptor of a volume.
    async fn volume_descriptor(
        &self,
        pool: &str,
        name: &str,
    ) -> Result<VolumeDescriptor, HypervisorError>;

    /// Resolve a volume path back to its name within a pool.
    async fn volume_lookup_by_path(
        &self,
        pool: &str,
        path: &str,
    ) -> Result<String, HypervisorError>;

    /// Replace the content of a volume with the bytes of `reader`.
    async fn volume_upload(
        &self,
        pool: &str,
        name: &str,
        reader: UploadReader<'_>,
    ) -> Result<u64, HypervisorError>;

    /// Stream the content of a volume into `writer`.
    async fn volume_download(
        &self,
        pool: &str,
        name: &str,
        writer: DownloadWriter<'_>,
    ) -> Result<u64, HypervisorError>;

    // ---- networks -------------------------------------------------------

    async fn network_list(&self) -> Result<Vec<String>, HypervisorError>;

    async fn network_descriptor(&self, name: &str) -> Result<NetworkDescriptor, HypervisorError>;

    async fn network_define(&self, desc: &NetworkDescriptor) -> Result<(), HypervisorError>;

    async fn network_undefine(&self, name: &str) -> Result<(), HypervisorError>;

    async fn network_start(&self, name: &str) -> Result<(), HypervisorError>;

    async fn network_destroy(&self, name: &str) -> Result<(), HypervisorError>;

    async fn network_is_active(&self, name: &str) -> Result<bool, HypervisorError>;

    /// Add or delete a DHCP host entry in the live and persistent config.
    async fn network_update_dhcp_host(
        &self,
        network: &str,
        op: DhcpUpdate,
        host: &DhcpHost,
    ) -> Result<(), HypervisorError>;

    async fn network_dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>, HypervisorError>;

    // ---- domains --------------------------------------------------------

    /// Names of all defined and running domains.
    async fn domain_list(&self) -> Result<Vec<String>, HypervisorError>;

    async fn domain_define(&self, desc: &DomainDescriptor) -> Result<(), HypervisorError>;

    /// Start a defined domain.
    async fn domain_start(&self, name: &str) -> Result<(), HypervisorError>;

    /// Request a graceful shutdown.
    async fn domain_shutdown(&self, name: &str) -> Result<(), HypervisorError>;

    /// Stop a domain immediately.
    async fn domain_destroy(&self, name: &str) -> Result<(), HypervisorError>;

    async fn domain_undefine(&self, name: &str) -> Result<(), HypervisorError>;

    async fn domain_is_active(&self, name: &str) -> Result<bool, HypervisorError>;

    async fn domain_is_persistent(&self, name: &str) -> Result<bool, HypervisorError>;

    async fn domain_descriptor(&self, name: &str) -> Result<DomainDescriptor, HypervisorError>;

    async fn domain_snapshots(&self, name: &str) -> Result<Vec<String>, HypervisorError>;

    async fn domain_snapshot_delete(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), HypervisorError>;
}

/// Treat "not found" as success; propagate everything else.
pub fn ignore_not_found(result: Result<(), HypervisorError>) -> Result<(), HypervisorError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
