//! Removing and committing VMs.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::Cancel;
use crate::hypervisor::{ignore_not_found, DomainDescriptor, HypervisorError, ObjectKind};
use crate::image::{make_image, Image};
use crate::layer::RawLayer;
use crate::network::DhcpAllocator;
use crate::state::VmRecord;

use super::{boot_volume, cidata_volume, validate_name, VmError, VmManager};

/// Not-found and "not running" both mean there is nothing to stop.
fn ignore_inactive(result: Result<(), HypervisorError>) -> Result<(), HypervisorError> {
    match result {
        Err(HypervisorError::InvalidOperation { .. }) => Ok(()),
        other => ignore_not_found(other),
    }
}

impl VmManager {
    /// Remove a VM and everything created for it.
    ///
    /// Missing pieces are skipped, so a second call after a partial failure
    /// finishes the job. The boot volume goes last.
    pub async fn vm_rm(&self, name: &str, static_dhcp: bool) -> Result<(), VmError> {
        validate_name(name)?;
        let record = self.state.get_vm(name)?;
        let desc = self.find_domain(name).await?;

        if desc.is_none() && record.is_none() {
            debug!(vm = %name, "No domain or metadata, removing leftover volumes only");
        }

        self.release_domain(name, desc.as_ref(), record.as_ref(), static_dhcp)
            .await?;
        if desc.is_some() {
            self.stop_and_undefine(name).await?;
        }
        self.delete_non_boot_volumes(name, desc.as_ref(), record.as_ref())
            .await?;

        self.store.raw_layer(&boot_volume(name)).delete().await?;
        self.state.delete_vm(name)?;
        info!(vm = %name, "Removed VM");
        Ok(())
    }

    /// Shut a VM down if asked and strip it down to its boot volume.
    ///
    /// A running VM is only committed with `shutdown` set; the wait for it
    /// to stop polls until `shutdown_timeout` and stops early on `cancel`.
    /// Returns the boot volume for the caller to turn into a layer.
    pub async fn vm_commit(
        &self,
        name: &str,
        shutdown: bool,
        shutdown_timeout: Duration,
        static_dhcp: bool,
        cancel: &Cancel,
    ) -> Result<RawLayer, VmError> {
        validate_name(name)?;
        let desc = self
            .find_domain(name)
            .await?
            .ok_or_else(|| VmError::NotFound(name.to_string()))?;

        if self.conn().domain_is_active(name).await? {
            if !shutdown {
                return Err(VmError::NotStopped(name.to_string()));
            }
            info!(vm = %name, timeout = ?shutdown_timeout, "Shutting down VM");
            self.conn().domain_shutdown(name).await?;
            self.wait_inactive(name, shutdown_timeout, cancel).await?;
        }

        let record = self.state.get_vm(name)?;
        self.release_domain(name, Some(&desc), record.as_ref(), static_dhcp)
            .await?;
        self.stop_and_undefine(name).await?;
        self.delete_non_boot_volumes(name, Some(&desc), record.as_ref())
            .await?;
        self.state.delete_vm(name)?;

        let boot = self
            .store
            .find_raw_layer(&boot_volume(name))
            .await?
            .ok_or_else(|| HypervisorError::not_found(ObjectKind::Volume, boot_volume(name)))?;
        info!(vm = %name, volume = %boot.name(), "Committed VM");
        Ok(boot)
    }

    /// Commit a VM and tag its boot volume as image `image_name`.
    pub async fn vm_commit_image(
        &self,
        name: &str,
        image_name: &str,
        shutdown: bool,
        shutdown_timeout: Duration,
        static_dhcp: bool,
        cancel: &Cancel,
    ) -> Result<Image, VmError> {
        let boot = self
            .vm_commit(name, shutdown, shutdown_timeout, static_dhcp, cancel)
            .await?;
        let layer = boot.to_volume_layer(None, &[]).await?;
        Ok(make_image(&self.store, image_name, &layer).await?)
    }

    async fn find_domain(&self, name: &str) -> Result<Option<DomainDescriptor>, VmError> {
        match self.conn().domain_descriptor(name).await {
            Ok(desc) => Ok(Some(desc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_inactive(&self, name: &str, timeout: Duration, cancel: &Cancel) -> Result<(), VmError> {
        let deadline = Instant::now() + timeout;
        let mut interval = tokio::time::interval(self.shutdown_poll);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(VmError::Timeout { name: name.to_string(), timeout });
                }
                _ = cancel.cancelled() => return Err(VmError::Cancelled(name.to_string())),
            }
            match self.conn().domain_is_active(name).await {
                Ok(false) => return Ok(()),
                Ok(true) => debug!(vm = %name, "Waiting for VM to shut down"),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Delete snapshots and DHCP entries.
    async fn release_domain(
        &self,
        name: &str,
        desc: Option<&DomainDescriptor>,
        record: Option<&VmRecord>,
        static_dhcp: bool,
    ) -> Result<(), VmError> {
        if desc.is_some() {
            let snapshots = match self.conn().domain_snapshots(name).await {
                Ok(s) => s,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            for snapshot in snapshots {
                ignore_not_found(self.conn().domain_snapshot_delete(name, &snapshot).await)?;
                debug!(vm = %name, snapshot = %snapshot, "Deleted snapshot");
            }
        }

        if static_dhcp {
            return Ok(());
        }
        let mut entries: Vec<(String, String)> = desc
            .map(|d| {
                d.interfaces
                    .iter()
                    .map(|i| (i.network.clone(), i.mac.clone()))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(record) = record {
            let own = (self.dhcp.network().to_string(), record.mac.clone());
            if !entries.contains(&own) {
                entries.push(own);
            }
        }

        for (network, mac) in entries {
            let dhcp = DhcpAllocator::new(self.conn().clone(), &network);
            match dhcp.remove_mac_dhcp_entries(&mac).await {
                Ok(()) => {}
                Err(crate::network::DhcpError::Hypervisor(e)) if e.is_not_found() => {
                    warn!(vm = %name, network = %network, "Network not found, skipping DHCP cleanup");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn stop_and_undefine(&self, name: &str) -> Result<(), VmError> {
        let active = match self.conn().domain_is_active(name).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if active {
            ignore_inactive(self.conn().domain_destroy(name).await)?;
            debug!(vm = %name, "Stopped domain");
        }

        let persistent = match self.conn().domain_is_persistent(name).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if persistent {
            ignore_not_found(self.conn().domain_undefine(name).await)?;
            debug!(vm = %name, "Undefined domain");
        }
        Ok(())
    }

    /// Delete every volume of the VM except its boot volume.
    async fn delete_non_boot_volumes(
        &self,
        name: &str,
        desc: Option<&DomainDescriptor>,
        record: Option<&VmRecord>,
    ) -> Result<(), VmError> {
        let boot = boot_volume(name);
        let pool = self.store.pool().to_string();

        let mut volumes: Vec<(String, String)> = Vec::new();
        let mut add = |pool: &str, volume: &str| {
            let entry = (pool.to_string(), volume.to_string());
            if volume != boot && !volumes.contains(&entry) {
                volumes.push(entry);
            }
        };
        if let Some(desc) = desc {
            for disk in &desc.disks {
                add(&disk.pool, &disk.volume);
            }
        }
        if let Some(record) = record {
            for volume in &record.volumes {
                add(&pool, volume);
            }
        }
        add(&pool, &cidata_volume(name));

        for (pool, volume) in volumes {
            match self.conn().volume_delete(&pool, &volume).await {
                Err(e) if e.is_not_found_of(ObjectKind::Volume) => {}
                other => other?,
            }
            debug!(vm = %name, pool = %pool, volume = %volume, "Deleted volume");
        }
        Ok(())
    }
}
