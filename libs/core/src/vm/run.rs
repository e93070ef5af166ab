//! Creating and starting VMs.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};
use virter_networking::{mac_for_id, normalize_mac};

use crate::cancel::Cancel;
use crate::hypervisor::{
    DiskDevice, DomainDescriptor, DomainDisk, DomainInterface, VolumeFormat,
};
use crate::image::{find_image, Image};
use crate::layer::LayerOption;
use crate::state::VmRecord;

use super::args::{bus_prefix, target_dev, ArgError};
use super::cloudinit::{meta_data, user_data};
use super::{
    boot_volume, cidata_volume, disk_volume, step, validate_name, VmConfig, VmError, VmManager,
    MIN_BOOT_SIZE,
};

/// Boot volume capacity: the requested size, grown to the image allocation
/// and to [`MIN_BOOT_SIZE`].
pub(crate) fn boot_capacity(requested: Option<u64>, image_allocation: u64) -> u64 {
    requested
        .unwrap_or(0)
        .max(image_allocation)
        .max(MIN_BOOT_SIZE)
}

impl VmManager {
    /// Create and start a VM.
    ///
    /// Fails without side effects if the domain, any of its volumes, its ID
    /// or its MAC address already exist. Once creation starts, a failing step
    /// leaves the earlier steps in place; [`vm_rm`](Self::vm_rm) cleans up.
    pub async fn vm_run(&self, config: &VmConfig, cancel: &Cancel) -> Result<VmRecord, VmError> {
        let name = config.name.as_str();
        let (image, id, mac) = self.check_run_preconditions(config).await?;
        info!(vm = %name, id, mac = %mac, image = %config.image, "Creating VM");

        let boot = boot_volume(name);
        let top_info = image.top().info().await?;
        let capacity = boot_capacity(config.disk_size, top_info.allocation);
        self.store
            .create_layer(
                &boot,
                &[
                    LayerOption::WithBacking(image.top().clone()),
                    LayerOption::WithCapacity(capacity),
                ],
            )
            .await
            .map_err(step("boot volume creation", name))?;
        debug!(vm = %name, volume = %boot, capacity, "Created boot volume");

        let host_key = self
            .host_keys
            .generate()
            .await
            .map_err(step("host key generation", name))?;

        let cidata = cidata_volume(name);
        let files = [
            ("meta-data", meta_data(name)),
            ("user-data", user_data(name, &config.ssh_public_keys, &host_key)),
        ];
        let iso = self
            .iso
            .build(&files)
            .await
            .map_err(step("cloud-init image build", name))?;
        let seed = self
            .store
            .create_layer(
                &cidata,
                &[
                    LayerOption::WithFormat(VolumeFormat::Raw),
                    LayerOption::WithCapacity(iso.len() as u64),
                ],
            )
            .await
            .map_err(step("cloud-init volume creation", name))?;
        seed.upload(&mut std::io::Cursor::new(iso))
            .await
            .map_err(step("cloud-init upload", name))?;

        let mut volumes = vec![boot.clone(), cidata.clone()];
        for disk in &config.extra_disks {
            let volume = disk_volume(name, &disk.name);
            self.store
                .create_layer(
                    &volume,
                    &[
                        LayerOption::WithFormat(disk.format),
                        LayerOption::WithCapacity(disk.size),
                    ],
                )
                .await
                .map_err(step("disk creation", name))?;
            debug!(vm = %name, volume = %volume, size = disk.size, "Created disk");
            volumes.push(volume);
        }

        let record = VmRecord {
            name: name.to_string(),
            id,
            mac: mac.clone(),
            host_key: host_key.public.clone(),
            user_name: config.user_name.clone(),
            static_dhcp: config.static_dhcp,
            volumes,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.state
            .put_vm(&record)
            .map_err(step("metadata update", name))?;

        let desc = self.domain_descriptor(config, &mac);
        self.conn()
            .domain_define(&desc)
            .await
            .map_err(step("domain definition", name))?;

        if !config.static_dhcp {
            let ip = self
                .dhcp
                .add_dhcp_host(&mac, id)
                .await
                .map_err(step("DHCP registration", name))?;
            debug!(vm = %name, ip = %ip, "Registered DHCP host");
        }

        self.conn()
            .domain_start(name)
            .await
            .map_err(step("domain start", name))?;
        info!(vm = %name, "Started VM");

        if config.wait_ssh {
            self.ping_ssh(name, cancel).await?;
        }
        Ok(record)
    }

    /// Checks before `vm_run` mutates anything. Returns the image, ID and MAC.
    async fn check_run_preconditions(&self, config: &VmConfig) -> Result<(Image, u32, String), VmError> {
        let name = config.name.as_str();
        validate_name(name)?;

        match self.conn().domain_descriptor(name).await {
            Ok(_) => return Err(VmError::AlreadyExists(name.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let mut disk_names = HashSet::new();
        for disk in &config.extra_disks {
            if !disk_names.insert(disk.name.as_str()) {
                return Err(ArgError::DuplicateKey {
                    kind: "disk",
                    key: disk.name.clone(),
                }
                .into());
            }
        }

        let mut wanted = vec![boot_volume(name), cidata_volume(name)];
        wanted.extend(config.extra_disks.iter().map(|d| disk_volume(name, &d.name)));
        for volume in &wanted {
            if self.store.find_raw_layer(volume).await?.is_some() {
                return Err(VmError::VolumeExists {
                    pool: self.store.pool().to_string(),
                    volume: volume.clone(),
                });
            }
        }

        let id = self.dhcp.get_vm_id(config.id, config.static_dhcp).await?;
        let mac = mac_for_id(id);
        if let Some(domain) = self.domain_with_mac(&mac).await? {
            return Err(VmError::MacInUse { mac, domain });
        }

        let image = find_image(&self.store, &config.image)
            .await?
            .ok_or_else(|| VmError::ImageNotFound(config.image.clone()))?;
        Ok((image, id, mac))
    }

    /// Domain that has an interface with `mac`, if any.
    async fn domain_with_mac(&self, mac: &str) -> Result<Option<String>, VmError> {
        for domain in self.conn().domain_list().await? {
            let desc = match self.conn().domain_descriptor(&domain).await {
                Ok(desc) => desc,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            let found = desc
                .macs()
                .any(|m| normalize_mac(m).map(|m| m == mac).unwrap_or(false));
            if found {
                return Ok(Some(domain));
            }
        }
        Ok(None)
    }

    fn domain_descriptor(&self, config: &VmConfig, mac: &str) -> DomainDescriptor {
        let name = config.name.as_str();
        let pool = self.store.pool().to_string();
        // vda and sda are taken by the boot disk and the seed.
        let mut next: HashMap<&'static str, usize> = HashMap::from([("vd", 1), ("sd", 1)]);

        let mut disks = vec![
            DomainDisk {
                device: DiskDevice::Disk,
                pool: pool.clone(),
                volume: boot_volume(name),
                format: VolumeFormat::Qcow2,
                bus: "virtio".to_string(),
                target_dev: target_dev("virtio", 0),
            },
            DomainDisk {
                device: DiskDevice::Cdrom,
                pool: pool.clone(),
                volume: cidata_volume(name),
                format: VolumeFormat::Raw,
                bus: "sata".to_string(),
                target_dev: target_dev("sata", 0),
            },
        ];
        for disk in &config.extra_disks {
            let slot = next.entry(bus_prefix(&disk.bus)).or_insert(0);
            disks.push(DomainDisk {
                device: DiskDevice::Disk,
                pool: pool.clone(),
                volume: disk_volume(name, &disk.name),
                format: disk.format,
                bus: disk.bus.clone(),
                target_dev: target_dev(&disk.bus, *slot),
            });
            *slot += 1;
        }

        DomainDescriptor {
            name: name.to_string(),
            memory_kib: config.memory_kib,
            vcpus: config.vcpus,
            disks,
            interfaces: vec![DomainInterface {
                network: self.dhcp.network().to_string(),
                mac: mac.to_string(),
                model: "virtio".to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::Hypervisor;
    use crate::vm::testutil::{manager, NETWORK, POOL};
    use crate::vm::DiskArg;

    fn config(name: &str) -> VmConfig {
        let mut config = VmConfig::new("base", name);
        config.ssh_public_keys = vec!["ssh-ed25519 USERKEY".to_string()];
        config
    }

    #[test]
    fn test_boot_capacity() {
        assert_eq!(boot_capacity(None, 1 << 20), MIN_BOOT_SIZE);
        assert_eq!(boot_capacity(Some(20 << 30), 1 << 20), 20 << 30);
        assert_eq!(boot_capacity(Some(1 << 30), 30 << 30), 30 << 30);
    }

    #[tokio::test]
    async fn test_run_creates_everything() {
        let (hv, vms) = manager().await;
        let mut cfg = config("vm1");
        cfg.id = 11;
        cfg.extra_disks = vec![DiskArg::parse("name=data,size=2G,bus=scsi").unwrap()];

        let record = vms.vm_run(&cfg, &Cancel::never()).await.unwrap();
        assert_eq!(record.id, 11);
        assert_eq!(record.mac, mac_for_id(11));
        assert_eq!(record.volumes, vec!["vm1", "vm1-cidata", "vm1-data"]);
        assert_eq!(record.host_key, "ssh-rsa HOSTKEY0");

        assert!(hv.domain_is_active("vm1").await.unwrap());
        let desc = hv.domain_descriptor("vm1").await.unwrap();
        let devs: Vec<_> = desc.disks.iter().map(|d| d.target_dev.as_str()).collect();
        assert_eq!(devs, vec!["vda", "sda", "sdb"]);

        let boot = hv.volume_info(POOL, "vm1").await.unwrap();
        assert_eq!(boot.capacity, MIN_BOOT_SIZE);
        let seed = String::from_utf8(hv.volume_content(POOL, "vm1-cidata").unwrap()).unwrap();
        assert!(seed.contains("local-hostname: vm1"));
        assert!(seed.contains("ssh-ed25519 USERKEY"));

        let hosts = hv.network_descriptor(NETWORK).await.unwrap().dhcp_hosts();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].ip.to_string(), "192.168.122.11");

        assert_eq!(vms.state().require_vm("vm1").unwrap(), record);
    }

    #[tokio::test]
    async fn test_run_static_dhcp_skips_registration() {
        let (hv, vms) = manager().await;
        let mut cfg = config("vm1");
        cfg.id = 20;
        cfg.static_dhcp = true;
        vms.vm_run(&cfg, &Cancel::never()).await.unwrap();
        assert!(hv.network_descriptor(NETWORK).await.unwrap().dhcp_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_run_existing_domain_has_no_side_effects() {
        let (hv, vms) = manager().await;
        vms.vm_run(&config("vm1"), &Cancel::never()).await.unwrap();
        let volumes_before = hv.volume_list(POOL).await.unwrap().len();

        let err = vms.vm_run(&config("vm1"), &Cancel::never()).await.unwrap_err();
        assert!(matches!(err, VmError::AlreadyExists(_)));
        assert_eq!(hv.volume_list(POOL).await.unwrap().len(), volumes_before);
    }

    #[tokio::test]
    async fn test_run_leftover_volume_aborts() {
        let (hv, vms) = manager().await;
        vms.store()
            .create_layer("vm1-cidata", &[])
            .await
            .unwrap();

        let err = vms.vm_run(&config("vm1"), &Cancel::never()).await.unwrap_err();
        assert!(matches!(err, VmError::VolumeExists { volume, .. } if volume == "vm1-cidata"));
        assert!(hv.volume_info(POOL, "vm1").await.is_err());
        assert!(hv.network_descriptor(NETWORK).await.unwrap().dhcp_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_run_id_collision() {
        let (_hv, vms) = manager().await;
        let mut first = config("vm1");
        first.id = 5;
        vms.vm_run(&first, &Cancel::never()).await.unwrap();

        let mut second = config("vm2");
        second.id = 5;
        let err = vms.vm_run(&second, &Cancel::never()).await.unwrap_err();
        assert!(matches!(err, VmError::IdCollision { id: 5, .. }));
        assert!(vms.state().get_vm("vm2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_mac_in_use_with_static_dhcp() {
        let (_hv, vms) = manager().await;
        let mut first = config("vm1");
        first.id = 9;
        first.static_dhcp = true;
        vms.vm_run(&first, &Cancel::never()).await.unwrap();

        let mut second = config("vm2");
        second.id = 9;
        second.static_dhcp = true;
        let err = vms.vm_run(&second, &Cancel::never()).await.unwrap_err();
        assert!(matches!(err, VmError::MacInUse { domain, .. } if domain == "vm1"));
    }

    #[tokio::test]
    async fn test_run_unknown_image() {
        let (_hv, vms) = manager().await;
        let mut cfg = config("vm1");
        cfg.image = "missing".to_string();
        let err = vms.vm_run(&cfg, &Cancel::never()).await.unwrap_err();
        assert!(matches!(err, VmError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_duplicate_disk_names() {
        let (_hv, vms) = manager().await;
        let mut cfg = config("vm1");
        cfg.extra_disks = vec![
            DiskArg::parse("name=d,size=1G").unwrap(),
            DiskArg::parse("name=d,size=2G").unwrap(),
        ];
        let err = vms.vm_run(&cfg, &Cancel::never()).await.unwrap_err();
        assert!(matches!(err, VmError::Argument(ArgError::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn test_run_picks_highest_free_id() {
        let (_hv, vms) = manager().await;
        let a = vms.vm_run(&config("a"), &Cancel::never()).await.unwrap();
        let b = vms.vm_run(&config("b"), &Cancel::never()).await.unwrap();
        assert_eq!(a.id, 254);
        assert_eq!(b.id, 253);
    }
}
