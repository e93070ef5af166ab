//! Integration tests for the VM lifecycle against the in-memory hypervisor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use virter_core::cancel::{cancel_pair, Cancel};
use virter_core::hypervisor::{
    Hypervisor, MemoryHypervisor, NetworkDescriptor, NetworkIp, ShutdownBehaviour,
};
use virter_core::image::{find_image, image_import_from_reader};
use virter_core::layer::{is_layer_name, LayerStore};
use virter_core::network::DhcpAllocator;
use virter_core::ssh::{KeyPair, SshClient, SshError};
use virter_core::state::StateStore;
use virter_core::vm::{DiskArg, HostKeySource, IsoBuilder, VmConfig, VmError, VmManager};
use virter_networking::DhcpLease;

const POOL: &str = "default";
const NETWORK: &str = "default";

struct PlainIso;

#[async_trait]
impl IsoBuilder for PlainIso {
    async fn build(&self, files: &[(&str, String)]) -> Result<Vec<u8>, VmError> {
        Ok(files
            .iter()
            .flat_map(|(_, content)| content.bytes())
            .collect())
    }
}

struct StaticKey;

#[async_trait]
impl HostKeySource for StaticKey {
    async fn generate(&self) -> Result<KeyPair, SshError> {
        Ok(KeyPair {
            private: "PRIVATE".to_string(),
            public: "ssh-ed25519 HOSTKEY".to_string(),
        })
    }
}

fn network() -> NetworkDescriptor {
    NetworkDescriptor {
        name: NETWORK.to_string(),
        bridge: None,
        forward: None,
        domain: None,
        ips: vec![NetworkIp {
            address: "192.168.0.1".to_string(),
            prefix: 24,
            family: "ipv4".to_string(),
            dhcp_range: None,
            hosts: Vec::new(),
        }],
    }
}

async fn setup(shutdown: ShutdownBehaviour) -> (Arc<MemoryHypervisor>, VmManager) {
    let hv = Arc::new(
        MemoryHypervisor::new()
            .with_pool(POOL)
            .with_network(network())
            .with_shutdown(shutdown),
    );
    let store = LayerStore::new(hv.clone(), POOL);
    image_import_from_reader(&store, "base", &mut &b"base disk"[..])
        .await
        .unwrap();

    let vms = VmManager::new(
        store,
        NETWORK,
        Arc::new(StateStore::open_in_memory().unwrap()),
        SshClient::new("/nonexistent/id_rsa"),
    )
    .with_iso_builder(Arc::new(PlainIso))
    .with_host_keys(Arc::new(StaticKey))
    .with_shutdown_poll(Duration::from_millis(5));
    (hv, vms)
}

async fn leftovers(hv: &MemoryHypervisor) -> Vec<String> {
    hv.volume_list(POOL)
        .await
        .unwrap()
        .into_iter()
        .filter(|v| !is_layer_name(v) && !v.starts_with("virter:tag:"))
        .collect()
}

fn vm(name: &str) -> VmConfig {
    let mut config = VmConfig::new("base", name);
    config.extra_disks = vec![DiskArg::parse("name=scratch,size=512M,format=raw").unwrap()];
    config
}

#[tokio::test]
async fn test_rm_is_idempotent() {
    let (hv, vms) = setup(ShutdownBehaviour::Immediate).await;
    vms.vm_run(&vm("vm1"), &Cancel::never()).await.unwrap();
    assert_eq!(leftovers(&hv).await.len(), 3);

    vms.vm_rm("vm1", false).await.unwrap();
    vms.vm_rm("vm1", false).await.unwrap();

    assert!(leftovers(&hv).await.is_empty());
    assert!(hv.domain_list().await.unwrap().is_empty());
    assert!(vms.state().list_vms().unwrap().is_empty());
}

#[tokio::test]
async fn test_rm_with_domain_already_gone() {
    let (hv, vms) = setup(ShutdownBehaviour::Immediate).await;
    vms.vm_run(&vm("vm1"), &Cancel::never()).await.unwrap();
    hv.domain_destroy("vm1").await.unwrap();
    hv.domain_undefine("vm1").await.unwrap();

    vms.vm_rm("vm1", false).await.unwrap();
    assert!(leftovers(&hv).await.is_empty());
    assert!(hv.network_descriptor(NETWORK).await.unwrap().dhcp_hosts().is_empty());
}

#[tokio::test]
async fn test_vm_ip_stays_stable_across_reregistration() {
    let (_hv, vms) = setup(ShutdownBehaviour::Immediate).await;
    let mut config = vm("vm1");
    config.id = 7;
    let record = vms.vm_run(&config, &Cancel::never()).await.unwrap();
    let first = vms.vm_ip("vm1").await.unwrap();
    assert_eq!(first, Some("192.168.0.7".parse().unwrap()));

    vms.vm_rm("vm1", false).await.unwrap();
    let record2 = vms.vm_run(&config, &Cancel::never()).await.unwrap();
    assert_eq!(record.mac, record2.mac);
    assert_eq!(vms.vm_ip("vm1").await.unwrap(), first);
}

#[tokio::test]
async fn test_free_id_skips_leased_offset() {
    let (hv, _vms) = setup(ShutdownBehaviour::Immediate).await;
    let dhcp = DhcpAllocator::new(hv.clone(), NETWORK);
    dhcp.add_dhcp_host("52:54:00:00:00:05", 5).await.unwrap();
    hv.add_lease(
        NETWORK,
        DhcpLease {
            mac: "52:54:00:00:00:05".to_string(),
            ip: "192.168.0.5".parse().unwrap(),
            hostname: None,
        },
    )
    .unwrap();

    assert_eq!(dhcp.get_vm_id(0, false).await.unwrap(), 254);
    assert!(dhcp.get_vm_id(5, false).await.is_err());
}

#[tokio::test]
async fn test_commit_times_out_when_vm_never_stops() {
    let (hv, vms) = setup(ShutdownBehaviour::Never).await;
    vms.vm_run(&vm("vm1"), &Cancel::never()).await.unwrap();

    let err = vms
        .vm_commit("vm1", true, Duration::from_millis(50), false, &Cancel::never())
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::Timeout { .. }));
    // Nothing was removed.
    assert_eq!(leftovers(&hv).await.len(), 3);
}

#[tokio::test]
async fn test_commit_stops_promptly_on_cancel() {
    let (_hv, vms) = setup(ShutdownBehaviour::Never).await;
    vms.vm_run(&vm("vm1"), &Cancel::never()).await.unwrap();

    let (handle, cancel) = cancel_pair();
    let started = tokio::time::Instant::now();
    let commit = vms.vm_commit("vm1", true, Duration::from_secs(60), false, &cancel);
    let cancel_soon = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    };
    let (result, ()) = tokio::join!(commit, cancel_soon);

    assert!(result.unwrap_err().is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_commit_and_run_from_committed_image() {
    let (hv, vms) = setup(ShutdownBehaviour::AfterPolls(3)).await;
    vms.vm_run(&vm("builder"), &Cancel::never()).await.unwrap();

    let image = vms
        .vm_commit_image("builder", "derived", true, Duration::from_secs(5), false, &Cancel::never())
        .await
        .unwrap();
    assert_eq!(image.layers().await.unwrap().len(), 2);
    assert!(leftovers(&hv).await.is_empty());

    let mut next = vm("vm2");
    next.image = "derived".to_string();
    vms.vm_run(&next, &Cancel::never()).await.unwrap();
    assert!(find_image(vms.store(), "derived").await.unwrap().is_some());
    assert!(hv.domain_is_active("vm2").await.unwrap());
}

#[tokio::test]
async fn test_rm_rejects_layer_and_tag_names() {
    let (hv, vms) = setup(ShutdownBehaviour::Immediate).await;
    vms.vm_run(&vm("vm1"), &Cancel::never()).await.unwrap();
    let mut before = hv.volume_list(POOL).await.unwrap();
    before.sort();
    let layer = before.iter().find(|v| is_layer_name(v)).unwrap().clone();

    for name in [layer.as_str(), "virter:tag:base"] {
        let err = vms.vm_rm(name, false).await.unwrap_err();
        assert!(matches!(err, VmError::InvalidName(_)), "{name}: {err}");
    }

    let mut after = hv.volume_list(POOL).await.unwrap();
    after.sort();
    assert_eq!(after, before);
    let boot = vms.store().find_raw_layer("vm1").await.unwrap().unwrap();
    let parent = boot.dependency().await.unwrap().unwrap();
    assert_eq!(parent.name(), layer);
}

#[tokio::test]
async fn test_free_id_skips_lease_without_host_entry() {
    let (hv, _vms) = setup(ShutdownBehaviour::Immediate).await;
    hv.add_lease(
        NETWORK,
        DhcpLease {
            mac: "52:54:00:aa:bb:cc".to_string(),
            ip: "192.168.0.254".parse().unwrap(),
            hostname: Some("dynamic".to_string()),
        },
    )
    .unwrap();
    let dhcp = DhcpAllocator::new(hv.clone(), NETWORK);

    assert_eq!(dhcp.get_vm_id(0, false).await.unwrap(), 253);
    let err = dhcp.get_vm_id(254, false).await.unwrap_err();
    assert!(err.to_string().contains("254"), "{err}");
}
