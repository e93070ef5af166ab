//! Hypervisor backed by the `virsh` command line.
//!
//! Each facade call maps to one (occasionally two) `virsh` invocations.
//! Descriptors travel as XML through temporary files; volume content is
//! staged in temporary files for `vol-upload` / `vol-download`.

use std::io::Write as _;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use virter_networking::{parse_ipv4, DhcpHost, DhcpLease};

use super::xml;
use super::{
    DhcpUpdate, DomainDescriptor, DownloadWriter, Hypervisor, HypervisorError, NetworkDescriptor,
    ObjectKind, UploadReader, VolumeDescriptor, VolumeInfo,
};

/// libvirt client driving `virsh`.
pub struct VirshHypervisor {
    uri: Option<String>,
}

impl VirshHypervisor {
    /// Create a client for the given connection URI (`None` = libvirt default).
    pub fn new(uri: Option<String>) -> Self {
        Self { uri }
    }

    /// Run `virsh` and return stdout; errors are classified against `target`.
    async fn run(
        &self,
        target: (ObjectKind, &str),
        args: &[&str],
    ) -> Result<String, HypervisorError> {
        let mut cmd = Command::new("virsh");
        cmd.arg("--quiet");
        if let Some(uri) = &self.uri {
            cmd.args(["--connect", uri.as_str()]);
        }
        cmd.args(args);

        debug!(args = ?args, "Running virsh");

        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(target.0, target.1, args, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Define an object from a rendered XML document.
    async fn run_with_xml(
        &self,
        target: (ObjectKind, &str),
        args: &[&str],
        document: &str,
    ) -> Result<(), HypervisorError> {
        let mut file = tempfile::Builder::new()
            .prefix("virter-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(document.as_bytes())?;
        file.flush()?;

        let path = path_str(file.path())?;
        let mut full: Vec<&str> = args.to_vec();
        full.push(path.as_str());
        self.run(target, &full).await?;
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<String, HypervisorError> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        HypervisorError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("non UTF-8 temporary path {}", path.display()),
        ))
    })
}

/// Map `virsh` error output to a facade error.
fn classify(kind: ObjectKind, name: &str, args: &[&str], stderr: &str) -> HypervisorError {
    let lower = stderr.to_lowercase();
    let pool_missing = [
        "no storage pool with matching",
        "failed to get pool",
        "storage pool not found",
    ];
    if kind != ObjectKind::Pool && pool_missing.iter().any(|p| lower.contains(p)) {
        let pool = args
            .iter()
            .position(|a| *a == "--pool")
            .and_then(|i| args.get(i + 1))
            .copied()
            .unwrap_or_default();
        return HypervisorError::not_found(ObjectKind::Pool, pool);
    }

    let not_found = [
        "not found",
        "no storage vol with matching",
        "no domain with matching",
        "no network with matching",
        "no storage pool with matching",
        "failed to get domain",
        "failed to get network",
        "failed to get pool",
        "failed to get vol",
    ];

    if not_found.iter().any(|p| lower.contains(p)) {
        HypervisorError::not_found(kind, name)
    } else if lower.contains("already exists") {
        HypervisorError::already_exists(kind, name)
    } else if lower.contains("not running") || lower.contains("is not active") {
        HypervisorError::InvalidOperation {
            kind,
            name: name.to_string(),
            reason: stderr.to_string(),
        }
    } else {
        HypervisorError::Command {
            command: format!("virsh {}", args.join(" ")),
            stderr: stderr.to_string(),
        }
    }
}

/// Non-empty output lines with table separators and headers removed.
fn table_rows(output: &str) -> Vec<&str> {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.trim_start().starts_with("---"))
        .map(|i| i + 1)
        .unwrap_or(0);
    lines[start..]
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Value of a `Key:   value` line.
fn field<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim())
    })
}

/// Parse a `Capacity:  123 bytes` value.
fn parse_bytes(value: Option<&str>, what: &str) -> Result<u64, HypervisorError> {
    value
        .and_then(|v| v.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| HypervisorError::InvalidDescriptor(format!("missing {what} in vol-info output")))
}

/// Parse `virsh net-dhcp-leases` output.
fn parse_leases(output: &str) -> Vec<DhcpLease> {
    let mut leases = Vec::new();
    for row in table_rows(output) {
        // Expiry date, expiry time, MAC, protocol, IP/prefix, hostname, client id
        let cols: Vec<&str> = row.split_whitespace().collect();
        if cols.len() < 5 || cols[3] != "ipv4" {
            continue;
        }
        let addr = cols[4].split('/').next().unwrap_or_default();
        let Ok(ip) = parse_ipv4(addr) else {
            continue;
        };
        let hostname = cols
            .get(5)
            .filter(|h| **h != "-")
            .map(|h| h.to_string());
        leases.push(DhcpLease {
            mac: cols[2].to_lowercase(),
            ip,
            hostname,
        });
    }
    leases
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn pool_exists(&self, pool: &str) -> Result<bool, HypervisorError> {
        match self.run((ObjectKind::Pool, pool), &["pool-info", pool]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn volume_list(&self, pool: &str) -> Result<Vec<String>, HypervisorError> {
        let out = self
            .run((ObjectKind::Pool, pool), &["vol-list", "--pool", pool])
            .await?;
        Ok(table_rows(&out)
            .into_iter()
            .filter_map(|row| row.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    async fn volume_create(
        &self,
        pool: &str,
        desc: &VolumeDescriptor,
    ) -> Result<(), HypervisorError> {
        self.run_with_xml(
            (ObjectKind::Volume, desc.name.as_str()),
            &["vol-create", "--pool", pool, "--file"],
            &xml::volume_xml(desc),
        )
        .await
    }

    async fn volume_delete(&self, pool: &str, name: &str) -> Result<(), HypervisorError> {
        self.run((ObjectKind::Volume, name), &["vol-delete", "--pool", pool, name])
            .await?;
        Ok(())
    }

    async fn volume_info(&self, pool: &str, name: &str) -> Result<VolumeInfo, HypervisorError> {
        let out = self
            .run(
                (ObjectKind::Volume, name),
                &["vol-info", "--pool", pool, "--bytes", name],
            )
            .await?;
        Ok(VolumeInfo {
            capacity: parse_bytes(field(&out, "Capacity"), "capacity")?,
            allocation: parse_bytes(field(&out, "Allocation"), "allocation")?,
        })
    }

    async fn volume_path(&self, pool: &str, name: &str) -> Result<String, HypervisorError> {
        let out = self
            .run((ObjectKind::Volume, name), &["vol-path", "--pool", pool, name])
            .await?;
        Ok(out.trim().to_string())
    }

    async fn volume_descriptor(
        &self,
        pool: &str,
        name: &str,
    ) -> Result<VolumeDescriptor, HypervisorError> {
        let out = self
            .run((ObjectKind::Volume, name), &["vol-dumpxml", "--pool", pool, name])
            .await?;
        xml::parse_volume(&out)
    }

    async fn volume_lookup_by_path(
        &self,
        pool: &str,
        path: &str,
    ) -> Result<String, HypervisorError> {
        let owner = self
            .run((ObjectKind::Volume, path), &["vol-pool", path])
            .await?;
        if owner.trim() != pool {
            return Err(HypervisorError::not_found(ObjectKind::Volume, path));
        }
        let out = self
            .run((ObjectKind::Volume, path), &["vol-name", path])
            .await?;
        Ok(out.trim().to_string())
    }

    async fn volume_upload(
        &self,
        pool: &str,
        name: &str,
        reader: UploadReader<'_>,
    ) -> Result<u64, HypervisorError> {
        let staging = tempfile::Builder::new().prefix("virter-upload-").tempfile()?;
        let mut file = tokio::fs::File::from_std(staging.reopen()?);
        let written = tokio::io::copy(&mut *reader, &mut file).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        drop(file);

        let path = path_str(staging.path())?;
        self.run(
            (ObjectKind::Volume, name),
            &["vol-upload", "--pool", pool, name, path.as_str()],
        )
        .await?;
        Ok(written)
    }

    async fn volume_download(
        &self,
        pool: &str,
        name: &str,
        writer: DownloadWriter<'_>,
    ) -> Result<u64, HypervisorError> {
        let staging = tempfile::Builder::new()
            .prefix("virter-download-")
            .tempfile()?;
        let path = path_str(staging.path())?;
        self.run(
            (ObjectKind::Volume, name),
            &["vol-download", "--pool", pool, name, path.as_str()],
        )
        .await?;

        let mut file = tokio::fs::File::open(&path).await?;
        let copied = tokio::io::copy(&mut file, &mut *writer).await?;
        tokio::io::AsyncWriteExt::flush(&mut *writer).await?;
        Ok(copied)
    }

    async fn network_list(&self) -> Result<Vec<String>, HypervisorError> {
        let out = self
            .run((ObjectKind::Network, ""), &["net-list", "--all", "--name"])
            .await?;
        Ok(table_rows(&out).into_iter().map(str::to_string).collect())
    }

    async fn network_descriptor(&self, name: &str) -> Result<NetworkDescriptor, HypervisorError> {
        let out = self
            .run((ObjectKind::Network, name), &["net-dumpxml", name])
            .await?;
        xml::parse_network(&out)
    }

    async fn network_define(&self, desc: &NetworkDescriptor) -> Result<(), HypervisorError> {
        self.run_with_xml(
            (ObjectKind::Network, desc.name.as_str()),
            &["net-define", "--file"],
            &xml::network_xml(desc),
        )
        .await
    }

    async fn network_undefine(&self, name: &str) -> Result<(), HypervisorError> {
        self.run((ObjectKind::Network, name), &["net-undefine", name])
            .await?;
        Ok(())
    }

    async fn network_start(&self, name: &str) -> Result<(), HypervisorError> {
        self.run((ObjectKind::Network, name), &["net-start", name])
            .await?;
        Ok(())
    }

    async fn network_destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.run((ObjectKind::Network, name), &["net-destroy", name])
            .await?;
        Ok(())
    }

    async fn network_is_active(&self, name: &str) -> Result<bool, HypervisorError> {
        let out = self
            .run((ObjectKind::Network, name), &["net-info", name])
            .await?;
        Ok(field(&out, "Active") == Some("yes"))
    }

    async fn network_update_dhcp_host(
        &self,
        network: &str,
        op: DhcpUpdate,
        host: &DhcpHost,
    ) -> Result<(), HypervisorError> {
        let command = match op {
            DhcpUpdate::Add => "add",
            DhcpUpdate::Delete => "delete",
        };
        let entry = xml::dhcp_host_xml(host);

        // --live is rejected for inactive networks
        let mut args = vec!["net-update", network, command, "ip-dhcp-host", entry.as_str(), "--config"];
        if self.network_is_active(network).await? {
            args.push("--live");
        }
        self.run((ObjectKind::Network, network), &args).await?;
        Ok(())
    }

    async fn network_dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>, HypervisorError> {
        let out = self
            .run((ObjectKind::Network, network), &["net-dhcp-leases", network])
            .await?;
        Ok(parse_leases(&out))
    }

    async fn domain_list(&self) -> Result<Vec<String>, HypervisorError> {
        let out = self
            .run((ObjectKind::Domain, ""), &["list", "--all", "--name"])
            .await?;
        Ok(table_rows(&out).into_iter().map(str::to_string).collect())
    }

    async fn domain_define(&self, desc: &DomainDescriptor) -> Result<(), HypervisorError> {
        self.run_with_xml(
            (ObjectKind::Domain, desc.name.as_str()),
            &["define", "--file"],
            &xml::domain_xml(desc),
        )
        .await
    }

    async fn domain_start(&self, name: &str) -> Result<(), HypervisorError> {
        self.run((ObjectKind::Domain, name), &["start", name]).await?;
        Ok(())
    }

    async fn domain_shutdown(&self, name: &str) -> Result<(), HypervisorError> {
        self.run((ObjectKind::Domain, name), &["shutdown", name])
            .await?;
        Ok(())
    }

    async fn domain_destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.run((ObjectKind::Domain, name), &["destroy", name])
            .await?;
        Ok(())
    }

    async fn domain_undefine(&self, name: &str) -> Result<(), HypervisorError> {
        self.run((ObjectKind::Domain, name), &["undefine", name])
            .await?;
        Ok(())
    }

    async fn domain_is_active(&self, name: &str) -> Result<bool, HypervisorError> {
        let out = self
            .run((ObjectKind::Domain, name), &["domstate", name])
            .await?;
        let state = out.trim();
        Ok(!(state == "shut off" || state == "crashed"))
    }

    async fn domain_is_persistent(&self, name: &str) -> Result<bool, HypervisorError> {
        let out = self
            .run((ObjectKind::Domain, name), &["dominfo", name])
            .await?;
        Ok(field(&out, "Persistent") == Some("yes"))
    }

    async fn domain_descriptor(&self, name: &str) -> Result<DomainDescriptor, HypervisorError> {
        let out = self
            .run((ObjectKind::Domain, name), &["dumpxml", name])
            .await?;
        xml::parse_domain(&out)
    }

    async fn domain_snapshots(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        let out = self
            .run((ObjectKind::Domain, name), &["snapshot-list", name, "--name"])
            .await?;
        Ok(table_rows(&out).into_iter().map(str::to_string).collect())
    }

    async fn domain_snapshot_delete(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), HypervisorError> {
        self.run(
            (ObjectKind::Snapshot, snapshot),
            &["snapshot-delete", name, "--snapshotname", snapshot],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = classify(
            ObjectKind::Volume,
            "foo",
            &["vol-info", "foo"],
            "error: failed to get vol 'foo'\nerror: Storage volume not found: no storage vol with matching path 'foo'",
        );
        assert!(err.is_not_found());

        let err = classify(
            ObjectKind::Domain,
            "vm",
            &["dominfo", "vm"],
            "error: failed to get domain 'vm'",
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_other() {
        let err = classify(
            ObjectKind::Volume,
            "foo",
            &["vol-create"],
            "error: operation failed: storage vol 'foo' already exists",
        );
        assert!(err.is_already_exists());

        let err = classify(ObjectKind::Domain, "vm", &["start", "vm"], "error: boom");
        assert!(matches!(err, HypervisorError::Command { .. }));
    }

    #[test]
    fn test_classify_missing_pool_on_volume_command() {
        let err = classify(
            ObjectKind::Volume,
            "foo",
            &["vol-delete", "--pool", "gone", "foo"],
            "error: failed to get pool 'gone'\nerror: Storage pool not found: no storage pool with matching name 'gone'",
        );
        assert!(matches!(
            &err,
            HypervisorError::NotFound { kind: ObjectKind::Pool, name } if name == "gone"
        ));
        assert!(!err.is_not_found_of(ObjectKind::Volume));

        let err = classify(
            ObjectKind::Pool,
            "gone",
            &["vol-list", "--pool", "gone"],
            "error: failed to get pool 'gone'",
        );
        assert!(err.is_not_found_of(ObjectKind::Pool));
    }

    #[test]
    fn test_table_rows() {
        let out = " Name      Path\n------------------\n a   /x/a\n b   /x/b\n\n";
        assert_eq!(table_rows(out), vec!["a   /x/a", "b   /x/b"]);
        assert_eq!(table_rows("vm1\nvm2\n\n"), vec!["vm1", "vm2"]);
    }

    #[test]
    fn test_field() {
        let out = "Name:           disk\nType:           file\nCapacity:       10737418240 bytes\nAllocation:     200704 bytes\n";
        assert_eq!(parse_bytes(field(out, "Capacity"), "capacity").unwrap(), 10737418240);
        assert_eq!(parse_bytes(field(out, "Allocation"), "allocation").unwrap(), 200704);
        assert!(parse_bytes(field(out, "Missing"), "missing").is_err());
    }

    #[test]
    fn test_parse_leases() {
        let out = " Expiry Time           MAC address         Protocol   IP address           Hostname   Client ID or DUID
-------------------------------------------------------------------------------------------------------------------
 2024-05-01 12:00:00   52:54:00:00:00:05   ipv4       192.168.122.5/24     vm5        -
 2024-05-01 12:00:00   52:54:00:00:00:06   ipv4       192.168.122.6/24     -          -
 2024-05-01 12:00:00   52:54:00:00:00:07   ipv6       fd00::7/64           vm7        -
";
        let leases = parse_leases(out);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].mac, "52:54:00:00:00:05");
        assert_eq!(leases[0].hostname.as_deref(), Some("vm5"));
        assert_eq!(leases[1].hostname, None);
    }
}
