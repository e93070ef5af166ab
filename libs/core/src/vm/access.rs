//! Reaching running VMs: addresses, SSH readiness, shells, copies and
//! provisioning.

use std::net::Ipv4Addr;
use std::process::Stdio;

use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::Cancel;
use crate::provision::{ProvisionConfig, Provisioner};
use crate::ssh::{KnownHosts, SshTarget};
use crate::state::{StateStoreError, VmRecord};

use super::{VmError, VmManager};

/// One row of `vm list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSummary {
    pub name: String,
    pub id: u32,
    pub mac: String,
    pub ip: Option<Ipv4Addr>,
    pub running: bool,
}

/// Attempts left for SSH after `spent` failed address lookups. The lookup
/// that succeeded counts as the first SSH attempt's slot.
fn remaining_attempts(count: u32, spent: u32) -> u32 {
    count.saturating_sub(spent).max(1)
}

/// `vm:path` or a plain local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CopyPath<'a> {
    Local(&'a str),
    Remote { vm: &'a str, path: &'a str },
}

impl<'a> CopyPath<'a> {
    pub(crate) fn parse(arg: &'a str) -> Self {
        match arg.split_once(':') {
            Some((vm, path)) if !vm.is_empty() && !vm.contains('/') => {
                CopyPath::Remote { vm, path }
            }
            _ => CopyPath::Local(arg),
        }
    }
}

impl VmManager {
    fn require_record(&self, name: &str) -> Result<VmRecord, VmError> {
        match self.state.require_vm(name) {
            Ok(record) => Ok(record),
            Err(StateStoreError::NotFound(_)) => Err(VmError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Current address of a VM: its lease, else its DHCP host entry, else
    /// for static DHCP the address derived from its ID.
    pub async fn vm_ip(&self, name: &str) -> Result<Option<Ipv4Addr>, VmError> {
        let record = self.require_record(name)?;
        self.record_ip(&record).await
    }

    async fn record_ip(&self, record: &VmRecord) -> Result<Option<Ipv4Addr>, VmError> {
        if let Some(ip) = self.dhcp.lookup_ip(&record.mac).await? {
            return Ok(Some(ip));
        }
        if record.static_dhcp {
            return Ok(Some(self.dhcp.ip_for_id(record.id).await?));
        }
        Ok(None)
    }

    /// SSH target of a VM with a known address.
    pub async fn ssh_target(&self, name: &str) -> Result<SshTarget, VmError> {
        let record = self.require_record(name)?;
        let ip = self
            .record_ip(&record)
            .await?
            .ok_or_else(|| VmError::NoAddress(name.to_string()))?;
        Ok(SshTarget {
            name: record.name,
            ip,
            user: record.user_name,
            host_key: record.host_key,
        })
    }

    /// Targets for several VMs, in order.
    pub async fn ssh_targets(&self, names: &[String]) -> Result<Vec<SshTarget>, VmError> {
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            targets.push(self.ssh_target(name).await?);
        }
        Ok(targets)
    }

    /// Wait until a VM accepts SSH connections with its own host key.
    ///
    /// The address lookup and the connection share one budget of the
    /// configured count of attempts, the configured period apart.
    pub async fn ping_ssh(&self, name: &str, cancel: &Cancel) -> Result<(), VmError> {
        let mut attempt = 0;
        let target = loop {
            attempt += 1;
            match self.ssh_target(name).await {
                Ok(target) => break target,
                Err(VmError::NoAddress(_)) if attempt < self.ping_count => {
                    debug!(vm = %name, attempt, "No address yet");
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.ping_period) => {}
                _ = cancel.cancelled() => return Err(VmError::Cancelled(name.to_string())),
            }
        };

        let known_hosts = KnownHosts::write(std::slice::from_ref(&target))?;
        let remaining = remaining_attempts(self.ping_count, attempt - 1);
        self.ssh
            .ping(&target, known_hosts.path(), remaining, self.ping_period, cancel)
            .await?;
        info!(vm = %name, ip = %target.ip, "VM is reachable over SSH");
        Ok(())
    }

    /// Wait for several VMs at once; the first failure cancels the rest.
    pub async fn vm_wait_ready(&self, names: &[String], cancel: &Cancel) -> Result<(), VmError> {
        let mut tasks = JoinSet::new();
        for name in names {
            let this = self.clone();
            let name = name.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { this.ping_ssh(&name, &cancel).await });
        }
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(r) => r,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(VmError::Command {
                    command: "wait-ready".to_string(),
                    stderr: e.to_string(),
                }),
            };
            if let Err(e) = result {
                tasks.abort_all();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Whether a domain of that name is defined.
    pub async fn vm_exists(&self, name: &str) -> Result<bool, VmError> {
        match self.conn().domain_descriptor(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All VMs with metadata, with their addresses and run state.
    pub async fn vm_list(&self) -> Result<Vec<VmSummary>, VmError> {
        let mut out = Vec::new();
        for record in self.state.list_vms()? {
            let running = match self.conn().domain_is_active(&record.name).await {
                Ok(active) => active,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e.into()),
            };
            let ip = match self.record_ip(&record).await {
                Ok(ip) => ip,
                Err(e) => {
                    warn!(vm = %record.name, error = %e, "Failed to resolve VM address");
                    None
                }
            };
            out.push(VmSummary {
                name: record.name,
                id: record.id,
                mac: record.mac,
                ip,
                running,
            });
        }
        Ok(out)
    }

    /// The known_hosts line of a VM.
    pub async fn vm_host_key(&self, name: &str) -> Result<String, VmError> {
        let record = self.require_record(name)?;
        let ip = self.record_ip(&record).await?;
        let host = match ip {
            Some(ip) => format!("{},{}", record.name, ip),
            None => record.name.clone(),
        };
        Ok(format!("{host} {}", record.host_key))
    }

    /// Interactive SSH session, or a single command when `command` is not
    /// empty. Returns the exit code.
    pub async fn vm_ssh(&self, name: &str, command: &[String]) -> Result<i32, VmError> {
        let target = self.ssh_target(name).await?;
        let known_hosts = KnownHosts::write(std::slice::from_ref(&target))?;

        let status = self
            .ssh
            .command(&target, known_hosts.path())
            .args(command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Copy with rsync. `vm:path` arguments name paths on a VM.
    pub async fn vm_cp(&self, sources: &[String], dest: &str, cancel: &Cancel) -> Result<(), VmError> {
        let mut targets: Vec<SshTarget> = Vec::new();
        let mut args = Vec::with_capacity(sources.len() + 1);
        for arg in sources.iter().map(String::as_str).chain(std::iter::once(dest)) {
            match CopyPath::parse(arg) {
                CopyPath::Local(path) => args.push(path.to_string()),
                CopyPath::Remote { vm, path } => {
                    let target = match targets.iter().find(|t| t.name == vm) {
                        Some(t) => t.clone(),
                        None => {
                            let t = self.ssh_target(vm).await?;
                            targets.push(t.clone());
                            t
                        }
                    };
                    args.push(format!("{}@{}:{}", target.user, target.ip, path));
                }
            }
        }

        let known_hosts = KnownHosts::write(&targets)?;
        let transport = self.ssh.rsync_transport(known_hosts.path());
        let child = Command::new("rsync")
            .args(["-a", "-e", transport.as_str()])
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::select! {
            o = child => o?,
            _ = cancel.cancelled() => return Err(VmError::Cancelled(dest.to_string())),
        };
        if !output.status.success() {
            return Err(VmError::Command {
                command: "rsync".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Run provisioning steps against running VMs.
    pub async fn vm_exec(
        &self,
        names: &[String],
        provisioner: &Provisioner,
        config: &ProvisionConfig,
        cancel: &Cancel,
    ) -> Result<(), VmError> {
        for name in names {
            self.ping_ssh(name, cancel).await?;
        }
        let targets = self.ssh_targets(names).await?;
        provisioner.run(&targets, config, cancel).await?;
        Ok(())
    }
}
