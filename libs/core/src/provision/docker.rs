//! Container steps.
//!
//! The container gets an SSH setup for reaching every target: the user
//! private key, a known_hosts pinned to the VM host keys and an ssh config
//! mapping VM names to addresses. `TARGETS` lists the VM names.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::cancel::Cancel;
use crate::container::{ContainerBackend, ContainerConfig, Mount};
use crate::ssh::{KnownHosts, SshTarget};

use super::output::forward_lines;
use super::{DockerStep, ProvisionError, Provisioner};

const SSH_DIR: &str = "/root/.ssh";
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// `ssh_config` entries resolving VM names inside the container.
pub(crate) fn ssh_config(targets: &[SshTarget]) -> String {
    let mut out = String::new();
    for t in targets {
        out.push_str(&format!(
            "Host {}\n    HostName {}\n    User {}\n    HostKeyAlias {}\n    IdentityFile {SSH_DIR}/id_rsa\n    StrictHostKeyChecking yes\n\n",
            t.name, t.ip, t.user, t.name
        ));
    }
    out
}

/// Files mounted into the container at `/root/.ssh`.
struct SshMounts {
    dir: TempDir,
    private_key: String,
}

impl SshMounts {
    fn write(targets: &[SshTarget], private_key: &Path) -> Result<Self, ProvisionError> {
        let dir = TempDir::with_prefix("virter-docker-")?;
        let key = std::fs::read_to_string(private_key)?;

        let key_path = dir.path().join("id_rsa");
        std::fs::write(&key_path, &key)?;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        std::fs::write(dir.path().join("known_hosts"), KnownHosts::render(targets))?;
        std::fs::write(dir.path().join("config"), ssh_config(targets))?;

        Ok(Self {
            dir,
            private_key: key,
        })
    }

    fn mounts(&self) -> Vec<Mount> {
        ["id_rsa", "known_hosts", "config"]
            .iter()
            .map(|f| Mount::read_only(self.dir.path().join(f), format!("{SSH_DIR}/{f}")))
            .collect()
    }
}

impl Provisioner {
    pub(super) async fn run_docker(
        &self,
        step: usize,
        targets: &[SshTarget],
        docker: &DockerStep,
        env: &BTreeMap<String, String>,
        cancel: &Cancel,
    ) -> Result<(), ProvisionError> {
        let backend = self
            .containers
            .clone()
            .ok_or(ProvisionError::NoContainerBackend)?;
        let ssh = SshMounts::write(targets, self.ssh.private_key())?;

        let mut env = env.clone();
        env.insert(
            "TARGETS".to_string(),
            targets
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
        env.insert("SSH_PRIVATE_KEY".to_string(), ssh.private_key.clone());

        let config = ContainerConfig {
            name: String::new(),
            image: docker.image.clone(),
            env,
            command: docker.command.clone(),
            mounts: ssh.mounts(),
            pull: self.pull_policy,
        };

        let id = backend.create(&config).await?;
        info!(container = %id, image = %docker.image, step, "Started provisioning container");

        let result = self.drive_container(&backend, &id, step, cancel).await;

        let copied = match &docker.copy {
            Some(copy) => {
                self.copy_out(&backend, &id, &copy.source, &copy.dest)
                    .await
            }
            None => Ok(()),
        };

        cleanup(&backend, &id).await;

        match (result, copied) {
            (Err(e), Err(copy_err)) => {
                warn!(container = %id, error = %copy_err, "Copy out of failed container also failed");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn drive_container(
        &self,
        backend: &Arc<dyn ContainerBackend>,
        id: &str,
        step: usize,
        cancel: &Cancel,
    ) -> Result<(), ProvisionError> {
        backend.start(id).await?;

        let prefix: String = id.chars().take(12).collect();
        let logs = backend.logs(id).await?;
        let stdout = tokio::spawn(forward_lines(logs.stdout, prefix.clone(), self.stdout.clone()));
        let stderr = tokio::spawn(forward_lines(logs.stderr, prefix, self.stderr.clone()));

        let status = tokio::select! {
            s = backend.wait(id) => s?,
            _ = cancel.cancelled() => {
                stdout.abort();
                stderr.abort();
                return Err(ProvisionError::Cancelled);
            }
        };
        let _ = stdout.await;
        let _ = stderr.await;

        debug!(container = %id, status, "Provisioning container exited");
        if status != 0 {
            return Err(ProvisionError::ContainerFailed { step, status });
        }
        Ok(())
    }

    /// Runs under its own deadline so a cancelled step still yields its
    /// output files.
    async fn copy_out(
        &self,
        backend: &Arc<dyn ContainerBackend>,
        id: &str,
        source: &str,
        dest: &Path,
    ) -> Result<(), ProvisionError> {
        tokio::fs::create_dir_all(dest).await?;
        match tokio::time::timeout(self.copy_timeout, backend.copy_from(id, source, dest)).await {
            Ok(r) => {
                r?;
                info!(container = %id, source, dest = %dest.display(), "Copied files out of container");
                Ok(())
            }
            Err(_) => Err(ProvisionError::CopyTimeout {
                source_path: source.to_string(),
                timeout: self.copy_timeout,
            }),
        }
    }
}

async fn cleanup(backend: &Arc<dyn ContainerBackend>, id: &str) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, backend.stop(id, STOP_GRACE)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_not_found() => {}
        Ok(Err(e)) => warn!(container = %id, error = %e, "Failed to stop container"),
        Err(_) => warn!(container = %id, "Timed out stopping container"),
    }
    match tokio::time::timeout(CLEANUP_TIMEOUT, backend.remove(id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(container = %id, error = %e, "Failed to remove container"),
        Err(_) => warn!(container = %id, "Timed out removing container"),
    }
}
