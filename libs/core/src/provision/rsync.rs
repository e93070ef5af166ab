//! Rsync steps: copy local files matching a glob to every VM.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::debug;

use crate::cancel::Cancel;
use crate::ssh::SshTarget;

use super::{join_fail_fast, ProvisionError, Provisioner, RsyncStep};

/// Local files matching `pattern`, sorted.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, ProvisionError> {
    let entries = glob::glob(pattern).map_err(|source| ProvisionError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries.flatten().collect();
    if files.is_empty() {
        return Err(ProvisionError::NoMatch(pattern.to_string()));
    }
    files.sort();
    Ok(files)
}

impl Provisioner {
    pub(super) async fn run_rsync(
        &self,
        targets: &[SshTarget],
        known_hosts: &Path,
        step: &RsyncStep,
        cancel: &Cancel,
    ) -> Result<(), ProvisionError> {
        let files = expand_glob(&step.source)?;
        let transport = self.ssh.rsync_transport(known_hosts);

        let mut tasks = JoinSet::new();
        for target in targets {
            let target = target.clone();
            let files = files.clone();
            let transport = transport.clone();
            let dest = step.dest.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { rsync_to(&target, &files, &dest, &transport, &cancel).await });
        }
        join_fail_fast(tasks).await
    }
}

async fn rsync_to(
    target: &SshTarget,
    files: &[PathBuf],
    dest: &str,
    transport: &str,
    cancel: &Cancel,
) -> Result<(), ProvisionError> {
    debug!(vm = %target.name, files = files.len(), dest, "Copying files");
    let output = Command::new("rsync")
        .args(["-a", "-e", transport])
        .args(files)
        .arg(format!("{}@{}:{}", target.user, target.ip, dest))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::select! {
        o = output => o?,
        _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
    };
    if !output.status.success() {
        return Err(ProvisionError::Rsync {
            vm: target.name.clone(),
            status: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}
