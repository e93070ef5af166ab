//! Shell steps: `bash -s` over SSH with the script on stdin.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::debug;

use crate::cancel::Cancel;
use crate::ssh::{shell_quote, SshTarget};

use super::output::forward_lines;
use super::{join_fail_fast, ProvisionError, Provisioner};

/// Script text fed to the remote shell: env exports, then the script.
pub(crate) fn remote_input(script: &str, env: &BTreeMap<String, String>) -> String {
    let mut input = String::new();
    for (key, value) in env {
        input.push_str(&format!("export {key}={}\n", shell_quote(value)));
    }
    input.push_str(script);
    if !script.ends_with('\n') {
        input.push('\n');
    }
    input
}

impl Provisioner {
    pub(super) async fn run_shell(
        &self,
        step: usize,
        targets: &[SshTarget],
        known_hosts: &Path,
        script: &str,
        env: &BTreeMap<String, String>,
        cancel: &Cancel,
    ) -> Result<(), ProvisionError> {
        let input = remote_input(script, env);
        let mut tasks = JoinSet::new();
        for target in targets {
            let this = self.clone();
            let target = target.clone();
            let known_hosts = known_hosts.to_path_buf();
            let input = input.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                this.shell_on(step, &target, &known_hosts, &input, &cancel)
                    .await
            });
        }
        join_fail_fast(tasks).await
    }

    async fn shell_on(
        &self,
        step: usize,
        target: &SshTarget,
        known_hosts: &Path,
        input: &str,
        cancel: &Cancel,
    ) -> Result<(), ProvisionError> {
        self.ssh
            .wait_connectable(target, known_hosts, self.retry_period, cancel)
            .await?;
        debug!(vm = %target.name, step, "Running shell step");

        let mut child = self
            .ssh
            .command(target, known_hosts)
            .args(["bash", "-s"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(forward_lines(out, target.name.clone(), self.stdout.clone()))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(forward_lines(err, target.name.clone(), self.stderr.clone()))
        });

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let status = tokio::select! {
            s = child.wait() => s?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ProvisionError::Cancelled);
            }
        };

        for handle in [stdout, stderr].into_iter().flatten() {
            let _ = handle.await;
        }

        if !status.success() {
            return Err(ProvisionError::StepFailed {
                vm: target.name.clone(),
                step,
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_input_exports_env_first() {
        let mut env = BTreeMap::new();
        env.insert("NAME".to_string(), "it's".to_string());
        env.insert("A".to_string(), "1".to_string());
        assert_eq!(
            remote_input("echo $NAME", &env),
            "export A='1'\nexport NAME='it'\\''s'\necho $NAME\n"
        );
    }
}
