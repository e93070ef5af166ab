//! SSH plumbing over the OpenSSH command line tools.
//!
//! VMs are reached with the user key from the configuration and verified
//! against the host key captured when the VM was created. That key is
//! written to a private known_hosts file; the system known_hosts is never
//! consulted.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::cancel::Cancel;

/// Errors from SSH operations.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh-keygen failed: {0}")]
    Keygen(String),

    #[error("ssh to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("{host} not reachable over SSH after {attempts} attempts: {last}")]
    Exhausted {
        host: String,
        attempts: u32,
        last: String,
    },

    #[error("cancelled while waiting for SSH on {0}")]
    Cancelled(String),
}

/// A key pair in OpenSSH formats.
#[derive(Clone)]
pub struct KeyPair {
    /// PEM private key.
    pub private: String,
    /// `<type> <base64>` without comment.
    pub public: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Generate an RSA key pair with `ssh-keygen`.
pub async fn generate_key_pair() -> Result<KeyPair, SshError> {
    let dir = TempDir::with_prefix("virter-key-")?;
    let path = dir.path().join("key");
    keygen(&path).await?;

    let private = tokio::fs::read_to_string(&path).await?;
    let public = tokio::fs::read_to_string(path.with_extension("pub")).await?;
    Ok(KeyPair {
        private,
        public: strip_comment(&public),
    })
}

/// Create the user key pair at `private_key` unless it already exists.
pub async fn ensure_user_key(private_key: &Path) -> Result<String, SshError> {
    let public_path = public_key_path(private_key);
    if !tokio::fs::try_exists(private_key).await? {
        if let Some(parent) = private_key.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        keygen(private_key).await?;
        info!(path = %private_key.display(), "Generated user SSH key");
    }
    let public = tokio::fs::read_to_string(&public_path).await?;
    Ok(public.trim().to_string())
}

fn public_key_path(private_key: &Path) -> PathBuf {
    let mut name = private_key.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

async fn keygen(path: &Path) -> Result<(), SshError> {
    let output = Command::new("ssh-keygen")
        .args(["-q", "-t", "rsa", "-b", "4096", "-N", "", "-C", "", "-f"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(SshError::Keygen(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

fn strip_comment(public: &str) -> String {
    public
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// A VM reachable over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub name: String,
    pub ip: Ipv4Addr,
    pub user: String,
    /// Public host key, `<type> <base64>`.
    pub host_key: String,
}

/// A temporary known_hosts file.
#[derive(Debug)]
pub struct KnownHosts {
    _dir: TempDir,
    path: PathBuf,
}

impl KnownHosts {
    /// Write one entry per target, keyed by both name and address.
    pub fn write(targets: &[SshTarget]) -> Result<Self, SshError> {
        let dir = TempDir::with_prefix("virter-ssh-")?;
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, Self::render(targets))?;
        Ok(Self { _dir: dir, path })
    }

    pub fn render(targets: &[SshTarget]) -> String {
        targets
            .iter()
            .map(|t| format!("{},{} {}\n", t.name, t.ip, t.host_key))
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Builds `ssh` invocations against VMs.
#[derive(Debug, Clone)]
pub struct SshClient {
    private_key: PathBuf,
    connect_timeout: Duration,
}

impl SshClient {
    pub fn new(private_key: impl Into<PathBuf>) -> Self {
        Self {
            private_key: private_key.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn private_key(&self) -> &Path {
        &self.private_key
    }

    /// Options shared by `ssh` and the rsync transport.
    pub fn options(&self, known_hosts: &Path) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", known_hosts.display()),
            "-o".to_string(),
            "GlobalKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-i".to_string(),
            self.private_key.display().to_string(),
        ]
    }

    /// `ssh` command for `target` without a remote command.
    pub fn command(&self, target: &SshTarget, known_hosts: &Path) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.options(known_hosts))
            .arg("-o")
            .arg(format!("HostKeyAlias={}", target.name))
            .arg(format!("{}@{}", target.user, target.ip));
        cmd
    }

    /// Remote shell string for rsync's `-e`.
    pub fn rsync_transport(&self, known_hosts: &Path) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.options(known_hosts).iter().map(|o| shell_quote(o)));
        parts.join(" ")
    }

    /// One connection attempt running `true`.
    pub async fn try_connect(&self, target: &SshTarget, known_hosts: &Path) -> Result<(), SshError> {
        let output = self
            .command(target, known_hosts)
            .arg("true")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        Err(SshError::Connect {
            host: target.name.clone(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Retry [`try_connect`](Self::try_connect) up to `count` times, `period` apart.
    pub async fn ping(
        &self,
        target: &SshTarget,
        known_hosts: &Path,
        count: u32,
        period: Duration,
        cancel: &Cancel,
    ) -> Result<(), SshError> {
        let mut last = String::from("no attempt made");
        for attempt in 1..=count {
            let result = tokio::select! {
                r = self.try_connect(target, known_hosts) => r,
                _ = cancel.cancelled() => return Err(SshError::Cancelled(target.name.clone())),
            };
            match result {
                Ok(()) => {
                    debug!(vm = %target.name, attempt, "SSH ready");
                    return Ok(());
                }
                Err(SshError::Connect { reason, .. }) => {
                    debug!(vm = %target.name, attempt, reason = %reason, "SSH not ready");
                    last = reason;
                }
                Err(e) => return Err(e),
            }

            if attempt < count {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = cancel.cancelled() => return Err(SshError::Cancelled(target.name.clone())),
                }
            }
        }
        Err(SshError::Exhausted {
            host: target.name.clone(),
            attempts: count,
            last,
        })
    }

    /// Retry [`try_connect`](Self::try_connect) until it succeeds or `cancel` fires.
    pub async fn wait_connectable(
        &self,
        target: &SshTarget,
        known_hosts: &Path,
        period: Duration,
        cancel: &Cancel,
    ) -> Result<(), SshError> {
        loop {
            let result = tokio::select! {
                r = self.try_connect(target, known_hosts) => r,
                _ = cancel.cancelled() => return Err(SshError::Cancelled(target.name.clone())),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(SshError::Connect { reason, .. }) => {
                    debug!(vm = %target.name, reason = %reason, "SSH not ready, retrying");
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = cancel.cancelled() => return Err(SshError::Cancelled(target.name.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;

    fn target() -> SshTarget {
        SshTarget {
            name: "vm1".to_string(),
            ip: "192.168.122.11".parse().unwrap(),
            user: "root".to_string(),
            host_key: "ssh-rsa AAAAB3Nza".to_string(),
        }
    }

    #[test]
    fn test_known_hosts_entries() {
        let known = KnownHosts::write(&[target()]).unwrap();
        let content = std::fs::read_to_string(known.path()).unwrap();
        assert_eq!(content, "vm1,192.168.122.11 ssh-rsa AAAAB3Nza\n");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("ssh-rsa AAAA user@host\n"), "ssh-rsa AAAA");
    }

    #[test]
    fn test_public_key_path() {
        assert_eq!(
            public_key_path(Path::new("/home/u/.config/virter/id_rsa")),
            PathBuf::from("/home/u/.config/virter/id_rsa.pub")
        );
    }

    #[test]
    fn test_options_pin_known_hosts() {
        let client = SshClient::new("/keys/id_rsa");
        let opts = client.options(Path::new("/tmp/kh")).join(" ");
        assert!(opts.contains("StrictHostKeyChecking=yes"));
        assert!(opts.contains("UserKnownHostsFile=/tmp/kh"));
        assert!(opts.contains("-i /keys/id_rsa"));
    }

    #[tokio::test]
    async fn test_ping_stops_on_cancel() {
        let (handle, cancel) = cancel_pair();
        handle.cancel();
        let client = SshClient::new("/nonexistent/key");
        let err = client
            .ping(
                &target(),
                Path::new("/dev/null"),
                100,
                Duration::from_secs(60),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Cancelled(_)));
    }
}
