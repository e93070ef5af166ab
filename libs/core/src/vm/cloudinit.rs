//! Cloud-init seed data.
//!
//! A VM receives its hostname, the authorized user keys and a pre-generated
//! host key through a NoCloud seed: an ISO with volume label `cidata`
//! holding `meta-data` and `user-data`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::ssh::{generate_key_pair, KeyPair, SshError};

use super::VmError;

/// Render the `meta-data` file.
pub fn meta_data(name: &str) -> String {
    format!("instance-id: {name}\nlocal-hostname: {name}\n")
}

/// Render the `user-data` file.
pub fn user_data(name: &str, authorized_keys: &[String], host_key: &KeyPair) -> String {
    let mut out = String::from("#cloud-config\n");
    out.push_str(&format!("hostname: {name}\n"));
    out.push_str("disable_root: false\n");
    out.push_str("ssh_pwauth: false\n");

    out.push_str("ssh_authorized_keys:\n");
    for key in authorized_keys {
        out.push_str(&format!("  - {}\n", key.trim()));
    }

    out.push_str("ssh_keys:\n");
    out.push_str("  rsa_private: |\n");
    for line in host_key.private.lines() {
        out.push_str(&format!("    {line}\n"));
    }
    out.push_str(&format!("  rsa_public: {}\n", host_key.public.trim()));
    out
}

/// Builds the seed image from named files.
#[async_trait]
pub trait IsoBuilder: Send + Sync {
    async fn build(&self, files: &[(&str, String)]) -> Result<Vec<u8>, VmError>;
}

/// Builds ISO images with `genisoimage`.
#[derive(Debug, Clone, Default)]
pub struct GenIsoImage;

#[async_trait]
impl IsoBuilder for GenIsoImage {
    async fn build(&self, files: &[(&str, String)]) -> Result<Vec<u8>, VmError> {
        let dir = tempfile::TempDir::with_prefix("virter-cidata-")?;
        for (name, content) in files {
            tokio::fs::write(dir.path().join(name), content).await?;
        }
        let iso = dir.path().join("cidata.iso");

        let output = Command::new("genisoimage")
            .arg("-output")
            .arg(&iso)
            .args(["-volid", "cidata", "-joliet", "-rock", "-quiet"])
            .args(files.iter().map(|(name, _)| *name))
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(VmError::Command {
                command: "genisoimage".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(tokio::fs::read(&iso).await?)
    }
}

/// Source of per-VM host key pairs.
#[async_trait]
pub trait HostKeySource: Send + Sync {
    async fn generate(&self) -> Result<KeyPair, SshError>;
}

/// Generates host keys with `ssh-keygen`.
#[derive(Debug, Clone, Default)]
pub struct SshKeygen;

#[async_trait]
impl HostKeySource for SshKeygen {
    async fn generate(&self) -> Result<KeyPair, SshError> {
        generate_key_pair().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_data() {
        assert_eq!(meta_data("vm1"), "instance-id: vm1\nlocal-hostname: vm1\n");
    }

    #[test]
    fn test_user_data_layout() {
        let key = KeyPair {
            private: "-----BEGIN KEY-----\nabc\n-----END KEY-----\n".to_string(),
            public: "ssh-rsa HOSTKEY".to_string(),
        };
        let data = user_data("vm1", &["ssh-ed25519 USERKEY me@host\n".to_string()], &key);
        assert_eq!(
            data,
            "#cloud-config\n\
             hostname: vm1\n\
             disable_root: false\n\
             ssh_pwauth: false\n\
             ssh_authorized_keys:\n  - ssh-ed25519 USERKEY me@host\n\
             ssh_keys:\n  rsa_private: |\n    -----BEGIN KEY-----\n    abc\n    -----END KEY-----\n  rsa_public: ssh-rsa HOSTKEY\n"
        );
    }
}
