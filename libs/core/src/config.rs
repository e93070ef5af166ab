//! Configuration.
//!
//! Loaded from `$VIRTER_CONFIG` or `virter.toml` in the user config
//! directory. Every field has a default, so a missing file is fine.
//! `VIRTER_<SECTION>_<KEY>` environment variables override file values.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::container::PullPolicy;
use crate::registry::RegistryConfig;

/// Configuration file name.
const CONFIG_FILE: &str = "virter.toml";

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "linbit", "virter")
}

fn config_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".virter"))
}

/// Which hypervisor backend to drive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Virsh,
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "virsh" | "libvirt" => Ok(Backend::Virsh),
            "memory" => Ok(Backend::Memory),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub backend: Backend,
    /// Connection URI passed to `virsh --connect`.
    pub uri: Option<String>,
    pub pool: String,
    pub network: String,
    /// Leave DHCP to an external server; VM IDs must then be explicit.
    pub static_dhcp: bool,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            uri: None,
            pool: "default".to_string(),
            network: "default".to_string(),
            static_dhcp: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    pub ssh_ping_count: u32,
    /// Seconds between SSH attempts.
    pub ssh_ping_period: u64,
    /// Seconds to wait for a VM to shut down.
    pub shutdown_timeout: u64,
    /// Milliseconds between shutdown polls.
    pub shutdown_poll: u64,
    /// Seconds a provisioning run may take; 0 means no limit.
    pub provision_timeout: u64,
    /// Seconds allowed for copying files out of a container.
    pub copy_timeout: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            ssh_ping_count: 300,
            ssh_ping_period: 1,
            shutdown_timeout: 300,
            shutdown_poll: 500,
            provision_timeout: 0,
            copy_timeout: 60,
        }
    }
}

impl TimeConfig {
    pub fn ssh_ping_period(&self) -> Duration {
        Duration::from_secs(self.ssh_ping_period)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll)
    }

    pub fn provision_timeout(&self) -> Option<Duration> {
        (self.provision_timeout > 0).then(|| Duration::from_secs(self.provision_timeout))
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub user_public_key: PathBuf,
    pub user_private_key: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let dir = config_dir();
        Self {
            user_public_key: dir.join("id_rsa.pub"),
            user_private_key: dir.join("id_rsa"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    pub socket: PathBuf,
    pub pull_policy: PullPolicy,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/run/docker.sock"),
            pull_policy: PullPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub token: Option<String>,
    pub plain_http: bool,
}

/// virter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub libvirt: LibvirtConfig,
    pub time: TimeConfig,
    pub auth: AuthConfig,
    pub container: ContainerSection,
    pub registry: RegistrySection,
    /// Directory for the metadata database.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".virter"));
        Self {
            libvirt: LibvirtConfig::default(),
            time: TimeConfig::default(),
            auth: AuthConfig::default(),
            container: ContainerSection::default(),
            registry: RegistrySection::default(),
            data_dir,
        }
    }
}

impl Config {
    /// Load from the default location and apply process environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None, |key| std::env::var(key).ok())
    }

    /// Load from `path` (or the default location) and apply overrides from `lookup`.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => lookup("VIRTER_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(Self::default_path),
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let parsed = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            debug!(path = %path.display(), "Loaded configuration");
            parsed
        } else {
            Self::default()
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        config_dir().join(CONFIG_FILE)
    }

    /// Apply `VIRTER_*` overrides.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                })
        }

        if let Some(v) = lookup("VIRTER_LIBVIRT_BACKEND") {
            self.libvirt.backend = parse("VIRTER_LIBVIRT_BACKEND", v)?;
        }
        if let Some(v) = lookup("VIRTER_LIBVIRT_URI") {
            self.libvirt.uri = Some(v);
        }
        if let Some(v) = lookup("VIRTER_LIBVIRT_POOL") {
            self.libvirt.pool = v;
        }
        if let Some(v) = lookup("VIRTER_LIBVIRT_NETWORK") {
            self.libvirt.network = v;
        }
        if let Some(v) = lookup("VIRTER_LIBVIRT_STATIC_DHCP") {
            self.libvirt.static_dhcp = parse("VIRTER_LIBVIRT_STATIC_DHCP", v)?;
        }
        if let Some(v) = lookup("VIRTER_TIME_SSH_PING_COUNT") {
            self.time.ssh_ping_count = parse("VIRTER_TIME_SSH_PING_COUNT", v)?;
        }
        if let Some(v) = lookup("VIRTER_TIME_SSH_PING_PERIOD") {
            self.time.ssh_ping_period = parse("VIRTER_TIME_SSH_PING_PERIOD", v)?;
        }
        if let Some(v) = lookup("VIRTER_TIME_SHUTDOWN_TIMEOUT") {
            self.time.shutdown_timeout = parse("VIRTER_TIME_SHUTDOWN_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("VIRTER_AUTH_USER_PUBLIC_KEY") {
            self.auth.user_public_key = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIRTER_AUTH_USER_PRIVATE_KEY") {
            self.auth.user_private_key = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIRTER_CONTAINER_SOCKET") {
            self.container.socket = PathBuf::from(v);
        }
        if let Some(v) = lookup("VIRTER_CONTAINER_PULL_POLICY") {
            self.container.pull_policy = parse("VIRTER_CONTAINER_PULL_POLICY", v)?;
        }
        if let Some(v) = lookup("VIRTER_REGISTRY_TOKEN") {
            self.registry.token = Some(v);
        }
        if let Some(v) = lookup("VIRTER_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("virter.db")
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            token: self.registry.token.clone(),
            plain_http: self.registry.plain_http,
            ..RegistryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(Some(&dir.path().join("none.toml")), env(&[])).unwrap();
        assert_eq!(config.libvirt.pool, "default");
        assert_eq!(config.time.shutdown_poll(), Duration::from_millis(500));
        assert_eq!(config.container.pull_policy, PullPolicy::IfNotExist);
        assert!(config.time.provision_timeout().is_none());
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("virter.toml");
        std::fs::write(
            &path,
            r#"
            data_dir = "/var/lib/virter"

            [libvirt]
            pool = "images"
            static_dhcp = true

            [time]
            shutdown_timeout = 30

            [container]
            pull_policy = "never"
            "#,
        )
        .unwrap();

        let config = Config::load_with(
            Some(&path),
            env(&[("VIRTER_LIBVIRT_POOL", "fast"), ("VIRTER_REGISTRY_TOKEN", "t")]),
        )
        .unwrap();
        assert_eq!(config.libvirt.pool, "fast");
        assert!(config.libvirt.static_dhcp);
        assert_eq!(config.libvirt.network, "default");
        assert_eq!(config.time.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.container.pull_policy, PullPolicy::Never);
        assert_eq!(config.registry_config().token.as_deref(), Some("t"));
        assert_eq!(config.state_db_path(), PathBuf::from("/var/lib/virter/virter.db"));
    }

    #[test]
    fn test_config_path_from_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[libvirt]\nnetwork = \"lab\"\n").unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let config = Config::load_with(None, env(&[("VIRTER_CONFIG", path_str.as_str())])).unwrap();
        assert_eq!(config.libvirt.network, "lab");
    }

    #[test]
    fn test_invalid_env_value() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_with(
            Some(&dir.path().join("none.toml")),
            env(&[("VIRTER_TIME_SSH_PING_COUNT", "many")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key, .. } if key == "VIRTER_TIME_SSH_PING_COUNT"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[libvirt\n").unwrap();
        let err = Config::load_with(Some(&path), env(&[])).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }
}
