//! CLI commands.

mod image;
mod network;
mod vm;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use virter_core::config::Backend;
use virter_core::container::DockerClient;
use virter_core::network::DhcpAllocator;
use virter_core::provision::{ProvisionConfig, ProvisionStep, Provisioner};
use virter_core::registry::OciRegistryClient;
use virter_core::ssh::{ensure_user_key, SshClient};
use virter_core::state::StateStore;
use virter_core::{
    cancel_pair, Cancel, Config, Hypervisor, LayerStore, VirshHypervisor, VmManager,
};

use crate::error::CliError;
use crate::output::OutputFormat;

/// virter - run and provision VMs from layered images.
#[derive(Debug, Parser)]
#[command(name = "virter")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Log filter, e.g. `debug` or `virter_core=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log line format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Configuration file.
    #[arg(long, global = true, env = "VIRTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage layered images.
    Image(image::ImageCommand),

    /// Manage libvirt networks.
    Network(network::NetworkCommand),

    /// Run, provision and remove VMs.
    Vm(vm::VmCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let format = OutputFormat::parse(&self.format);
        let config = Config::load_with(self.config.as_deref(), |key| std::env::var(key).ok())
            .context("Failed to load configuration")?;

        let ctx = CommandContext::new(config, format)?;

        match self.command {
            Commands::Image(cmd) => cmd.run(ctx).await,
            Commands::Network(cmd) => cmd.run(ctx).await,
            Commands::Vm(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("virter {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
    conn: Arc<dyn Hypervisor>,
}

impl CommandContext {
    /// Each invocation is a separate process, so only backends that persist
    /// state outside it are accepted here.
    fn new(config: Config, format: OutputFormat) -> Result<Self> {
        let conn: Arc<dyn Hypervisor> = match config.libvirt.backend {
            Backend::Virsh => Arc::new(VirshHypervisor::new(config.libvirt.uri.clone())),
            Backend::Memory => return Err(CliError::UnsupportedBackend("memory".into()).into()),
        };
        Ok(Self {
            config,
            format,
            conn,
        })
    }

    pub fn conn(&self) -> &dyn Hypervisor {
        self.conn.as_ref()
    }

    /// DHCP allocator for `network`, or the configured network.
    pub fn dhcp(&self, network: Option<&str>) -> DhcpAllocator {
        let network = network.unwrap_or(&self.config.libvirt.network);
        DhcpAllocator::new(self.conn.clone(), network)
    }

    /// Layer store on the configured pool.
    pub fn store(&self) -> LayerStore {
        LayerStore::new(self.conn.clone(), self.config.libvirt.pool.clone())
    }

    pub fn registry(&self) -> Result<OciRegistryClient> {
        OciRegistryClient::new(self.config.registry_config())
            .context("Failed to create registry client")
    }

    pub fn ssh(&self) -> SshClient {
        SshClient::new(self.config.auth.user_private_key.clone())
    }

    /// Public half of the user key, generating the pair on first use.
    pub async fn user_public_key(&self) -> Result<String> {
        let path = &self.config.auth.user_private_key;
        ensure_user_key(path)
            .await
            .with_context(|| format!("Failed to prepare SSH key {}", path.display()))
    }

    /// VM orchestrator for the configured network.
    pub fn vms(&self) -> Result<VmManager> {
        let db = self.config.state_db_path();
        if let Some(dir) = db.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let state = StateStore::open(&db)
            .with_context(|| format!("Failed to open state database {}", db.display()))?;

        let time = &self.config.time;
        Ok(VmManager::new(
            self.store(),
            self.config.libvirt.network.clone(),
            Arc::new(state),
            self.ssh(),
        )
        .with_ping(time.ssh_ping_count, time.ssh_ping_period())
        .with_shutdown_poll(time.shutdown_poll()))
    }

    /// Provisioner able to run every step kind in `config`.
    pub fn provisioner(&self, config: &ProvisionConfig) -> Result<Provisioner> {
        let mut provisioner = Provisioner::new(self.ssh())
            .with_copy_timeout(self.config.time.copy_timeout())
            .with_retry_period(self.config.time.ssh_ping_period());

        let needs_docker = config
            .steps
            .iter()
            .any(|s| matches!(s, ProvisionStep::Docker(_)));
        if needs_docker {
            let socket = &self.config.container.socket;
            let docker = DockerClient::new(socket);
            if !docker.socket_exists() {
                return Err(CliError::NoDockerSocket(socket.display().to_string()).into());
            }
            provisioner =
                provisioner.with_containers(Arc::new(docker), self.config.container.pull_policy);
        }
        Ok(provisioner)
    }

    /// Cancellation triggered by Ctrl-C or after `timeout`.
    pub fn cancel(&self, timeout: Option<Duration>) -> Cancel {
        let (handle, cancel) = cancel_pair();
        tokio::spawn(async move {
            let deadline = async {
                match timeout {
                    Some(t) => tokio::time::sleep(t).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => info!("Interrupted, cancelling"),
                    Err(e) => {
                        warn!(error = %e, "Failed to listen for Ctrl-C");
                        return;
                    }
                },
                _ = deadline => warn!(timeout = ?timeout, "Timed out, cancelling"),
            }
            handle.cancel();
        });
        cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_is_refused() {
        let mut config = Config::default();
        config.libvirt.backend = Backend::Memory;
        let err = CommandContext::new(config, OutputFormat::Table).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::UnsupportedBackend(name)) if name == "memory"
        ));
    }

    #[test]
    fn test_virsh_backend_builds_context() {
        let ctx = CommandContext::new(Config::default(), OutputFormat::Table).unwrap();
        assert_eq!(ctx.store().pool(), Config::default().libvirt.pool);
    }
}
