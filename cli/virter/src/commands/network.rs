//! Network commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;
use virter_core::network::{
    network_add, network_list, network_list_attached, network_rm, NetworkConfig,
};
use virter_networking::{mac_for_id, Ipv4Network};

use crate::output::{display_option, print_output, print_success};

use super::CommandContext;

/// Network commands.
#[derive(Debug, Args)]
pub struct NetworkCommand {
    #[command(subcommand)]
    command: NetworkSubcommand,
}

#[derive(Debug, Subcommand)]
enum NetworkSubcommand {
    /// Define and start a network.
    Add(AddArgs),

    /// Stop and undefine a network.
    Rm(RmArgs),

    /// List networks.
    Ls,

    /// Manage static DHCP host entries.
    Host(HostCommand),

    /// List VMs attached to a network.
    ListAttached(ListAttachedArgs),
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Network name.
    name: String,

    /// Host address and prefix of the network, e.g. `192.168.125.1/24`.
    #[arg(long)]
    network_cidr: Ipv4Network,

    /// Hand out addresses to unknown MACs too.
    #[arg(long)]
    dhcp: bool,

    /// Forward mode, e.g. `nat`. Isolated when omitted.
    #[arg(long)]
    forward_mode: Option<String>,

    /// DNS domain of the network.
    #[arg(long)]
    domain: Option<String>,

    /// Bridge device name.
    #[arg(long)]
    bridge: Option<String>,
}

#[derive(Debug, Args)]
struct RmArgs {
    /// Network name.
    name: String,
}

#[derive(Debug, Args)]
struct ListAttachedArgs {
    /// Network name. Defaults to the configured network.
    name: Option<String>,
}

#[derive(Debug, Args)]
struct HostCommand {
    #[command(subcommand)]
    command: HostSubcommand,
}

#[derive(Debug, Subcommand)]
enum HostSubcommand {
    /// Add DHCP host entries for VM IDs.
    Add(HostArgs),

    /// Remove DHCP host entries for VM IDs.
    Rm(HostArgs),
}

#[derive(Debug, Args)]
struct HostArgs {
    /// VM IDs.
    #[arg(required = true)]
    ids: Vec<u32>,

    /// Network to modify. Defaults to the configured network.
    #[arg(long)]
    network: Option<String>,
}

impl NetworkCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            NetworkSubcommand::Add(args) => add_network(&ctx, args).await,
            NetworkSubcommand::Rm(args) => remove_network(&ctx, args).await,
            NetworkSubcommand::Ls => list_networks(&ctx).await,
            NetworkSubcommand::Host(host) => match host.command {
                HostSubcommand::Add(args) => add_hosts(&ctx, args).await,
                HostSubcommand::Rm(args) => remove_hosts(&ctx, args).await,
            },
            NetworkSubcommand::ListAttached(args) => list_attached(&ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct NetworkRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Active")]
    active: bool,
    #[tabled(rename = "Address")]
    #[tabled(display = "display_option")]
    address: Option<String>,
    #[tabled(rename = "Forward")]
    #[tabled(display = "display_option")]
    forward: Option<String>,
    #[tabled(rename = "Bridge")]
    #[tabled(display = "display_option")]
    bridge: Option<String>,
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct AttachedRow {
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "IP")]
    #[tabled(display = "display_option")]
    ip: Option<String>,
    #[tabled(rename = "Hostname")]
    #[tabled(display = "display_option")]
    hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct HostRow {
    #[tabled(rename = "ID")]
    id: u32,
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "IP")]
    ip: String,
}

async fn add_network(ctx: &CommandContext, args: AddArgs) -> Result<()> {
    let config = NetworkConfig {
        name: args.name.clone(),
        address: args.network_cidr,
        dhcp: args.dhcp,
        forward: args.forward_mode,
        domain: args.domain,
        bridge: args.bridge,
    };
    network_add(ctx.conn(), &config)
        .await
        .with_context(|| format!("Failed to add network {}", args.name))?;
    print_success(&format!("Added network {}", args.name));
    Ok(())
}

async fn remove_network(ctx: &CommandContext, args: RmArgs) -> Result<()> {
    network_rm(ctx.conn(), &args.name)
        .await
        .with_context(|| format!("Failed to remove network {}", args.name))?;
    print_success(&format!("Removed network {}", args.name));
    Ok(())
}

async fn list_networks(ctx: &CommandContext) -> Result<()> {
    let rows: Vec<NetworkRow> = network_list(ctx.conn())
        .await
        .context("Failed to list networks")?
        .into_iter()
        .map(|n| NetworkRow {
            name: n.name,
            active: n.active,
            address: n.address,
            forward: n.forward,
            bridge: n.bridge,
        })
        .collect();
    print_output(&rows, ctx.format);
    Ok(())
}

async fn list_attached(ctx: &CommandContext, args: ListAttachedArgs) -> Result<()> {
    let network = args
        .name
        .unwrap_or_else(|| ctx.config.libvirt.network.clone());
    let rows: Vec<AttachedRow> = network_list_attached(ctx.conn(), &network)
        .await
        .with_context(|| format!("Failed to list VMs on network {}", network))?
        .into_iter()
        .map(|a| AttachedRow {
            vm: a.vm,
            mac: a.mac,
            ip: a.ip.map(|ip| ip.to_string()),
            hostname: a.hostname,
        })
        .collect();
    print_output(&rows, ctx.format);
    Ok(())
}

async fn add_hosts(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let dhcp = ctx.dhcp(args.network.as_deref());
    let mut rows = Vec::with_capacity(args.ids.len());
    for id in args.ids {
        let mac = mac_for_id(id);
        let ip = dhcp
            .add_dhcp_host(&mac, id)
            .await
            .with_context(|| format!("Failed to add host entry for ID {}", id))?;
        rows.push(HostRow {
            id,
            mac,
            ip: ip.to_string(),
        });
    }
    print_output(&rows, ctx.format);
    Ok(())
}

async fn remove_hosts(ctx: &CommandContext, args: HostArgs) -> Result<()> {
    let dhcp = ctx.dhcp(args.network.as_deref());
    for id in &args.ids {
        dhcp.remove_mac_dhcp_entries(&mac_for_id(*id))
            .await
            .with_context(|| format!("Failed to remove host entry for ID {}", id))?;
    }
    print_success(&format!(
        "Removed {} host entries from network {}",
        args.ids.len(),
        dhcp.network()
    ));
    Ok(())
}
