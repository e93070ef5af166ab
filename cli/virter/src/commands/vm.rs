//! VM commands.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;
use tokio::task::JoinSet;
use virter_core::provision::{parse_override, ProvisionConfig};
use virter_core::vm::{parse_size, DiskArg};
use virter_core::VmConfig;

use crate::error::CliError;
use crate::output::{display_option, print_output, print_success};

use super::CommandContext;

/// VM commands.
#[derive(Debug, Args)]
pub struct VmCommand {
    #[command(subcommand)]
    command: VmSubcommand,
}

#[derive(Debug, Subcommand)]
enum VmSubcommand {
    /// Start VMs from an image.
    Run(RunArgs),

    /// Remove VMs and everything created for them.
    Rm(NamesArgs),

    /// Turn a VM's boot disk into an image.
    Commit(CommitArgs),

    /// Run provisioning steps on running VMs.
    Exec(ExecArgs),

    /// Open an SSH session or run a command on a VM.
    Ssh(SshArgs),

    /// Copy files to or from VMs. Remote paths are written `vm:path`.
    Cp(CpArgs),

    /// List VMs.
    List,

    /// Exit with status 0 if the VM exists.
    Exists(NameArgs),

    /// Print the known_hosts line of a VM.
    HostKey(NameArgs),

    /// Wait until VMs accept SSH connections.
    WaitReady(NamesArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Image to boot from.
    image: String,

    /// VM name. With `--count` above 1 each VM gets a `-<n>` suffix.
    #[arg(long)]
    name: String,

    /// VM ID. 0 picks a free one. With `--count` IDs increase from here.
    #[arg(long, default_value = "0")]
    id: u32,

    /// Number of VMs to start.
    #[arg(long, default_value = "1")]
    count: u32,

    /// Memory, e.g. `1G` or `512M`.
    #[arg(long, default_value = "1G")]
    memory: String,

    /// Number of vCPUs.
    #[arg(long, default_value = "1")]
    vcpus: u32,

    /// Boot disk size. Never smaller than the image.
    #[arg(long)]
    disk_size: Option<String>,

    /// Extra disk, `name=data,size=10G[,format=qcow2][,bus=virtio]`. Repeatable.
    #[arg(long = "disk")]
    disks: Vec<String>,

    /// User for SSH sessions.
    #[arg(long, default_value = "root")]
    user: String,

    /// Wait until the VMs accept SSH.
    #[arg(long, short)]
    wait_ssh: bool,
}

#[derive(Debug, Args)]
struct NameArgs {
    /// VM name.
    name: String,
}

#[derive(Debug, Args)]
struct NamesArgs {
    /// VM names.
    #[arg(required = true)]
    names: Vec<String>,
}

#[derive(Debug, Args)]
struct CommitArgs {
    /// VM name.
    name: String,

    /// Image name. Defaults to the VM name.
    image: Option<String>,

    /// Shut the VM down first if it is running.
    #[arg(long, short)]
    shutdown: bool,

    /// Seconds to wait for the shutdown. Defaults to the configured value.
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Debug, Args)]
struct ExecArgs {
    /// VM names.
    #[arg(required = true)]
    names: Vec<String>,

    /// Provisioning file (TOML).
    #[arg(long, short, conflicts_with = "command")]
    provision: Option<PathBuf>,

    /// Shell script to run instead of a provisioning file.
    #[arg(long, short = 'c')]
    command: Option<String>,

    /// Override a provisioning value, `key=value`. Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Debug, Args)]
struct SshArgs {
    /// VM name.
    name: String,

    /// Command to run instead of an interactive shell.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

#[derive(Debug, Args)]
struct CpArgs {
    /// Sources followed by the destination.
    #[arg(required = true, num_args = 2..)]
    paths: Vec<String>,
}

impl VmCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            VmSubcommand::Run(args) => run_vms(&ctx, args).await,
            VmSubcommand::Rm(args) => remove_vms(&ctx, args).await,
            VmSubcommand::Commit(args) => commit_vm(&ctx, args).await,
            VmSubcommand::Exec(args) => exec_vms(&ctx, args).await,
            VmSubcommand::Ssh(args) => ssh_vm(&ctx, args).await,
            VmSubcommand::Cp(args) => copy_files(&ctx, args).await,
            VmSubcommand::List => list_vms(&ctx).await,
            VmSubcommand::Exists(args) => vm_exists(&ctx, args).await,
            VmSubcommand::HostKey(args) => host_key(&ctx, args).await,
            VmSubcommand::WaitReady(args) => wait_ready(&ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct VmRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "ID")]
    id: u32,
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "IP")]
    #[tabled(display = "display_option")]
    ip: Option<String>,
    #[tabled(rename = "Running")]
    running: bool,
}

/// Configs for `count` VMs named after `args.name`.
fn vm_configs(args: &RunArgs, ssh_key: &str, static_dhcp: bool) -> Result<Vec<VmConfig>> {
    let memory_kib = parse_size(&args.memory)? / 1024;
    let disk_size = args.disk_size.as_deref().map(parse_size).transpose()?;
    let extra_disks = args
        .disks
        .iter()
        .map(|d| DiskArg::parse(d))
        .collect::<Result<Vec<_>, _>>()?;

    let mut configs = Vec::with_capacity(args.count as usize);
    for i in 0..args.count {
        let name = if args.count > 1 {
            format!("{}-{}", args.name, i + 1)
        } else {
            args.name.clone()
        };
        let mut config = VmConfig::new(&args.image, name);
        config.id = if args.id == 0 {
            0
        } else {
            args.id.checked_add(i).ok_or(CliError::IdOverflow {
                start: args.id,
                count: args.count,
            })?
        };
        config.memory_kib = memory_kib;
        config.vcpus = args.vcpus;
        config.disk_size = disk_size;
        config.extra_disks = extra_disks.clone();
        config.static_dhcp = static_dhcp;
        config.ssh_public_keys = vec![ssh_key.to_string()];
        config.user_name = args.user.clone();
        config.wait_ssh = args.wait_ssh;
        configs.push(config);
    }
    Ok(configs)
}

async fn run_vms(ctx: &CommandContext, args: RunArgs) -> Result<()> {
    let key = ctx.user_public_key().await?;
    let configs = vm_configs(&args, &key, ctx.config.libvirt.static_dhcp)?;
    let vms = ctx.vms()?;
    let cancel = ctx.cancel(None);

    // Free IDs are picked from the live network, so automatic IDs start one at a time.
    if args.id == 0 {
        for config in &configs {
            let record = vms
                .vm_run(config, &cancel)
                .await
                .with_context(|| format!("Failed to start VM {}", config.name))?;
            print_success(&format!("Started VM {} (ID {})", record.name, record.id));
        }
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for config in configs {
        let vms = vms.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            vms.vm_run(&config, &cancel)
                .await
                .with_context(|| format!("Failed to start VM {}", config.name))
        });
    }

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("VM start task failed")? {
            Ok(record) => {
                print_success(&format!("Started VM {} (ID {})", record.name, record.id))
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn remove_vms(ctx: &CommandContext, args: NamesArgs) -> Result<()> {
    let vms = ctx.vms()?;
    for name in &args.names {
        vms.vm_rm(name, ctx.config.libvirt.static_dhcp)
            .await
            .with_context(|| format!("Failed to remove VM {}", name))?;
        print_success(&format!("Removed VM {}", name));
    }
    Ok(())
}

async fn commit_vm(ctx: &CommandContext, args: CommitArgs) -> Result<()> {
    let image_name = args.image.unwrap_or_else(|| args.name.clone());
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config.time.shutdown_timeout());
    let cancel = ctx.cancel(None);

    let image = ctx
        .vms()?
        .vm_commit_image(
            &args.name,
            &image_name,
            args.shutdown,
            timeout,
            ctx.config.libvirt.static_dhcp,
            &cancel,
        )
        .await
        .with_context(|| format!("Failed to commit VM {}", args.name))?;
    print_success(&format!("Committed VM {} as image {}", args.name, image.name()));
    Ok(())
}

async fn provision_config(args: &ExecArgs) -> Result<ProvisionConfig> {
    let overrides = args
        .overrides
        .iter()
        .map(|o| parse_override(o))
        .collect::<Result<Vec<_>, _>>()?;
    match (&args.provision, &args.command) {
        (Some(path), _) => ProvisionConfig::load(path, &overrides)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        (None, Some(script)) => Ok(ProvisionConfig::shell(script)),
        (None, None) => anyhow::bail!("either --provision or --command is required"),
    }
}

async fn exec_vms(ctx: &CommandContext, args: ExecArgs) -> Result<()> {
    let config = provision_config(&args).await?;
    let provisioner = ctx.provisioner(&config)?;
    let cancel = ctx.cancel(ctx.config.time.provision_timeout());

    ctx.vms()?
        .vm_exec(&args.names, &provisioner, &config, &cancel)
        .await
        .context("Provisioning failed")?;
    print_success(&format!(
        "Provisioned {} ({} steps)",
        args.names.join(", "),
        config.steps.len()
    ));
    Ok(())
}

async fn ssh_vm(ctx: &CommandContext, args: SshArgs) -> Result<()> {
    let code = ctx
        .vms()?
        .vm_ssh(&args.name, &args.command)
        .await
        .with_context(|| format!("Failed to connect to VM {}", args.name))?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn copy_files(ctx: &CommandContext, mut args: CpArgs) -> Result<()> {
    let dest = args
        .paths
        .pop()
        .context("a destination is required")?;
    let cancel = ctx.cancel(None);
    ctx.vms()?
        .vm_cp(&args.paths, &dest, &cancel)
        .await
        .with_context(|| format!("Failed to copy to {}", dest))?;
    Ok(())
}

async fn list_vms(ctx: &CommandContext) -> Result<()> {
    let rows: Vec<VmRow> = ctx
        .vms()?
        .vm_list()
        .await
        .context("Failed to list VMs")?
        .into_iter()
        .map(|vm| VmRow {
            name: vm.name,
            id: vm.id,
            mac: vm.mac,
            ip: vm.ip.map(|ip| ip.to_string()),
            running: vm.running,
        })
        .collect();
    print_output(&rows, ctx.format);
    Ok(())
}

async fn vm_exists(ctx: &CommandContext, args: NameArgs) -> Result<()> {
    if ctx.vms()?.vm_exists(&args.name).await? {
        Ok(())
    } else {
        Err(CliError::VmMissing(args.name).into())
    }
}

async fn host_key(ctx: &CommandContext, args: NameArgs) -> Result<()> {
    let line = ctx
        .vms()?
        .vm_host_key(&args.name)
        .await
        .with_context(|| format!("Failed to read host key of VM {}", args.name))?;
    println!("{}", line);
    Ok(())
}

async fn wait_ready(ctx: &CommandContext, args: NamesArgs) -> Result<()> {
    let vms = ctx.vms()?;
    let cancel = ctx.cancel(None);
    vms.vm_wait_ready(&args.names, &cancel)
        .await
        .context("VMs did not become ready")?;
    print_success(&format!("{} ready", args.names.join(", ")));
    Ok(())
}
