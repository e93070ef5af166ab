//! Image commands.
//!
//! Images are tags on chains of content-addressed layers in the storage pool.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;
use virter_core::image::{
    find_image, image_import_from_reader, image_list, image_load, image_prune, image_pull,
    image_push, image_rm, image_save,
};
use virter_core::provision::{parse_override, ProvisionConfig};
use virter_core::registry::Reference;
use virter_core::vm::{parse_size, BuildConfig};
use virter_core::{Image, VmConfig};

use crate::output::{print_info, print_output, print_success, OutputFormat};

use super::CommandContext;

/// Image commands.
#[derive(Debug, Args)]
pub struct ImageCommand {
    #[command(subcommand)]
    command: ImageSubcommand,
}

#[derive(Debug, Subcommand)]
enum ImageSubcommand {
    /// List local images.
    Ls,

    /// Pull an image from a registry.
    Pull(PullArgs),

    /// Push a local image to a registry.
    Push(PushArgs),

    /// Remove an image and every layer only it used.
    Rm(RmArgs),

    /// Import a local qcow2 file as a single-layer image.
    Import(ImportArgs),

    /// Write an image archive.
    Save(SaveArgs),

    /// Read an image archive.
    Load(LoadArgs),

    /// Delete layers no image or volume references.
    Prune,

    /// Build an image by provisioning a VM.
    Build(BuildArgs),
}

#[derive(Debug, Args)]
struct PullArgs {
    /// Registry reference, e.g. `registry.example.com/vms/alma-9:latest`.
    reference: String,

    /// Local name. Defaults to the last path component of the repository.
    name: Option<String>,
}

#[derive(Debug, Args)]
struct PushArgs {
    /// Local image name.
    name: String,

    /// Registry reference to push to.
    reference: String,
}

#[derive(Debug, Args)]
struct RmArgs {
    /// Image names.
    #[arg(required = true)]
    names: Vec<String>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Image name.
    name: String,

    /// qcow2 file.
    file: PathBuf,
}

#[derive(Debug, Args)]
struct SaveArgs {
    /// Image name.
    name: String,

    /// Output file. Writes to stdout when omitted.
    #[arg(long, short)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Name for the loaded image.
    name: String,

    /// Archive file. Reads stdin when omitted.
    #[arg(long, short)]
    input: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct BuildArgs {
    /// Base image.
    base: String,

    /// Name of the new image.
    new_name: String,

    /// Provisioning file (TOML).
    #[arg(long, short)]
    provision: PathBuf,

    /// Override a provisioning value, `key=value`. Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// ID of the build VM. 0 picks a free one.
    #[arg(long, default_value = "0")]
    id: u32,

    /// Name of the build VM. Defaults to `<new-name>-build`.
    #[arg(long)]
    vm_name: Option<String>,

    /// Memory of the build VM, e.g. `2G`.
    #[arg(long, default_value = "1G")]
    memory: String,

    /// vCPUs of the build VM.
    #[arg(long, default_value = "1")]
    vcpus: u32,

    /// Boot disk size of the build VM.
    #[arg(long)]
    disk_size: Option<String>,
}

impl ImageCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            ImageSubcommand::Ls => list_images(&ctx).await,
            ImageSubcommand::Pull(args) => pull_image(&ctx, args).await,
            ImageSubcommand::Push(args) => push_image(&ctx, args).await,
            ImageSubcommand::Rm(args) => remove_images(&ctx, args).await,
            ImageSubcommand::Import(args) => import_image(&ctx, args).await,
            ImageSubcommand::Save(args) => save_image(&ctx, args).await,
            ImageSubcommand::Load(args) => load_image(&ctx, args).await,
            ImageSubcommand::Prune => prune_images(&ctx).await,
            ImageSubcommand::Build(args) => build_image(&ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct ImageRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Top Layer")]
    top_layer: String,
    #[tabled(rename = "Layers")]
    layers: usize,
    #[tabled(rename = "Size")]
    size: String,
}

async fn image_row(image: &Image) -> Result<ImageRow> {
    let layers = image
        .layers()
        .await
        .with_context(|| format!("Failed to read layers of image {}", image.name()))?;
    let info = image.top().info().await?;
    Ok(ImageRow {
        name: image.name().to_string(),
        top_layer: short_digest(image.top().digest()),
        layers: layers.len(),
        size: human_size(info.capacity),
    })
}

async fn list_images(ctx: &CommandContext) -> Result<()> {
    let store = ctx.store();
    let images = image_list(&store).await.context("Failed to list images")?;

    let mut rows = Vec::with_capacity(images.len());
    for image in &images {
        rows.push(image_row(image).await?);
    }
    print_output(&rows, ctx.format);
    Ok(())
}

async fn pull_image(ctx: &CommandContext, args: PullArgs) -> Result<()> {
    let reference = Reference::parse(&args.reference)?;
    let name = match args.name {
        Some(name) => name,
        None => default_name(&reference),
    };
    let registry = ctx.registry()?;
    let image = image_pull(&ctx.store(), &registry, &reference, &name)
        .await
        .with_context(|| format!("Failed to pull {}", reference))?;
    print_success(&format!("Pulled {} as {}", reference, image.name()));
    Ok(())
}

async fn push_image(ctx: &CommandContext, args: PushArgs) -> Result<()> {
    let reference = Reference::parse(&args.reference)?;
    let registry = ctx.registry()?;
    let digest = image_push(&ctx.store(), &registry, &args.name, &reference)
        .await
        .with_context(|| format!("Failed to push {} to {}", args.name, reference))?;
    print_success(&format!("Pushed {} ({})", reference, digest));
    Ok(())
}

async fn remove_images(ctx: &CommandContext, args: RmArgs) -> Result<()> {
    let store = ctx.store();
    for name in &args.names {
        image_rm(&store, name)
            .await
            .with_context(|| format!("Failed to remove image {}", name))?;
        print_success(&format!("Removed image {}", name));
    }
    Ok(())
}

async fn import_image(ctx: &CommandContext, args: ImportArgs) -> Result<()> {
    let mut file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("Failed to open {}", args.file.display()))?;
    let image = image_import_from_reader(&ctx.store(), &args.name, &mut file)
        .await
        .with_context(|| format!("Failed to import {}", args.file.display()))?;
    print_success(&format!(
        "Imported {} as {}",
        args.file.display(),
        image.name()
    ));
    Ok(())
}

async fn save_image(ctx: &CommandContext, args: SaveArgs) -> Result<()> {
    let writer: Box<dyn Write + Send> = match &args.out {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout()),
    };
    let mut writer = image_save(&ctx.store(), &args.name, writer)
        .await
        .with_context(|| format!("Failed to save image {}", args.name))?;
    writer.flush()?;

    if let Some(path) = &args.out {
        print_success(&format!("Saved {} to {}", args.name, path.display()));
    }
    Ok(())
}

async fn load_image(ctx: &CommandContext, args: LoadArgs) -> Result<()> {
    let store = ctx.store();
    let image = match &args.input {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            image_load(&store, &args.name, file).await
        }
        None => image_load(&store, &args.name, std::io::stdin()).await,
    }
    .with_context(|| format!("Failed to load image {}", args.name))?;
    print_success(&format!("Loaded image {}", image.name()));
    Ok(())
}

async fn prune_images(ctx: &CommandContext) -> Result<()> {
    let deleted = image_prune(&ctx.store())
        .await
        .context("Failed to prune layers")?;
    match ctx.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&deleted)?),
        OutputFormat::Table => {
            for layer in &deleted {
                println!("{}", layer);
            }
            print_info(&format!("Deleted {} unused layers", deleted.len()));
        }
    }
    Ok(())
}

async fn build_image(ctx: &CommandContext, args: BuildArgs) -> Result<()> {
    let overrides = args
        .overrides
        .iter()
        .map(|o| parse_override(o))
        .collect::<Result<Vec<_>, _>>()?;
    let provision = ProvisionConfig::load(&args.provision, &overrides)
        .await
        .with_context(|| format!("Failed to read {}", args.provision.display()))?;

    let store = ctx.store();
    if find_image(&store, &args.base).await?.is_none() {
        anyhow::bail!("base image {} does not exist", args.base);
    }

    let vm_name = args
        .vm_name
        .unwrap_or_else(|| format!("{}-build", args.new_name));
    let mut vm = VmConfig::new(&args.base, vm_name);
    vm.id = args.id;
    vm.memory_kib = parse_size(&args.memory)? / 1024;
    vm.vcpus = args.vcpus;
    vm.disk_size = args.disk_size.as_deref().map(parse_size).transpose()?;
    vm.static_dhcp = ctx.config.libvirt.static_dhcp;
    vm.ssh_public_keys = vec![ctx.user_public_key().await?];

    let build = BuildConfig {
        vm,
        image_name: args.new_name,
        provision,
        shutdown_timeout: ctx.config.time.shutdown_timeout(),
    };
    let provisioner = ctx.provisioner(&build.provision)?;
    let cancel = ctx.cancel(ctx.config.time.provision_timeout());

    let image = ctx
        .vms()?
        .image_build(&build, &provisioner, &cancel)
        .await
        .with_context(|| format!("Failed to build image {}", build.image_name))?;
    print_success(&format!("Built image {}", image.name()));
    Ok(())
}

/// `registry/vms/alma-9:8.9` is pulled as `alma-9` unless named.
fn default_name(reference: &Reference) -> String {
    reference
        .repository
        .rsplit('/')
        .next()
        .unwrap_or(&reference.repository)
        .to_string()
}

fn short_digest(digest: &str) -> String {
    let hex = digest.trim_start_matches("sha256:");
    hex.chars().take(12).collect()
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("alma-9", "alma-9")]
    #[case("registry.example.com/vms/alma-9:8.9", "alma-9")]
    #[case("localhost:5000/base", "base")]
    fn test_default_name(#[case] input: &str, #[case] expected: &str) {
        let reference = Reference::parse(input).unwrap();
        assert_eq!(default_name(&reference), expected);
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(
            short_digest("sha256:8575b86c0123456789abcdef"),
            "8575b86c0123"
        );
    }

    #[rstest]
    #[case(512, "512 B")]
    #[case(1536, "1.5 KiB")]
    #[case(10 << 30, "10.0 GiB")]
    fn test_human_size(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(human_size(bytes), expected);
    }
}
