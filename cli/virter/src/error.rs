//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;
use virter_core::config::ConfigError;
use virter_core::{ImageError, VmError};

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("VM {0} does not exist")]
    VmMissing(String),

    #[error("no container backend available: {0} does not exist")]
    NoDockerSocket(String),

    #[error("VM ID {start} plus {count} VMs exceeds the largest ID")]
    IdOverflow { start: u32, count: u32 },

    #[error("the {0} backend keeps no state between commands")]
    UnsupportedBackend(String),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    // Library errors already embed their source in the message.
    let mut shown = err.to_string();
    for cause in err.chain().skip(1) {
        let message = cause.to_string();
        if shown.contains(&message) {
            continue;
        }
        eprintln!("  {} {}", "caused by:".dimmed(), message);
        shown = message;
    }

    if let Some(hint) = hint(err) {
        eprintln!("\n{}", format!("Hint: {}", hint).yellow());
    }
}

fn hint(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(vm_err) = err.downcast_ref::<VmError>() {
        return vm_hint(vm_err);
    }
    if let Some(image_err) = err.downcast_ref::<ImageError>() {
        if image_err.is_not_found() {
            return Some("Run `virter image ls` to see local images.");
        }
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return Some("Check the file named by VIRTER_CONFIG and the VIRTER_* variables.");
    }
    match err.downcast_ref::<CliError>() {
        Some(CliError::NoDockerSocket(_)) => {
            return Some("Set [container] socket in the config or VIRTER_CONTAINER_SOCKET.");
        }
        Some(CliError::UnsupportedBackend(_)) => {
            return Some("Set [libvirt] backend = \"virsh\" or unset VIRTER_LIBVIRT_BACKEND.");
        }
        _ => {}
    }
    None
}

fn vm_hint(err: &VmError) -> Option<&'static str> {
    match err {
        VmError::Step { source, .. } => vm_hint(source),
        VmError::NotStopped(_) => Some("Pass --shutdown to stop the VM before committing."),
        VmError::IdCollision { .. } => Some("Choose another --id or remove the VM holding it."),
        VmError::AlreadyExists(_) | VmError::VolumeExists { .. } => {
            Some("Run `virter vm rm <name>` to remove leftovers of an earlier VM.")
        }
        VmError::ImageNotFound(_) => Some("Run `virter image ls` to see local images."),
        VmError::Timeout { .. } => Some("Increase [time] shutdown_timeout or pass --timeout."),
        _ => None,
    }
}
