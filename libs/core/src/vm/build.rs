//! Building images by provisioning a VM and committing it.

use std::time::Duration;

use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::image::Image;
use crate::provision::{ProvisionConfig, Provisioner};

use super::{VmConfig, VmError, VmManager};

/// What `image_build` does.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// The build VM. Its `image` is the base image.
    pub vm: VmConfig,
    /// Name of the resulting image.
    pub image_name: String,
    pub provision: ProvisionConfig,
    pub shutdown_timeout: Duration,
}

impl VmManager {
    /// Start a VM from the base image, provision it, shut it down and tag
    /// its disk as a new image.
    ///
    /// A stale build VM of the same name is removed first. If provisioning
    /// fails the build VM is removed again.
    pub async fn image_build(
        &self,
        build: &BuildConfig,
        provisioner: &Provisioner,
        cancel: &Cancel,
    ) -> Result<Image, VmError> {
        let name = build.vm.name.as_str();
        let static_dhcp = build.vm.static_dhcp;

        self.vm_rm(name, static_dhcp).await?;

        let mut vm = build.vm.clone();
        vm.wait_ssh = true;
        info!(vm = %name, base = %vm.image, image = %build.image_name, "Starting build VM");

        let provisioned = async {
            self.vm_run(&vm, cancel).await?;
            let targets = self.ssh_targets(std::slice::from_ref(&vm.name)).await?;
            provisioner.run(&targets, &build.provision, cancel).await?;
            Ok::<(), VmError>(())
        }
        .await;

        if let Err(e) = provisioned {
            if let Err(cleanup) = self.vm_rm(name, static_dhcp).await {
                warn!(vm = %name, error = %cleanup, "Failed to remove build VM");
            }
            return Err(e);
        }

        let image = self
            .vm_commit_image(
                name,
                &build.image_name,
                true,
                build.shutdown_timeout,
                static_dhcp,
                cancel,
            )
            .await?;
        info!(image = %build.image_name, "Built image");
        Ok(image)
    }
}
