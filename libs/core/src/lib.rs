//! Layered VM image store and VM lifecycle orchestration.
//!
//! VM disks are chains of immutable, content-addressed layers stored as
//! hypervisor volumes. Images are tags pointing at the top of a chain and
//! can be pushed to and pulled from OCI registries. On top of the store,
//! [`vm::VmManager`] creates, provisions, commits and removes VMs.

pub mod buffer;
pub mod cancel;
pub mod compress;
pub mod config;
pub mod container;
pub mod hypervisor;
pub mod image;
pub mod layer;
pub mod network;
pub mod progress;
pub mod provision;
pub mod registry;
pub mod ssh;
pub mod state;
pub mod vm;

pub use cancel::{cancel_pair, Cancel, CancelHandle};
pub use config::Config;
pub use hypervisor::{Hypervisor, HypervisorError, MemoryHypervisor, VirshHypervisor};
pub use image::{Image, ImageError};
pub use layer::{LayerError, LayerStore, RawLayer, VolumeLayer};
pub use vm::{VmConfig, VmError, VmManager};
