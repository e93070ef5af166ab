//! Volume creation options.
//!
//! Options are resolved against the backend once (a backing layer needs its
//! path and capacity) and then applied as pure edits to a descriptor.

use crate::hypervisor::{BackingStore, Capacity, VolumeDescriptor, VolumeFormat};

use super::{LayerError, VolumeLayer};

/// Option for creating or cloning a layer volume.
#[derive(Debug, Clone)]
pub enum LayerOption {
    /// Chain the new volume on top of a layer.
    WithBacking(VolumeLayer),
    /// Minimum capacity in bytes. Never shrinks a larger capacity.
    WithCapacity(u64),
    /// On-disk format.
    WithFormat(VolumeFormat),
}

/// A resolved option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DescriptorEdit {
    Backing {
        path: String,
        format: VolumeFormat,
        capacity: u64,
    },
    Capacity(u64),
    Format(VolumeFormat),
}

impl DescriptorEdit {
    /// Apply the edit. Capacity only ever grows.
    pub fn apply(&self, desc: &mut VolumeDescriptor) {
        match self {
            DescriptorEdit::Backing {
                path,
                format,
                capacity,
            } => {
                desc.backing_store = Some(BackingStore {
                    path: path.clone(),
                    format: *format,
                });
                grow(desc, *capacity);
            }
            DescriptorEdit::Capacity(bytes) => grow(desc, *bytes),
            DescriptorEdit::Format(format) => desc.target.format = *format,
        }
    }
}

fn grow(desc: &mut VolumeDescriptor, bytes: u64) {
    if bytes > desc.capacity.to_bytes() {
        desc.capacity = Capacity::bytes(bytes);
    }
}

/// Resolve options into descriptor edits.
pub(crate) async fn resolve_options(opts: &[LayerOption]) -> Result<Vec<DescriptorEdit>, LayerError> {
    let mut edits = Vec::with_capacity(opts.len());
    for opt in opts {
        let edit = match opt {
            LayerOption::WithBacking(layer) => {
                let desc = layer.descriptor().await?;
                let info = layer.info().await?;
                DescriptorEdit::Backing {
                    path: layer.path().await?,
                    format: desc.target.format,
                    capacity: info.capacity,
                }
            }
            LayerOption::WithCapacity(bytes) => DescriptorEdit::Capacity(*bytes),
            LayerOption::WithFormat(format) => DescriptorEdit::Format(*format),
        };
        edits.push(edit);
    }
    Ok(edits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn apply_all(edits: &[DescriptorEdit]) -> VolumeDescriptor {
        let mut desc = VolumeDescriptor::new("v");
        for e in edits {
            e.apply(&mut desc);
        }
        desc
    }

    #[test]
    fn test_capacity_never_shrinks() {
        let desc = apply_all(&[DescriptorEdit::Capacity(100), DescriptorEdit::Capacity(10)]);
        assert_eq!(desc.capacity.to_bytes(), 100);
    }

    #[test]
    fn test_backing_inherits_larger_capacity() {
        let backing = DescriptorEdit::Backing {
            path: "/pool/base".to_string(),
            format: VolumeFormat::Qcow2,
            capacity: 500,
        };
        let desc = apply_all(&[DescriptorEdit::Capacity(100), backing.clone()]);
        assert_eq!(desc.capacity.to_bytes(), 500);
        assert_eq!(desc.backing_store.unwrap().path, "/pool/base");

        let desc = apply_all(&[DescriptorEdit::Capacity(1000), backing]);
        assert_eq!(desc.capacity.to_bytes(), 1000);
    }

    #[test]
    fn test_format() {
        let desc = apply_all(&[DescriptorEdit::Format(VolumeFormat::Raw)]);
        assert_eq!(desc.target.format, VolumeFormat::Raw);
        assert!(desc.backing_store.is_none());
    }

    proptest! {
        #[test]
        fn prop_capacity_converges_to_max(sizes in proptest::collection::vec(0u64..1 << 40, 1..8)) {
            let forward: Vec<_> = sizes.iter().copied().map(DescriptorEdit::Capacity).collect();
            let mut backward = forward.clone();
            backward.reverse();

            let max = *sizes.iter().max().unwrap();
            prop_assert_eq!(apply_all(&forward).capacity.to_bytes(), max);
            prop_assert_eq!(apply_all(&backward).capacity.to_bytes(), max);
        }
    }
}
