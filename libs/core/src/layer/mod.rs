//! Layer store.
//!
//! Disk content lives in hypervisor storage volumes. Two kinds of handles
//! exist over them:
//!
//! - [`RawLayer`]: any volume, mutable. Working volumes are created under
//!   [`WORK_PREFIX`].
//! - [`VolumeLayer`]: a volume named [`LAYER_PREFIX`] + `sha256:<hex>` of its
//!   content. Writes through a `VolumeLayer` are rejected.
//!
//! Layers form chains through the backend's backing-store pointers. The
//! garbage collector in [`gc`] walks those chains over a [`LayerArena`]
//! snapshot of the pool.

mod arena;
mod gc;
mod options;
mod raw;
mod stream;
mod volume;

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::hypervisor::{Hypervisor, HypervisorError, VolumeDescriptor};

pub use arena::{LayerArena, Parent};
pub use options::LayerOption;
pub use raw::RawLayer;
pub use stream::LayerStream;
pub use volume::{CompressedLayer, VolumeLayer};

pub(crate) use options::resolve_options;

/// Name prefix of content-addressed layer volumes.
pub const LAYER_PREFIX: &str = "virter:layer:";

/// Name prefix of working volumes.
pub const WORK_PREFIX: &str = "virter:work:";

/// Media type of a gzip-compressed qcow2 layer.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.com.linbit.virter.layer.v1.qcow2.gzip";

/// Errors from layer operations.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("layer {name} is immutable")]
    Immutable { name: String },

    #[error("volume {volume} is not managed by the layer store")]
    Foreign { volume: String },

    #[error("invalid layer name: {0}")]
    InvalidName(String),

    #[error("digest mismatch for {layer}: expected {expected}, got {actual}")]
    DigestMismatch {
        layer: String,
        expected: String,
        actual: String,
    },

    #[error("layer {layer} was stored, but deleting source volume {source_volume} failed: {source}")]
    SourceCleanup {
        layer: String,
        source_volume: String,
        #[source]
        source: HypervisorError,
    },

    #[error("layer chain of {volume} contains a cycle")]
    Cycle { volume: String },
}

impl LayerError {
    /// Whether the error is a rejected write to an immutable layer.
    pub fn is_immutable(&self) -> bool {
        matches!(self, Self::Immutable { .. })
    }

    pub fn is_foreign(&self) -> bool {
        matches!(self, Self::Foreign { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Hypervisor(e) if e.is_not_found())
    }
}

/// Whether a volume name belongs to a content-addressed layer.
pub fn is_layer_name(name: &str) -> bool {
    name.starts_with(LAYER_PREFIX)
}

/// Canonical volume name for a layer digest.
pub fn layer_name(digest: &str) -> String {
    format!("{}{}", LAYER_PREFIX, digest)
}

/// Access to the layers of one storage pool.
#[derive(Clone)]
pub struct LayerStore {
    conn: Arc<dyn Hypervisor>,
    pool: String,
}

impl std::fmt::Debug for LayerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStore")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl LayerStore {
    pub fn new(conn: Arc<dyn Hypervisor>, pool: impl Into<String>) -> Self {
        Self {
            conn,
            pool: pool.into(),
        }
    }

    pub fn conn(&self) -> &Arc<dyn Hypervisor> {
        &self.conn
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Handle for a volume by name, without checking that it exists.
    pub fn raw_layer(&self, name: &str) -> RawLayer {
        RawLayer::new(self.conn.clone(), &self.pool, name)
    }

    /// Look up a volume; `None` if it does not exist.
    pub async fn find_raw_layer(&self, name: &str) -> Result<Option<RawLayer>, LayerError> {
        match self.conn.volume_info(&self.pool, name).await {
            Ok(_) => Ok(Some(self.raw_layer(name))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up the layer for a digest; `None` if it is not stored.
    pub async fn find_volume_layer(&self, digest: &str) -> Result<Option<VolumeLayer>, LayerError> {
        match self.find_raw_layer(&layer_name(digest)).await? {
            Some(raw) => Ok(Some(VolumeLayer::from_raw(raw)?)),
            None => Ok(None),
        }
    }

    /// Create an empty working volume `virter:work:<name>`.
    pub async fn new_dynamic_layer(
        &self,
        name: &str,
        opts: &[LayerOption],
    ) -> Result<RawLayer, LayerError> {
        self.create_layer(&format!("{}{}", WORK_PREFIX, name), opts)
            .await
    }

    /// Create an empty volume with exactly `name`.
    pub async fn create_layer(
        &self,
        name: &str,
        opts: &[LayerOption],
    ) -> Result<RawLayer, LayerError> {
        let mut desc = VolumeDescriptor::new(name);
        for edit in resolve_options(opts).await? {
            edit.apply(&mut desc);
        }

        debug!(
            pool = %self.pool,
            volume = %name,
            capacity = desc.capacity.to_bytes(),
            format = %desc.target.format,
            "Creating layer volume"
        );

        self.conn.volume_create(&self.pool, &desc).await?;
        Ok(self.raw_layer(name))
    }

    /// Snapshot of all volumes in the pool and their parents.
    pub async fn arena(&self) -> Result<LayerArena, LayerError> {
        LayerArena::scan(self.conn.as_ref(), &self.pool).await
    }

    /// All content-addressed layers in the pool.
    pub async fn layers(&self) -> Result<Vec<VolumeLayer>, LayerError> {
        let names = self.conn.volume_list(&self.pool).await?;
        names
            .into_iter()
            .filter(|n| is_layer_name(n))
            .map(|n| VolumeLayer::from_raw(self.raw_layer(&n)))
            .collect()
    }

    /// Delete a layer if no volume in the pool depends on it.
    pub async fn delete_if_unused(&self, name: &str) -> Result<bool, LayerError> {
        gc::delete_if_unused(self, name).await
    }

    /// Delete a layer and then each ancestor that becomes unused.
    ///
    /// Returns the deleted names, child first.
    pub async fn delete_all_if_unused(&self, name: &str) -> Result<Vec<String>, LayerError> {
        gc::delete_all_if_unused(self, name).await
    }

    /// Repeatedly delete every layer without dependents until a full pass
    /// deletes nothing.
    pub async fn prune(&self) -> Result<Vec<String>, LayerError> {
        gc::prune(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_names() {
        let digest = "sha256:8575b86cb19cdff6a47b8cddc00261c34acc3faea6e120eb6eccbca867c00b4b";
        let name = layer_name(digest);
        assert_eq!(
            name,
            "virter:layer:sha256:8575b86cb19cdff6a47b8cddc00261c34acc3faea6e120eb6eccbca867c00b4b"
        );
        assert!(is_layer_name(&name));
        assert!(!is_layer_name("virter:work:x"));
    }
}
