//! Mutable volume handles.

use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::compress::format_digest;
use crate::hypervisor::{
    Hypervisor, HypervisorError, ObjectKind, UploadReader, VolumeDescriptor, VolumeInfo,
};
use crate::progress::{NoProgress, Progress};

use super::{
    is_layer_name, layer_name, resolve_options, LayerError, LayerOption, LayerStream, VolumeLayer,
};

/// Handle to a storage volume.
#[derive(Clone)]
pub struct RawLayer {
    name: String,
    pool: String,
    conn: Arc<dyn Hypervisor>,
}

impl fmt::Debug for RawLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawLayer")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl RawLayer {
    pub(crate) fn new(conn: Arc<dyn Hypervisor>, pool: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            pool: pool.to_string(),
            conn,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub(crate) fn conn(&self) -> &Arc<dyn Hypervisor> {
        &self.conn
    }

    /// Backend path (key) of the volume.
    pub async fn path(&self) -> Result<String, LayerError> {
        Ok(self.conn.volume_path(&self.pool, &self.name).await?)
    }

    pub async fn descriptor(&self) -> Result<VolumeDescriptor, LayerError> {
        Ok(self.conn.volume_descriptor(&self.pool, &self.name).await?)
    }

    pub async fn info(&self) -> Result<VolumeInfo, LayerError> {
        Ok(self.conn.volume_info(&self.pool, &self.name).await?)
    }

    /// Replace the volume content.
    pub async fn upload(&self, reader: UploadReader<'_>) -> Result<u64, LayerError> {
        let n = self
            .conn
            .volume_upload(&self.pool, &self.name, reader)
            .await?;
        debug!(volume = %self.name, bytes = n, "Uploaded volume content");
        Ok(n)
    }

    /// Stream the raw volume content.
    pub fn uncompressed(&self) -> LayerStream {
        LayerStream::spawn(self.conn.clone(), self.pool.clone(), self.name.clone())
    }

    /// SHA-256 of the volume content as `sha256:<hex>`.
    pub async fn diff_id(&self, progress: &dyn Progress) -> Result<String, LayerError> {
        let info = self.info().await?;
        progress.set_total(info.allocation);

        let mut stream = self.uncompressed();
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            progress.add(n as u64);
        }
        Ok(format_digest(hasher))
    }

    /// Delete the volume. Deleting a missing volume succeeds.
    pub async fn delete(&self) -> Result<(), LayerError> {
        match self.conn.volume_delete(&self.pool, &self.name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found_of(ObjectKind::Volume) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The layer this volume is backed by, if any.
    ///
    /// Fails with [`LayerError::Foreign`] when the backing volume is not a
    /// content-addressed layer of this pool.
    pub async fn dependency(&self) -> Result<Option<VolumeLayer>, LayerError> {
        let desc = self.descriptor().await?;
        let Some(backing) = desc.backing_store else {
            return Ok(None);
        };

        let parent = match self
            .conn
            .volume_lookup_by_path(&self.pool, &backing.path)
            .await
        {
            Ok(name) => name,
            Err(e) if e.is_not_found() => {
                return Err(LayerError::Foreign {
                    volume: backing.path,
                })
            }
            Err(e) => return Err(e.into()),
        };

        if !is_layer_name(&parent) {
            return Err(LayerError::Foreign { volume: parent });
        }
        VolumeLayer::from_raw(RawLayer::new(self.conn.clone(), &self.pool, &parent)).map(Some)
    }

    /// Copy this volume to a new volume `name`.
    ///
    /// Content goes through a temporary file rather than a direct pipe
    /// between download and upload streams; the backing store is kept.
    pub async fn clone_as(&self, name: &str, opts: &[LayerOption]) -> Result<RawLayer, LayerError> {
        let mut desc = self.descriptor().await?;
        desc.name = name.to_string();
        for edit in resolve_options(opts).await? {
            edit.apply(&mut desc);
        }

        self.conn.volume_create(&self.pool, &desc).await?;
        let target = RawLayer::new(self.conn.clone(), &self.pool, name);

        if let Err(e) = self.copy_content_to(&target).await {
            if let Err(cleanup) = target.delete().await {
                warn!(
                    volume = %name,
                    error = %cleanup,
                    "Failed to remove partially cloned volume"
                );
            }
            return Err(e);
        }

        debug!(source = %self.name, target = %name, "Cloned volume");
        Ok(target)
    }

    async fn copy_content_to(&self, target: &RawLayer) -> Result<(), LayerError> {
        let staging = tempfile::tempfile()?;
        let mut file = tokio::fs::File::from_std(staging);
        self.conn
            .volume_download(&self.pool, &self.name, &mut file)
            .await?;
        file.seek(SeekFrom::Start(0)).await?;
        target.upload(&mut file).await?;
        Ok(())
    }

    /// Turn this volume into a content-addressed layer.
    ///
    /// The digest is computed unless `known_digest` is given. If the layer
    /// already exists the content is deduplicated; in every case the source
    /// volume is deleted afterwards.
    pub async fn to_volume_layer(
        &self,
        known_digest: Option<&str>,
        opts: &[LayerOption],
    ) -> Result<VolumeLayer, LayerError> {
        let digest = match known_digest {
            Some(d) => d.to_string(),
            None => self.diff_id(&NoProgress).await?,
        };
        let canonical = layer_name(&digest);

        if self.name == canonical {
            return VolumeLayer::from_raw(self.clone());
        }

        let existing = RawLayer::new(self.conn.clone(), &self.pool, &canonical);
        let layer = match existing.info().await {
            Ok(_) => {
                debug!(layer = %canonical, source = %self.name, "Layer already stored, discarding duplicate content");
                existing
            }
            Err(e) if e.is_not_found() => match self.clone_as(&canonical, opts).await {
                Ok(layer) => layer,
                Err(LayerError::Hypervisor(HypervisorError::AlreadyExists { .. })) => {
                    debug!(layer = %canonical, "Layer stored concurrently, discarding duplicate content");
                    existing
                }
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        };

        if let Err(e) = self.conn.volume_delete(&self.pool, &self.name).await {
            if !e.is_not_found_of(ObjectKind::Volume) {
                return Err(LayerError::SourceCleanup {
                    layer: canonical,
                    source_volume: self.name.clone(),
                    source: e,
                });
            }
        }

        info!(layer = %canonical, "Stored layer");
        VolumeLayer::from_raw(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{BackingStore, MemoryHypervisor, VolumeFormat};
    use crate::layer::{LayerStore, LAYER_PREFIX};

    const CONTENT: &[u8] = b"something to download";
    const DIGEST: &str = "sha256:8575b86cb19cdff6a47b8cddc00261c34acc3faea6e120eb6eccbca867c00b4b";

    fn store() -> (Arc<MemoryHypervisor>, LayerStore) {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let store = LayerStore::new(hv.clone(), "p");
        (hv, store)
    }

    async fn work_layer(store: &LayerStore, name: &str, content: &[u8]) -> RawLayer {
        let raw = store.new_dynamic_layer(name, &[]).await.unwrap();
        raw.upload(&mut &content[..]).await.unwrap();
        raw
    }

    #[tokio::test]
    async fn test_diff_id_of_known_content() {
        let (_, store) = store();
        let raw = work_layer(&store, "a", CONTENT).await;
        assert_eq!(raw.diff_id(&NoProgress).await.unwrap(), DIGEST);
    }

    #[tokio::test]
    async fn test_to_volume_layer_moves_content() {
        let (hv, store) = store();
        let raw = work_layer(&store, "a", CONTENT).await;

        let layer = raw.to_volume_layer(None, &[]).await.unwrap();
        assert_eq!(layer.name(), format!("{LAYER_PREFIX}{DIGEST}"));
        assert_eq!(hv.volume_content("p", layer.name()).unwrap(), CONTENT);
        assert!(store.find_raw_layer("virter:work:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_to_volume_layer_deduplicates() {
        let (hv, store) = store();
        let first = work_layer(&store, "a", CONTENT)
            .await
            .to_volume_layer(None, &[])
            .await
            .unwrap();
        let second = work_layer(&store, "b", CONTENT)
            .await
            .to_volume_layer(None, &[])
            .await
            .unwrap();

        assert_eq!(first.name(), second.name());
        assert_eq!(hv.volume_list("p").await.unwrap(), vec![first.name().to_string()]);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_volume_only() {
        let (hv, store) = store();
        let raw = work_layer(&store, "a", CONTENT).await;
        raw.delete().await.unwrap();
        raw.delete().await.unwrap();

        let orphan = RawLayer::new(hv, "gone", "virter:work:a");
        let err = orphan.delete().await.unwrap_err();
        assert!(matches!(
            err,
            LayerError::Hypervisor(HypervisorError::NotFound { kind: ObjectKind::Pool, .. })
        ));
    }

    #[tokio::test]
    async fn test_source_cleanup_failure_is_reported() {
        let (hv, store) = store();
        let raw = work_layer(&store, "a", CONTENT).await;
        hv.fail_deletes_of("virter:work:a");

        let err = raw.to_volume_layer(None, &[]).await.unwrap_err();
        assert!(matches!(err, LayerError::SourceCleanup { .. }));
        // The layer itself was stored.
        assert!(store.find_volume_layer(DIGEST).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clone_preserves_backing_store() {
        let (_, store) = store();
        let base = work_layer(&store, "base", b"base")
            .await
            .to_volume_layer(None, &[])
            .await
            .unwrap();
        let child = store
            .new_dynamic_layer("child", &[LayerOption::WithBacking(base.clone())])
            .await
            .unwrap();
        child.upload(&mut &b"delta"[..]).await.unwrap();

        let copy = child.clone_as("copy", &[]).await.unwrap();
        let dep = copy.dependency().await.unwrap().unwrap();
        assert_eq!(dep.name(), base.name());
    }

    #[tokio::test]
    async fn test_dependency_foreign() {
        let (hv, store) = store();
        hv.volume_create("p", &VolumeDescriptor::new("plain.qcow2"))
            .await
            .unwrap();
        let path = hv.volume_path("p", "plain.qcow2").await.unwrap();

        let mut desc = VolumeDescriptor::new("child");
        desc.backing_store = Some(BackingStore {
            path,
            format: VolumeFormat::Qcow2,
        });
        hv.volume_create("p", &desc).await.unwrap();

        let err = store.raw_layer("child").dependency().await.unwrap_err();
        assert!(err.is_foreign());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_, store) = store();
        let raw = work_layer(&store, "a", CONTENT).await;
        raw.delete().await.unwrap();
        raw.delete().await.unwrap();
    }
}
