//! Content-addressed, immutable layers.

use std::io::SeekFrom;

use async_trait::async_trait;
use tokio::io::AsyncSeekExt;
use tracing::debug;

use crate::compress::{gzip_to_temp, is_sha256_digest, CompressedBlob};
use crate::hypervisor::{UploadReader, VolumeDescriptor, VolumeInfo};
use crate::registry::{BoxReader, RegistryError, RegistryLayer};

use super::{LayerError, LayerStream, RawLayer, LAYER_MEDIA_TYPE, LAYER_PREFIX};

/// A volume named after the digest of its content.
#[derive(Debug, Clone)]
pub struct VolumeLayer {
    raw: RawLayer,
    digest: String,
}

impl VolumeLayer {
    /// Wrap a volume handle whose name carries a valid layer digest.
    pub(crate) fn from_raw(raw: RawLayer) -> Result<Self, LayerError> {
        let digest = raw
            .name()
            .strip_prefix(LAYER_PREFIX)
            .filter(|d| is_sha256_digest(d))
            .ok_or_else(|| LayerError::InvalidName(raw.name().to_string()))?
            .to_string();
        Ok(Self { raw, digest })
    }

    pub fn name(&self) -> &str {
        self.raw.name()
    }

    pub fn pool(&self) -> &str {
        self.raw.pool()
    }

    /// Digest of the uncompressed content, taken from the name.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Same as [`digest`](Self::digest); no content is read.
    pub fn diff_id(&self) -> &str {
        &self.digest
    }

    pub async fn path(&self) -> Result<String, LayerError> {
        self.raw.path().await
    }

    pub async fn descriptor(&self) -> Result<VolumeDescriptor, LayerError> {
        self.raw.descriptor().await
    }

    pub async fn info(&self) -> Result<VolumeInfo, LayerError> {
        self.raw.info().await
    }

    pub fn uncompressed(&self) -> LayerStream {
        self.raw.uncompressed()
    }

    pub async fn dependency(&self) -> Result<Option<VolumeLayer>, LayerError> {
        self.raw.dependency().await
    }

    /// Always fails: layer content never changes after it is stored.
    pub async fn upload(&self, _reader: UploadReader<'_>) -> Result<u64, LayerError> {
        Err(LayerError::Immutable {
            name: self.name().to_string(),
        })
    }

    /// Compress the layer for a registry push.
    ///
    /// The gzip stream is produced once and kept in a temporary file, so the
    /// compressed size and digest are known before the push starts.
    pub async fn to_registry_layer(&self) -> Result<CompressedLayer, LayerError> {
        let mut staging = tokio::fs::File::from_std(tempfile::tempfile()?);
        self.raw
            .conn()
            .volume_download(self.pool(), self.name(), &mut staging)
            .await?;
        staging.seek(SeekFrom::Start(0)).await?;
        let plain = staging.into_std().await;

        let blob = tokio::task::spawn_blocking(move || gzip_to_temp(plain))
            .await
            .map_err(std::io::Error::other)??;

        if blob.diff_id != self.digest {
            return Err(LayerError::DigestMismatch {
                layer: self.name().to_string(),
                expected: self.digest.clone(),
                actual: blob.diff_id,
            });
        }

        debug!(
            layer = %self.name(),
            digest = %blob.digest,
            size = blob.size,
            "Compressed layer"
        );

        Ok(CompressedLayer {
            layer: self.clone(),
            blob,
        })
    }
}

/// A layer compressed for a registry push.
#[derive(Debug)]
pub struct CompressedLayer {
    layer: VolumeLayer,
    blob: CompressedBlob,
}

impl CompressedLayer {
    pub fn layer(&self) -> &VolumeLayer {
        &self.layer
    }
}

#[async_trait]
impl RegistryLayer for CompressedLayer {
    fn digest(&self) -> &str {
        &self.blob.digest
    }

    fn size(&self) -> u64 {
        self.blob.size
    }

    fn media_type(&self) -> &str {
        LAYER_MEDIA_TYPE
    }

    fn diff_id(&self) -> &str {
        self.layer.diff_id()
    }

    async fn compressed(&self) -> Result<BoxReader, RegistryError> {
        let file = tokio::fs::File::from_std(self.blob.file.reopen()?);
        Ok(Box::new(file))
    }

    async fn uncompressed(&self) -> Result<BoxReader, RegistryError> {
        Ok(Box::new(self.layer.uncompressed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use crate::compress::sha256_digest;
    use crate::hypervisor::MemoryHypervisor;
    use crate::layer::LayerStore;

    const CONTENT: &[u8] = b"something to download";

    async fn stored_layer() -> VolumeLayer {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let store = LayerStore::new(hv, "p");
        let raw = store.new_dynamic_layer("a", &[]).await.unwrap();
        raw.upload(&mut &CONTENT[..]).await.unwrap();
        raw.to_volume_layer(None, &[]).await.unwrap()
    }

    #[tokio::test]
    async fn test_upload_rejected() {
        let layer = stored_layer().await;
        let err = layer.upload(&mut &b"other"[..]).await.unwrap_err();
        assert!(err.is_immutable());
    }

    #[tokio::test]
    async fn test_digest_from_name() {
        let layer = stored_layer().await;
        assert_eq!(layer.diff_id(), sha256_digest(CONTENT));
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let store = LayerStore::new(hv, "p");
        assert!(VolumeLayer::from_raw(store.raw_layer("virter:layer:sha256:xyz")).is_err());
        assert!(VolumeLayer::from_raw(store.raw_layer("virter:work:a")).is_err());
    }

    #[tokio::test]
    async fn test_registry_layer_compression() {
        let layer = stored_layer().await;
        let compressed = layer.to_registry_layer().await.unwrap();

        let mut gz = Vec::new();
        compressed
            .compressed()
            .await
            .unwrap()
            .read_to_end(&mut gz)
            .await
            .unwrap();

        assert_eq!(compressed.size(), gz.len() as u64);
        assert_eq!(compressed.digest(), sha256_digest(&gz));
        assert_eq!(compressed.diff_id(), sha256_digest(CONTENT));
        assert_eq!(compressed.media_type(), LAYER_MEDIA_TYPE);

        let mut plain = Vec::new();
        compressed
            .uncompressed()
            .await
            .unwrap()
            .read_to_end(&mut plain)
            .await
            .unwrap();
        assert_eq!(plain, CONTENT);
    }
}
