//! Named images over layer chains.
//!
//! An image is a tag volume `virter:tag:<name>` whose backing store is the
//! top layer of the image. The tag itself holds no content. The layers of
//! an image are the dependency chain of its top layer, root first.

mod archive;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::hypervisor::UploadReader;
use crate::layer::{LayerError, LayerOption, LayerStore, VolumeLayer};
use crate::registry::{Reference, RegistryClient, RegistryError, RegistryImage, RegistryLayer};

pub use archive::{image_load, image_save};

/// Name prefix of tag volumes.
pub const TAG_PREFIX: &str = "virter:tag:";

/// Media type of the image config blob.
pub const IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.com.linbit.virter.image.v1+json";

/// Errors from image operations.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("layer error: {0}")]
    Layer(#[from] LayerError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image {0} not found")]
    NotFound(String),

    #[error("invalid image name: {0:?}")]
    InvalidName(String),

    #[error("image {name} was concurrently tagged with {existing}, not {requested}")]
    Conflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("tag of image {0} does not reference a layer")]
    Corrupt(String),

    #[error("unsupported image config type {actual}, expected {expected}")]
    UnsupportedMediaType { expected: String, actual: String },

    #[error("image {0} has no layers")]
    Empty(String),

    #[error("invalid image archive: {0}")]
    Archive(String),
}

impl ImageError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Layer(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Image config blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    pub rootfs: RootFs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Uncompressed layer digests, root first.
    pub diff_ids: Vec<String>,
}

impl ImageConfig {
    fn for_layers(layers: &[VolumeLayer]) -> Self {
        Self {
            created: None,
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: layers.iter().map(|l| l.diff_id().to_string()).collect(),
            },
        }
    }
}

/// A named pointer to a top layer.
#[derive(Debug, Clone)]
pub struct Image {
    name: String,
    top: VolumeLayer,
}

impl Image {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn top(&self) -> &VolumeLayer {
        &self.top
    }

    pub fn tag_volume(&self) -> String {
        tag_name(&self.name)
    }

    /// Layers of the image, root first.
    ///
    /// A chain that leaves the layer store is an error, never truncated.
    pub async fn layers(&self) -> Result<Vec<VolumeLayer>, ImageError> {
        let mut chain = vec![self.top.clone()];
        let mut seen = HashSet::from([self.top.name().to_string()]);
        let mut current = self.top.clone();

        while let Some(parent) = current.dependency().await? {
            if !seen.insert(parent.name().to_string()) {
                return Err(LayerError::Cycle {
                    volume: self.top.name().to_string(),
                }
                .into());
            }
            chain.push(parent.clone());
            current = parent;
        }

        chain.reverse();
        Ok(chain)
    }

    pub async fn config(&self) -> Result<ImageConfig, ImageError> {
        Ok(ImageConfig::for_layers(&self.layers().await?))
    }

    /// Compress every layer for transfer to a registry.
    pub async fn to_registry_image(&self) -> Result<RegistryImage, ImageError> {
        let layers = self.layers().await?;
        let mut compressed: Vec<Box<dyn RegistryLayer>> = Vec::with_capacity(layers.len());
        for layer in &layers {
            compressed.push(Box::new(layer.to_registry_layer().await?));
        }

        let config = ImageConfig::for_layers(&layers);
        Ok(RegistryImage {
            config_media_type: IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            config: serde_json::to_vec(&config)?,
            layers: compressed,
        })
    }
}

/// Volume name of the tag for image `name`.
pub fn tag_name(name: &str) -> String {
    format!("{}{}", TAG_PREFIX, name)
}

fn validate_name(name: &str) -> Result<(), ImageError> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(ImageError::InvalidName(name.to_string()));
    }
    Ok(())
}

async fn backing_path(store: &LayerStore, volume: &str) -> Result<Option<String>, ImageError> {
    let desc = store.raw_layer(volume).descriptor().await?;
    Ok(desc.backing_store.map(|b| b.path))
}

/// Point the tag of `name` at `top`.
///
/// Retagging to the layer already referenced changes nothing.
pub async fn make_image(
    store: &LayerStore,
    name: &str,
    top: &VolumeLayer,
) -> Result<Image, ImageError> {
    validate_name(name)?;
    let tag = tag_name(name);
    let top_path = top.path().await?;
    let image = Image {
        name: name.to_string(),
        top: top.clone(),
    };

    let previous = match find_image(store, name).await {
        Ok(found) => found,
        Err(ImageError::Corrupt(_)) | Err(ImageError::Layer(LayerError::Foreign { .. })) => {
            warn!(image = %name, "Replacing unreadable tag");
            store.raw_layer(&tag).delete().await?;
            None
        }
        Err(e) => return Err(e),
    };

    if let Some(previous) = &previous {
        if previous.top.name() == top.name() {
            debug!(image = %name, layer = %top.name(), "Image already tagged");
            return Ok(image);
        }
        store.raw_layer(&tag).delete().await?;
    }

    match store
        .create_layer(&tag, &[LayerOption::WithBacking(top.clone())])
        .await
    {
        Ok(_) => {}
        Err(e) if is_already_exists(&e) => {
            // Someone else created the tag in between.
            let existing = backing_path(store, &tag).await?.unwrap_or_default();
            if existing != top_path {
                return Err(ImageError::Conflict {
                    name: name.to_string(),
                    existing,
                    requested: top_path,
                });
            }
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(previous) = previous {
        let deleted = store.delete_all_if_unused(previous.top.name()).await?;
        debug!(image = %name, deleted = deleted.len(), "Released previous layers");
    }

    info!(image = %name, layer = %top.name(), "Tagged image");
    Ok(image)
}

fn is_already_exists(e: &LayerError) -> bool {
    matches!(e, LayerError::Hypervisor(h) if h.is_already_exists())
}

/// Look up an image; `None` if no tag exists.
pub async fn find_image(store: &LayerStore, name: &str) -> Result<Option<Image>, ImageError> {
    let Some(tag) = store.find_raw_layer(&tag_name(name)).await? else {
        return Ok(None);
    };
    let top = match tag.dependency().await {
        Ok(Some(top)) => top,
        Ok(None) => return Err(ImageError::Corrupt(name.to_string())),
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(Image {
        name: name.to_string(),
        top,
    }))
}

/// All images of the pool. Unreadable tags are logged and skipped.
pub async fn image_list(store: &LayerStore) -> Result<Vec<Image>, ImageError> {
    let names = store.conn().volume_list(store.pool()).await.map_err(LayerError::from)?;
    let mut images = Vec::new();
    for volume in names {
        let Some(name) = volume.strip_prefix(TAG_PREFIX) else {
            continue;
        };
        match find_image(store, name).await {
            Ok(Some(image)) => images.push(image),
            Ok(None) => {}
            Err(e) => warn!(image = %name, error = %e, "Skipping unreadable image"),
        }
    }
    Ok(images)
}

/// Remove the tag of an image and every layer that becomes unused.
///
/// Removing an unknown image succeeds.
pub async fn image_rm(store: &LayerStore, name: &str) -> Result<(), ImageError> {
    let Some(image) = find_image(store, name).await? else {
        debug!(image = %name, "Image not found, nothing to remove");
        return Ok(());
    };

    store.raw_layer(&image.tag_volume()).delete().await?;
    let deleted = store.delete_all_if_unused(image.top.name()).await?;
    info!(image = %name, layers = deleted.len(), "Removed image");
    Ok(())
}

/// Store the whole stream as a single layer and tag it.
pub async fn image_import_from_reader(
    store: &LayerStore,
    name: &str,
    reader: UploadReader<'_>,
) -> Result<Image, ImageError> {
    validate_name(name)?;
    let work = format!("import-{}", name);
    let layer = import_layer(store, &work, None, reader, None).await?;
    make_image(store, name, &layer).await
}

/// Import a registry image as a layer chain and tag its top layer.
pub async fn image_import(
    store: &LayerStore,
    name: &str,
    source: &RegistryImage,
) -> Result<Image, ImageError> {
    validate_name(name)?;
    if source.config_media_type != IMAGE_CONFIG_MEDIA_TYPE {
        return Err(ImageError::UnsupportedMediaType {
            expected: IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            actual: source.config_media_type.clone(),
        });
    }
    if source.layers.is_empty() {
        return Err(ImageError::Empty(name.to_string()));
    }

    let mut parent: Option<VolumeLayer> = None;
    for (i, remote) in source.layers.iter().enumerate() {
        if let Some(existing) = store.find_volume_layer(remote.diff_id()).await? {
            debug!(layer = %existing.name(), "Layer already stored");
            parent = Some(existing);
            continue;
        }

        let mut content = remote.uncompressed().await?;
        let work = format!("{}-{}", name, i);
        let layer = import_layer(
            store,
            &work,
            parent.as_ref(),
            &mut *content,
            Some(remote.diff_id()),
        )
        .await?;
        parent = Some(layer);
    }

    let top = parent.ok_or_else(|| ImageError::Empty(name.to_string()))?;
    make_image(store, name, &top).await
}

/// Upload `reader` into a fresh working volume and store it as a layer.
async fn import_layer(
    store: &LayerStore,
    work: &str,
    parent: Option<&VolumeLayer>,
    reader: UploadReader<'_>,
    digest: Option<&str>,
) -> Result<VolumeLayer, ImageError> {
    let opts: Vec<LayerOption> = parent
        .map(|p| LayerOption::WithBacking(p.clone()))
        .into_iter()
        .collect();

    // A previous interrupted import may have left the working volume.
    let stale = store.raw_layer(&format!("{}{}", crate::layer::WORK_PREFIX, work));
    stale.delete().await?;

    let raw = store.new_dynamic_layer(work, &opts).await?;
    if let Err(e) = raw.upload(reader).await {
        if let Err(cleanup) = raw.delete().await {
            warn!(volume = %raw.name(), error = %cleanup, "Failed to remove working volume");
        }
        return Err(e.into());
    }
    Ok(raw.to_volume_layer(digest, &[]).await?)
}

/// Push an image to a registry.
pub async fn image_push(
    store: &LayerStore,
    registry: &dyn RegistryClient,
    name: &str,
    reference: &Reference,
) -> Result<String, ImageError> {
    let image = find_image(store, name)
        .await?
        .ok_or_else(|| ImageError::NotFound(name.to_string()))?;

    registry.check_push_permission(reference).await?;
    let remote = image.to_registry_image().await?;
    let digest = registry.push(reference, &remote).await?;
    info!(image = %name, reference = %reference, digest = %digest, "Pushed image");
    Ok(digest)
}

/// Pull an image from a registry and tag it as `name`.
pub async fn image_pull(
    store: &LayerStore,
    registry: &dyn RegistryClient,
    reference: &Reference,
    name: &str,
) -> Result<Image, ImageError> {
    let remote = registry.pull(reference).await?;
    let image = image_import(store, name, &remote).await?;
    info!(image = %name, reference = %reference, "Pulled image");
    Ok(image)
}

/// Delete every layer not reachable from a tag or another volume.
pub async fn image_prune(store: &LayerStore) -> Result<Vec<String>, ImageError> {
    Ok(store.prune().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::compress::sha256_digest;
    use crate::hypervisor::{Hypervisor, MemoryHypervisor};
    use crate::layer::is_layer_name;

    fn store() -> (Arc<MemoryHypervisor>, LayerStore) {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let store = LayerStore::new(hv.clone(), "p");
        (hv, store)
    }

    async fn layer_count(hv: &MemoryHypervisor) -> usize {
        hv.volume_list("p")
            .await
            .unwrap()
            .iter()
            .filter(|n| is_layer_name(n))
            .count()
    }

    #[tokio::test]
    async fn test_import_from_reader_tags_image() {
        let (hv, store) = store();
        let image = image_import_from_reader(&store, "base", &mut &b"disk"[..])
            .await
            .unwrap();
        assert_eq!(image.top().diff_id(), sha256_digest(b"disk"));

        let found = find_image(&store, "base").await.unwrap().unwrap();
        assert_eq!(found.top().name(), image.top().name());
        assert_eq!(layer_count(&hv).await, 1);
    }

    #[tokio::test]
    async fn test_identical_content_is_deduplicated() {
        let (hv, store) = store();
        let a = image_import_from_reader(&store, "a", &mut &b"same"[..])
            .await
            .unwrap();
        let b = image_import_from_reader(&store, "b", &mut &b"same"[..])
            .await
            .unwrap();
        assert_eq!(a.top().name(), b.top().name());
        assert_eq!(layer_count(&hv).await, 1);
    }

    #[tokio::test]
    async fn test_make_image_is_idempotent() {
        let (hv, store) = store();
        let image = image_import_from_reader(&store, "base", &mut &b"disk"[..])
            .await
            .unwrap();
        let before = hv.volume_list("p").await.unwrap();
        make_image(&store, "base", image.top()).await.unwrap();
        assert_eq!(hv.volume_list("p").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_retag_releases_previous_layer() {
        let (hv, store) = store();
        image_import_from_reader(&store, "base", &mut &b"v1"[..])
            .await
            .unwrap();
        let other = image_import_from_reader(&store, "other", &mut &b"v2"[..])
            .await
            .unwrap();

        make_image(&store, "base", other.top()).await.unwrap();
        let found = find_image(&store, "base").await.unwrap().unwrap();
        assert_eq!(found.top().name(), other.top().name());
        assert_eq!(layer_count(&hv).await, 1);
    }

    #[tokio::test]
    async fn test_image_rm_unknown_is_ok() {
        let (_, store) = store();
        image_rm(&store, "missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_image_rm_removes_tag_and_layers() {
        let (hv, store) = store();
        image_import_from_reader(&store, "base", &mut &b"disk"[..])
            .await
            .unwrap();
        image_rm(&store, "base").await.unwrap();
        assert!(hv.volume_list("p").await.unwrap().is_empty());
        assert!(find_image(&store, "base").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_image_rm_keeps_shared_layer() {
        let (hv, store) = store();
        let a = image_import_from_reader(&store, "a", &mut &b"same"[..])
            .await
            .unwrap();
        image_import_from_reader(&store, "b", &mut &b"same"[..])
            .await
            .unwrap();
        image_rm(&store, "a").await.unwrap();
        assert!(store.find_raw_layer(a.top().name()).await.unwrap().is_some());
        assert_eq!(layer_count(&hv).await, 1);
    }

    #[tokio::test]
    async fn test_image_list_skips_untagged() {
        let (hv, store) = store();
        image_import_from_reader(&store, "a", &mut &b"1"[..])
            .await
            .unwrap();
        image_import_from_reader(&store, "b", &mut &b"2"[..])
            .await
            .unwrap();
        hv.volume_create("p", &crate::hypervisor::VolumeDescriptor::new("vm-disk"))
            .await
            .unwrap();

        let mut names: Vec<String> = image_list(&store)
            .await
            .unwrap()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (_, store) = store();
        for name in ["", "a b", "x/y"] {
            let err = image_import_from_reader(&store, name, &mut &b"1"[..])
                .await
                .unwrap_err();
            assert!(matches!(err, ImageError::InvalidName(_)));
        }
    }

    #[tokio::test]
    async fn test_import_rejects_foreign_config() {
        let (_, store) = store();
        let source = RegistryImage {
            config_media_type: "application/vnd.oci.image.config.v1+json".to_string(),
            config: b"{}".to_vec(),
            layers: Vec::new(),
        };
        let err = image_import(&store, "x", &source).await.unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedMediaType { .. }));
    }

    #[tokio::test]
    async fn test_import_rejects_empty_image() {
        let (_, store) = store();
        let source = RegistryImage {
            config_media_type: IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            config: b"{}".to_vec(),
            layers: Vec::new(),
        };
        let err = image_import(&store, "x", &source).await.unwrap_err();
        assert!(matches!(err, ImageError::Empty(_)));
    }

    #[test]
    fn test_config_wire_format() {
        let config = ImageConfig {
            created: None,
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec!["sha256:a".to_string()],
            },
        };
        assert_eq!(
            serde_json::to_string(&config).unwrap(),
            r#"{"rootfs":{"type":"layers","diff_ids":["sha256:a"]}}"#
        );
    }
}
