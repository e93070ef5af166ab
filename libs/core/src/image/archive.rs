//! Image archives.
//!
//! An archive is a tar file holding `manifest.json` and every blob it
//! references under `blobs/sha256/<hex>`: the config and the gzip
//! compressed layers. Loading verifies each blob digest.

use std::collections::HashMap;
use std::io::{self, Read, SeekFrom, Write};

use tempfile::NamedTempFile;
use tracing::info;

use crate::compress::HashingWriter;
use crate::layer::LayerStore;
use crate::registry::{BlobLayer, Manifest, RegistryError, RegistryImage, RegistryLayer};

use super::{find_image, image_import, Image, ImageConfig, ImageError, IMAGE_CONFIG_MEDIA_TYPE};

const MANIFEST_PATH: &str = "manifest.json";
const BLOB_DIR: &str = "blobs/sha256/";

fn blob_path(digest: &str) -> String {
    format!("{}{}", BLOB_DIR, digest.trim_start_matches("sha256:"))
}

/// Write image `name` as an archive to `writer`, returning the writer.
pub async fn image_save<W>(store: &LayerStore, name: &str, writer: W) -> Result<W, ImageError>
where
    W: Write + Send + 'static,
{
    let image = find_image(store, name)
        .await?
        .ok_or_else(|| ImageError::NotFound(name.to_string()))?;
    let remote = image.to_registry_image().await?;
    let (manifest, _) = remote.manifest().to_bytes()?;

    let mut entries: Vec<(String, std::fs::File, u64)> = Vec::with_capacity(remote.layers.len());
    for layer in &remote.layers {
        let mut reader = layer.compressed().await?;
        let mut staged = tokio::fs::File::from_std(tempfile::tempfile()?);
        tokio::io::copy(&mut reader, &mut staged).await?;
        tokio::io::AsyncSeekExt::seek(&mut staged, SeekFrom::Start(0)).await?;
        entries.push((blob_path(layer.digest()), staged.into_std().await, layer.size()));
    }
    let config_path = blob_path(&remote.config_descriptor().digest);
    let config = remote.config.clone();

    let writer = tokio::task::spawn_blocking(move || -> io::Result<W> {
        let mut builder = tar::Builder::new(writer);
        append_bytes(&mut builder, MANIFEST_PATH, &manifest)?;
        append_bytes(&mut builder, &config_path, &config)?;
        for (path, file, size) in entries {
            let mut header = file_header(size);
            builder.append_data(&mut header, path, file)?;
        }
        builder.into_inner()
    })
    .await
    .map_err(io::Error::other)??;

    info!(image = %name, layers = remote.layers.len(), "Saved image archive");
    Ok(writer)
}

fn file_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = file_header(data.len() as u64);
    builder.append_data(&mut header, path, data)
}

/// A blob read from an archive: file, digest and size.
type StagedBlob = (NamedTempFile, String, u64);

/// Import an archive from `reader` as image `name`.
pub async fn image_load<R>(store: &LayerStore, name: &str, reader: R) -> Result<Image, ImageError>
where
    R: Read + Send + 'static,
{
    let (manifest, mut blobs) = tokio::task::spawn_blocking(move || read_archive(reader))
        .await
        .map_err(io::Error::other)??;
    let manifest = Manifest::from_slice(&manifest)?;
    if manifest.config.media_type != IMAGE_CONFIG_MEDIA_TYPE {
        return Err(ImageError::UnsupportedMediaType {
            expected: IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            actual: manifest.config.media_type,
        });
    }

    let mut take = |digest: &str| {
        blobs
            .remove(digest)
            .ok_or_else(|| ImageError::Archive(format!("missing blob {}", digest)))
    };

    let (config_file, actual, _) = take(&manifest.config.digest)?;
    if actual != manifest.config.digest {
        return Err(RegistryError::DigestMismatch {
            expected: manifest.config.digest.clone(),
            actual,
        }
        .into());
    }
    let mut config = Vec::new();
    config_file.reopen()?.read_to_end(&mut config)?;
    let parsed: ImageConfig = serde_json::from_slice(&config)?;
    if parsed.rootfs.diff_ids.len() != manifest.layers.len() {
        return Err(ImageError::Archive(format!(
            "{} layers but {} diff_ids in config",
            manifest.layers.len(),
            parsed.rootfs.diff_ids.len()
        )));
    }

    let mut layers: Vec<Box<dyn RegistryLayer>> = Vec::with_capacity(manifest.layers.len());
    for (desc, diff_id) in manifest.layers.iter().zip(&parsed.rootfs.diff_ids) {
        let (file, actual, size) = take(&desc.digest)?;
        let layer = BlobLayer::from_staged(file, actual, size, &desc.digest, &desc.media_type, diff_id)?;
        layers.push(Box::new(layer));
    }

    let source = RegistryImage {
        config_media_type: manifest.config.media_type.clone(),
        config,
        layers,
    };
    let image = image_import(store, name, &source).await?;
    info!(image = %name, "Loaded image archive");
    Ok(image)
}

fn read_archive<R: Read>(reader: R) -> Result<(Vec<u8>, HashMap<String, StagedBlob>), ImageError> {
    let mut archive = tar::Archive::new(reader);
    let mut manifest = None;
    let mut blobs = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let path = path.trim_start_matches("./");

        if path == MANIFEST_PATH {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            manifest = Some(buf);
        } else if let Some(hex) = path.strip_prefix(BLOB_DIR) {
            let file = NamedTempFile::new()?;
            let mut out = HashingWriter::new(file.reopen()?);
            io::copy(&mut entry, &mut out)?;
            let (mut written, digest, size) = out.finish();
            written.flush()?;
            blobs.insert(format!("sha256:{}", hex), (file, digest, size));
        }
    }

    let manifest = manifest.ok_or_else(|| ImageError::Archive("no manifest.json".to_string()))?;
    Ok((manifest, blobs))
}
