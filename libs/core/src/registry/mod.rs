//! Container registry interface.
//!
//! Images travel to and from registries as an OCI manifest, a config blob
//! and an ordered list of gzip-compressed layers. The [`RegistryClient`]
//! trait is the seam used by the image model; [`OciRegistryClient`] talks to
//! a registry over the distribution HTTP API.

mod blob;
mod manifest;
mod oci;
mod reference;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use blob::BlobLayer;
pub use manifest::{Descriptor, Manifest, OCI_MANIFEST_MEDIA_TYPE};
pub use oci::{OciRegistryClient, RegistryConfig};
pub use reference::Reference;

use crate::compress::sha256_digest;

/// Owned, sendable byte stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Not found in registry: {0}")]
    NotFound(String),

    #[error("Authentication required for {0}")]
    AuthRequired(String),

    #[error("Push to {0} denied")]
    PushDenied(String),

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Unexpected response from {url}: {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
}

/// One layer of a registry image.
#[async_trait]
pub trait RegistryLayer: Send + Sync {
    /// Digest of the compressed blob.
    fn digest(&self) -> &str;

    /// Size of the compressed blob in bytes.
    fn size(&self) -> u64;

    fn media_type(&self) -> &str;

    /// Digest of the uncompressed content.
    fn diff_id(&self) -> &str;

    /// Stream of the compressed blob.
    async fn compressed(&self) -> Result<BoxReader, RegistryError>;

    /// Stream of the uncompressed content.
    async fn uncompressed(&self) -> Result<BoxReader, RegistryError>;
}

/// An image as exchanged with a registry.
pub struct RegistryImage {
    pub config_media_type: String,
    /// Raw config blob; its digest is part of the manifest.
    pub config: Vec<u8>,
    /// Layers, root first.
    pub layers: Vec<Box<dyn RegistryLayer>>,
}

impl std::fmt::Debug for RegistryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryImage")
            .field("config_media_type", &self.config_media_type)
            .field(
                "layers",
                &self.layers.iter().map(|l| l.digest()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RegistryImage {
    pub fn config_descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.config_media_type.clone(),
            digest: sha256_digest(&self.config),
            size: self.config.len() as u64,
        }
    }

    /// The manifest describing this image.
    pub fn manifest(&self) -> Manifest {
        Manifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
            config: self.config_descriptor(),
            layers: self
                .layers
                .iter()
                .map(|l| Descriptor {
                    media_type: l.media_type().to_string(),
                    digest: l.digest().to_string(),
                    size: l.size(),
                })
                .collect(),
        }
    }
}

/// Pull and push primitives of a registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fail early if pushing to `reference` would be rejected.
    async fn check_push_permission(&self, reference: &Reference) -> Result<(), RegistryError>;

    /// Fetch manifest, config and layers. Layer blobs are verified against
    /// their digests before this returns.
    async fn pull(&self, reference: &Reference) -> Result<RegistryImage, RegistryError>;

    /// Upload layers, config and manifest. Returns the manifest digest.
    async fn push(
        &self,
        reference: &Reference,
        image: &RegistryImage,
    ) -> Result<String, RegistryError>;
}
