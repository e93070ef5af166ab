//! Registry client for the OCI distribution HTTP API.
//!
//! Covers what image push and pull need: manifests and blobs by digest,
//! monolithic blob uploads and a bearer token. Token negotiation, chunked
//! uploads and cross-repository mounts are not implemented.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::compress::sha256_digest;

use super::manifest::ACCEPTED_MANIFEST_TYPES;
use super::{
    BlobLayer, BoxReader, Manifest, Reference, RegistryClient, RegistryError, RegistryImage,
    RegistryLayer, OCI_MANIFEST_MEDIA_TYPE,
};

const UPLOAD_CHUNK: usize = 256 * 1024;

/// Configuration for [`OciRegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bearer token sent with every request.
    pub token: Option<String>,
    /// Talk plain HTTP instead of HTTPS.
    pub plain_http: bool,
    /// Timeout for a single request.
    pub timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            token: None,
            plain_http: false,
            timeout: Duration::from_secs(1800),
        }
    }
}

/// OCI distribution client.
#[derive(Debug, Clone)]
pub struct OciRegistryClient {
    config: RegistryConfig,
    client: Client,
}

impl OciRegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn base_url(&self, reference: &Reference) -> String {
        let scheme = if self.config.plain_http { "http" } else { "https" };
        format!("{}://{}/v2/{}", scheme, reference.registry, reference.repository)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn get_manifest(&self, reference: &Reference) -> Result<Manifest, RegistryError> {
        let url = format!("{}/manifests/{}", self.base_url(reference), reference.tag);
        debug!(url = %url, "Pulling manifest");

        let response = self
            .authorize(self.client.get(&url).header(ACCEPT, ACCEPTED_MANIFEST_TYPES))
            .send()
            .await?;
        let response = check_status(response, &url, reference.to_string())?;
        let body = response.bytes().await?;

        if reference.is_digest() {
            let actual = sha256_digest(&body);
            if actual != reference.tag {
                return Err(RegistryError::DigestMismatch {
                    expected: reference.tag.clone(),
                    actual,
                });
            }
        }
        Manifest::from_slice(&body)
    }

    async fn get_blob(&self, reference: &Reference, digest: &str) -> Result<Response, RegistryError> {
        let url = format!("{}/blobs/{}", self.base_url(reference), digest);
        debug!(url = %url, "Pulling blob");
        let response = self.authorize(self.client.get(&url)).send().await?;
        check_status(response, &url, digest.to_string())
    }

    async fn blob_exists(&self, reference: &Reference, digest: &str) -> Result<bool, RegistryError> {
        let url = format!("{}/blobs/{}", self.base_url(reference), digest);
        let response = self.authorize(self.client.head(&url)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED => Err(RegistryError::AuthRequired(reference.to_string())),
            status => Err(RegistryError::UnexpectedStatus {
                url,
                status: status.as_u16(),
            }),
        }
    }

    /// Start an upload session and return its location URL.
    async fn start_upload(&self, reference: &Reference) -> Result<String, RegistryError> {
        let url = format!("{}/blobs/uploads/", self.base_url(reference));
        let response = self
            .authorize(self.client.post(&url).header(CONTENT_LENGTH, 0))
            .send()
            .await?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::CREATED => {}
            StatusCode::UNAUTHORIZED => {
                return Err(RegistryError::AuthRequired(reference.to_string()))
            }
            StatusCode::FORBIDDEN => return Err(RegistryError::PushDenied(reference.to_string())),
            status => {
                return Err(RegistryError::UnexpectedStatus {
                    url,
                    status: status.as_u16(),
                })
            }
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::UnexpectedStatus {
                url: url.clone(),
                status: response.status().as_u16(),
            })?;

        // Registries may answer with a path relative to the host.
        if location.starts_with('/') {
            let scheme = if self.config.plain_http { "http" } else { "https" };
            Ok(format!("{}://{}{}", scheme, reference.registry, location))
        } else {
            Ok(location.to_string())
        }
    }

    async fn upload_blob(
        &self,
        reference: &Reference,
        digest: &str,
        size: u64,
        body: Body,
    ) -> Result<(), RegistryError> {
        let location = self.start_upload(reference).await?;
        let sep = if location.contains('?') { '&' } else { '?' };
        let url = format!("{}{}digest={}", location, sep, digest);

        let response = self
            .authorize(
                self.client
                    .put(&url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, size)
                    .body(body),
            )
            .send()
            .await?;
        check_status(response, &url, digest.to_string())?;
        debug!(digest = %digest, size, "Uploaded blob");
        Ok(())
    }

    async fn push_layer(
        &self,
        reference: &Reference,
        layer: &dyn RegistryLayer,
    ) -> Result<(), RegistryError> {
        if self.blob_exists(reference, layer.digest()).await? {
            debug!(digest = %layer.digest(), "Blob already present");
            return Ok(());
        }
        let reader = layer.compressed().await?;
        self.upload_blob(reference, layer.digest(), layer.size(), reader_body(reader))
            .await
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn check_push_permission(&self, reference: &Reference) -> Result<(), RegistryError> {
        let location = self.start_upload(reference).await?;
        // The session is abandoned; registries expire it on their own.
        if let Err(e) = self.authorize(self.client.delete(&location)).send().await {
            debug!(error = %e, "Failed to cancel upload session");
        }
        Ok(())
    }

    async fn pull(&self, reference: &Reference) -> Result<RegistryImage, RegistryError> {
        let manifest = self.get_manifest(reference).await?;

        let config_body = self
            .get_blob(reference, &manifest.config.digest)
            .await?
            .bytes()
            .await?;
        let actual = sha256_digest(&config_body);
        if actual != manifest.config.digest {
            return Err(RegistryError::DigestMismatch {
                expected: manifest.config.digest.clone(),
                actual,
            });
        }
        let diff_ids = diff_ids_of(&config_body)?;
        if diff_ids.len() != manifest.layers.len() {
            return Err(RegistryError::UnsupportedMediaType(format!(
                "{} layers but {} diff_ids in config",
                manifest.layers.len(),
                diff_ids.len()
            )));
        }

        let mut layers: Vec<Box<dyn RegistryLayer>> = Vec::with_capacity(manifest.layers.len());
        for (desc, diff_id) in manifest.layers.iter().zip(diff_ids) {
            let mut response = self.get_blob(reference, &desc.digest).await?;
            let layer =
                BlobLayer::stage_chunks(&mut response, &desc.digest, &desc.media_type, &diff_id)
                    .await?;
            info!(digest = %desc.digest, size = layer.size(), "Blob downloaded");
            layers.push(Box::new(layer));
        }

        Ok(RegistryImage {
            config_media_type: manifest.config.media_type,
            config: config_body.to_vec(),
            layers,
        })
    }

    async fn push(
        &self,
        reference: &Reference,
        image: &RegistryImage,
    ) -> Result<String, RegistryError> {
        for layer in &image.layers {
            self.push_layer(reference, layer.as_ref()).await?;
        }

        let config = image.config_descriptor();
        if !self.blob_exists(reference, &config.digest).await? {
            self.upload_blob(
                reference,
                &config.digest,
                config.size,
                Body::from(image.config.clone()),
            )
            .await?;
        }

        let (body, digest) = image.manifest().to_bytes()?;
        let url = format!("{}/manifests/{}", self.base_url(reference), reference.tag);
        let response = self
            .authorize(
                self.client
                    .put(&url)
                    .header(CONTENT_TYPE, OCI_MANIFEST_MEDIA_TYPE)
                    .body(body),
            )
            .send()
            .await?;
        check_status(response, &url, reference.to_string())?;

        info!(reference = %reference, digest = %digest, "Pushed image");
        Ok(digest)
    }
}

fn check_status(response: Response, url: &str, what: String) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND => Err(RegistryError::NotFound(what)),
        StatusCode::UNAUTHORIZED => Err(RegistryError::AuthRequired(what)),
        StatusCode::FORBIDDEN => Err(RegistryError::PushDenied(what)),
        _ => {
            warn!(url = %url, status = status.as_u16(), "Registry request failed");
            Err(RegistryError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

/// `rootfs.diff_ids` of an image config.
fn diff_ids_of(config: &[u8]) -> Result<Vec<String>, RegistryError> {
    #[derive(serde::Deserialize)]
    struct Config {
        rootfs: RootFs,
    }
    #[derive(serde::Deserialize)]
    struct RootFs {
        diff_ids: Vec<String>,
    }
    let config: Config = serde_json::from_slice(config)?;
    Ok(config.rootfs.diff_ids)
}

/// Stream a reader as a request body.
fn reader_body(reader: BoxReader) -> Body {
    let stream = futures_util::stream::try_unfold(reader, |mut reader| async move {
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), reader)))
    });
    Body::wrap_stream(stream)
}
