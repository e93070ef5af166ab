//! Layers staged as local blob files.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::compress::{format_digest, gunzip_to_temp};

use super::{BoxReader, RegistryError, RegistryLayer};

/// A compressed layer held in a temporary file.
///
/// The compressed digest is checked when the blob is staged; the
/// uncompressed digest is checked each time the content is expanded.
#[derive(Debug)]
pub struct BlobLayer {
    file: NamedTempFile,
    digest: String,
    size: u64,
    media_type: String,
    diff_id: String,
}

impl BlobLayer {
    /// Copy `reader` into a temporary file, verifying it against `digest`.
    pub async fn stage<R: AsyncRead + Unpin>(
        reader: &mut R,
        digest: &str,
        media_type: &str,
        diff_id: &str,
    ) -> Result<Self, RegistryError> {
        let file = NamedTempFile::new()?;
        let mut out = tokio::fs::File::from_std(file.reopen()?);
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        out.flush().await?;
        Self::from_staged(file, format_digest(hasher), size, digest, media_type, diff_id)
    }

    /// Stage a blob that arrives in chunks, such as an HTTP body.
    pub(crate) async fn stage_chunks(
        response: &mut reqwest::Response,
        digest: &str,
        media_type: &str,
        diff_id: &str,
    ) -> Result<Self, RegistryError> {
        let file = NamedTempFile::new()?;
        let mut out = tokio::fs::File::from_std(file.reopen()?);
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            out.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        out.flush().await?;
        Self::from_staged(file, format_digest(hasher), size, digest, media_type, diff_id)
    }

    /// Wrap an already staged blob, checking its digest against `digest`.
    pub(crate) fn from_staged(
        file: NamedTempFile,
        actual: String,
        size: u64,
        digest: &str,
        media_type: &str,
        diff_id: &str,
    ) -> Result<Self, RegistryError> {
        if actual != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        Ok(Self {
            file,
            digest: actual,
            size,
            media_type: media_type.to_string(),
            diff_id: diff_id.to_string(),
        })
    }
}

#[async_trait]
impl RegistryLayer for BlobLayer {
    fn digest(&self) -> &str {
        &self.digest
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn media_type(&self) -> &str {
        &self.media_type
    }

    fn diff_id(&self) -> &str {
        &self.diff_id
    }

    async fn compressed(&self) -> Result<BoxReader, RegistryError> {
        Ok(Box::new(tokio::fs::File::from_std(self.file.reopen()?)))
    }

    async fn uncompressed(&self) -> Result<BoxReader, RegistryError> {
        let compressed = self.file.reopen()?;
        let (plain, actual) = tokio::task::spawn_blocking(move || gunzip_to_temp(compressed))
            .await
            .map_err(std::io::Error::other)??;
        if actual != self.diff_id {
            return Err(RegistryError::DigestMismatch {
                expected: self.diff_id.clone(),
                actual,
            });
        }
        Ok(Box::new(tokio::fs::File::from_std(plain)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{gzip_to_temp, sha256_digest};
    use std::io::Read;

    const CONTENT: &[u8] = b"something to download";

    fn gzipped() -> Vec<u8> {
        let blob = gzip_to_temp(CONTENT).unwrap();
        let mut gz = Vec::new();
        blob.file.reopen().unwrap().read_to_end(&mut gz).unwrap();
        gz
    }

    #[tokio::test]
    async fn test_stage_and_expand() {
        let gz = gzipped();
        let digest = sha256_digest(&gz);
        let layer = BlobLayer::stage(&mut gz.as_slice(), &digest, "m", &sha256_digest(CONTENT))
            .await
            .unwrap();
        assert_eq!(layer.size(), gz.len() as u64);

        let mut plain = Vec::new();
        layer
            .uncompressed()
            .await
            .unwrap()
            .read_to_end(&mut plain)
            .await
            .unwrap();
        assert_eq!(plain, CONTENT);
    }

    #[tokio::test]
    async fn test_stage_rejects_wrong_digest() {
        let gz = gzipped();
        let err = BlobLayer::stage(&mut gz.as_slice(), &sha256_digest(b"x"), "m", "d")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_expand_rejects_wrong_diff_id() {
        let gz = gzipped();
        let digest = sha256_digest(&gz);
        let layer = BlobLayer::stage(&mut gz.as_slice(), &digest, "m", &sha256_digest(b"x"))
            .await
            .unwrap();
        assert!(matches!(
            layer.uncompressed().await,
            Err(RegistryError::DigestMismatch { .. })
        ));
    }
}
