//! gzip helpers for layer blobs.
//!
//! flate2 is synchronous, so compression runs on the blocking pool and
//! stages its output in temporary files. Digests are computed while
//! writing so each blob is read only once.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// Format a SHA-256 hasher state as `sha256:<hex>`.
pub fn format_digest(hasher: Sha256) -> String {
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// `sha256:<hex>` of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format_digest(Sha256::new_with_prefix(data))
}

/// Check that a string is a `sha256:` digest with 64 lowercase hex digits.
pub fn is_sha256_digest(s: &str) -> bool {
    match s.strip_prefix("sha256:") {
        Some(hex) => {
            hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

/// Writer adapter that hashes and counts everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consume the adapter, returning the inner writer, digest and byte count.
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, format_digest(self.hasher), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A compressed blob staged on disk.
#[derive(Debug)]
pub struct CompressedBlob {
    pub file: NamedTempFile,
    /// Digest of the compressed bytes.
    pub digest: String,
    /// Size of the compressed bytes.
    pub size: u64,
    /// Digest of the uncompressed input.
    pub diff_id: String,
}

/// gzip `reader` into a temporary file.
pub fn gzip_to_temp<R: Read>(mut reader: R) -> io::Result<CompressedBlob> {
    let file = NamedTempFile::new()?;
    let out = HashingWriter::new(file.reopen()?);
    let mut encoder = GzEncoder::new(out, Compression::default());

    let mut input_hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        input_hasher.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
    }

    let out = encoder.finish()?;
    let (mut written, digest, size) = out.finish();
    written.flush()?;
    written.sync_all()?;

    Ok(CompressedBlob {
        file,
        digest,
        size,
        diff_id: format_digest(input_hasher),
    })
}

/// gunzip a file into an anonymous temporary file, rewound to the start.
///
/// Returns the file and the digest of the decompressed content.
pub fn gunzip_to_temp(mut compressed: File) -> io::Result<(File, String)> {
    compressed.seek(SeekFrom::Start(0))?;
    let mut decoder = GzDecoder::new(compressed);
    let mut out = HashingWriter::new(tempfile::tempfile()?);
    io::copy(&mut decoder, &mut out)?;
    let (mut file, digest, _) = out.finish();
    file.flush()?;
    file.seek(SeekFrom::Start(0))?;
    Ok((file, digest))
}

/// Copy a reader into an anonymous temporary file, returning the rewound
/// file, its digest and size.
pub fn stage_to_temp<R: Read>(mut reader: R) -> io::Result<(File, String, u64)> {
    let mut out = HashingWriter::new(tempfile::tempfile()?);
    io::copy(&mut reader, &mut out)?;
    let (mut file, digest, size) = out.finish();
    file.flush()?;
    file.seek(SeekFrom::Start(0))?;
    Ok((file, digest, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT: &[u8] = b"something to download";

    #[test]
    fn test_sha256_known_content() {
        assert_eq!(
            sha256_digest(CONTENT),
            "sha256:8575b86cb19cdff6a47b8cddc00261c34acc3faea6e120eb6eccbca867c00b4b"
        );
    }

    #[test]
    fn test_is_sha256_digest() {
        assert!(is_sha256_digest(&sha256_digest(b"")));
        assert!(!is_sha256_digest("sha256:abc"));
        assert!(!is_sha256_digest("md5:d41d8cd98f00b204e9800998ecf8427e"));
        assert!(!is_sha256_digest(
            "sha256:8575B86CB19CDFF6A47B8CDDC00261C34ACC3FAEA6E120EB6ECCBCA867C00B4B"
        ));
    }

    #[test]
    fn test_gzip_digest_matches_bytes() {
        let blob = gzip_to_temp(CONTENT).unwrap();
        let bytes = std::fs::read(blob.file.path()).unwrap();

        assert_eq!(blob.size, bytes.len() as u64);
        assert_eq!(blob.digest, sha256_digest(&bytes));
        assert_eq!(blob.diff_id, sha256_digest(CONTENT));

        let (mut plain, digest) = gunzip_to_temp(blob.file.reopen().unwrap()).unwrap();
        let mut out = Vec::new();
        plain.read_to_end(&mut out).unwrap();
        assert_eq!(out, CONTENT);
        assert_eq!(digest, blob.diff_id);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        let (file, _, _) = stage_to_temp(&b"not gzip at all"[..]).unwrap();
        assert!(gunzip_to_temp(file).is_err());
    }
}
