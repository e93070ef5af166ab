//! OCI manifest documents.

use serde::{Deserialize, Serialize};

use crate::compress::sha256_digest;

use super::RegistryError;

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media types accepted when fetching a manifest.
pub(crate) const ACCEPTED_MANIFEST_TYPES: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

/// OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl Manifest {
    pub fn from_slice(body: &[u8]) -> Result<Self, RegistryError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Serialized form and its digest.
    pub fn to_bytes(&self) -> Result<(Vec<u8>, String), RegistryError> {
        let body = serde_json::to_vec(self)?;
        let digest = sha256_digest(&body);
        Ok((body, digest))
    }

    /// Total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_wire_format() {
        let body = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.com.linbit.virter.image.v1+json", "digest": "sha256:c", "size": 10},
            "layers": [
                {"mediaType": "application/vnd.com.linbit.virter.layer.v1.qcow2.gzip", "digest": "sha256:a", "size": 5000},
                {"mediaType": "application/vnd.com.linbit.virter.layer.v1.qcow2.gzip", "digest": "sha256:b", "size": 3000}
            ]
        }"#;
        let manifest = Manifest::from_slice(body).unwrap();
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.total_layer_size(), 8000);

        let (bytes, digest) = manifest.to_bytes().unwrap();
        assert_eq!(digest, sha256_digest(&bytes));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"schemaVersion\":2"));
        assert!(text.contains("\"mediaType\""));
    }
}
