//! Image references such as `registry.example.com/team/base:v1`.

use std::fmt;
use std::str::FromStr;

use super::RegistryError;

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    /// Tag, or a `sha256:` digest for `name@digest` references.
    pub tag: String,
}

impl Reference {
    /// Parse a reference string.
    ///
    /// Without a registry host the Docker Hub defaults apply; without a tag
    /// `latest` is used.
    pub fn parse(image_ref: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidReference(image_ref.to_string());
        if image_ref.is_empty() || image_ref.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let (name_part, tag) = if let Some((name, digest)) = image_ref.rsplit_once('@') {
            (name, digest.to_string())
        } else if let Some((name, tag)) = image_ref.rsplit_once(':') {
            // A colon before the last slash belongs to a registry port.
            if tag.contains('/') {
                (image_ref, DEFAULT_TAG.to_string())
            } else {
                (name, tag.to_string())
            }
        } else {
            (image_ref, DEFAULT_TAG.to_string())
        };

        if name_part.is_empty() || tag.is_empty() {
            return Err(invalid());
        }

        let (registry, repository) = match name_part.split_once('/') {
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name_part)),
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
        };

        if repository.is_empty() || repository.ends_with('/') {
            return Err(invalid());
        }

        Ok(Self {
            registry,
            repository,
            tag,
        })
    }

    /// Whether the reference pins a digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.tag.starts_with("sha256:")
    }
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("alpine", "registry-1.docker.io", "library/alpine", "latest")]
    #[case("alpine:3.19", "registry-1.docker.io", "library/alpine", "3.19")]
    #[case("myuser/myapp:v1", "registry-1.docker.io", "myuser/myapp", "v1")]
    #[case("quay.io/linbit/base:v2", "quay.io", "linbit/base", "v2")]
    #[case("localhost:5000/vms/centos", "localhost:5000", "vms/centos", "latest")]
    #[case("localhost/vms/centos:8", "localhost", "vms/centos", "8")]
    #[case(
        "ghcr.io/org/img@sha256:8575b86cb19cdff6a47b8cddc00261c34acc3faea6e120eb6eccbca867c00b4b",
        "ghcr.io",
        "org/img",
        "sha256:8575b86cb19cdff6a47b8cddc00261c34acc3faea6e120eb6eccbca867c00b4b"
    )]
    fn test_parse(
        #[case] input: &str,
        #[case] registry: &str,
        #[case] repository: &str,
        #[case] tag: &str,
    ) {
        let r = Reference::parse(input).unwrap();
        assert_eq!(r.registry, registry);
        assert_eq!(r.repository, repository);
        assert_eq!(r.tag, tag);
    }

    #[rstest]
    #[case("")]
    #[case("has space:1")]
    #[case("repo:")]
    #[case("quay.io/")]
    fn test_parse_invalid(#[case] input: &str) {
        assert!(matches!(
            Reference::parse(input),
            Err(RegistryError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_display() {
        let r: Reference = "quay.io/linbit/base:v2".parse().unwrap();
        assert_eq!(r.to_string(), "quay.io/linbit/base:v2");
        assert!(!r.is_digest());
    }
}
