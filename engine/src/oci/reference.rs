//! OCI image reference parsing.
//!
//! Parses image references like `ghcr.io/org/app:v1.0` into structured
//! components, and derives the rewritten names used when images are
//! relocated into an airgapped registry.

use skiff_core::descriptor::split_digest;
use skiff_core::error::{Result, SkiffError};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
///
/// Values are derived from the original string and never edited in place;
/// host rewrites produce a freshly parsed reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, with port if any (e.g., "ghcr.io", "127.0.0.1:31999")
    pub host: String,
    /// Repository path (e.g., "library/nginx")
    pub path: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
    /// `:tag` or `@digest`, with the digest winning when both are present
    pub tag_or_digest: String,
    /// The string this reference was parsed from
    pub reference: String,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `myuser/myimage:v1` → docker.io/myuser/myimage:v1
    /// - `registry.local:5000/org/image:tag`
    /// - `ghcr.io/org/image@sha256:abc...`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SkiffError::OciImageError(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                split_digest(digest).map_err(|_| {
                    SkiffError::OciImageError(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    ))
                })?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        if let Some(ref t) = tag {
            if t.is_empty() {
                return Err(SkiffError::OciImageError(format!(
                    "Empty tag in reference '{}'",
                    reference
                )));
            }
        }

        let (host, path) = split_host_path(name, reference)?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        let tag_or_digest = match (&digest, &tag) {
            (Some(d), _) => format!("@{}", d),
            (None, Some(t)) => format!(":{}", t),
            (None, None) => String::new(),
        };

        Ok(ImageReference {
            host,
            path,
            tag,
            digest,
            tag_or_digest,
            reference: reference.to_string(),
        })
    }

    /// Repository name including the host (`host/path`).
    pub fn name(&self) -> String {
        format!("{}/{}", self.host, self.path)
    }

    /// Normalized full reference (`host/path:tag@digest`).
    pub fn full_reference(&self) -> String {
        let mut s = self.name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Path plus tag or digest, without the host. Used to address images
    /// served by a registry whose host differs per environment.
    pub fn host_less(&self) -> String {
        format!("{}{}", self.path, self.tag_or_digest)
    }

    /// Re-parse this reference under a different registry host.
    pub fn with_host(&self, host: &str) -> Result<Self> {
        Self::parse(&format!("{}/{}", host.trim_end_matches('/'), self.host_less()))
    }

    /// Relocate onto `target` without a checksum suffix: `target/path{tag_or_digest}`.
    pub fn transform_host_without_checksum(&self, target: &str) -> Result<Self> {
        self.with_host(target)
    }

    /// Relocate onto `target` with a collision-resistant repository name:
    /// `target/path-<crc32(host/path)>:tag`.
    ///
    /// Digest-pinned references are already unambiguous and keep their path.
    /// References already living on `target` are returned unchanged.
    pub fn transform_host(&self, target: &str) -> Result<Self> {
        let target = target.trim_end_matches('/');
        if self.host == target {
            return Ok(self.clone());
        }
        if self.digest.is_some() {
            return self.with_host(target);
        }
        Self::parse(&format!(
            "{}/{}-{}{}",
            target,
            self.path,
            name_checksum(&self.name()),
            self.tag_or_digest
        ))
    }
}

/// Decimal CRC32 (IEEE) of a repository name.
pub fn name_checksum(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}

/// Split `name[:tag]`, where the tag colon must follow the last `/`.
fn split_tag(name_tag: &str) -> (&str, Option<String>) {
    let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    let last_segment = &name_tag[last_segment_start..];
    match last_segment.rfind(':') {
        Some(colon) => (
            &name_tag[..last_segment_start + colon],
            Some(last_segment[colon + 1..].to_string()),
        ),
        None => (name_tag, None),
    }
}

/// Split a name into host and repository path components.
fn split_host_path(name: &str, reference: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        // First component is a host if it looks like one
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(SkiffError::OciImageError(format!(
                    "Empty repository in reference '{}'",
                    reference
                )));
            }
            let path = if first == DEFAULT_REGISTRY && !rest.contains('/') {
                format!("library/{}", rest)
            } else {
                rest.to_string()
            };
            return Ok((first.to_string(), path));
        }
    }

    if name.is_empty() {
        return Err(SkiffError::OciImageError(format!(
            "Empty repository in reference '{}'",
            reference
        )));
    }

    let path = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), path))
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.host, "docker.io");
        assert_eq!(r.path, "library/nginx");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.tag_or_digest, ":latest");
        assert_eq!(r.reference, "nginx");
    }

    #[test]
    fn test_parse_user_repo_with_tag() {
        let r = ImageReference::parse("myuser/myimage:v1.0").unwrap();
        assert_eq!(r.host, "docker.io");
        assert_eq!(r.path, "myuser/myimage");
        assert_eq!(r.tag_or_digest, ":v1.0");
    }

    #[test]
    fn test_parse_numeric_tag() {
        let r = ImageReference::parse("redis:7").unwrap();
        assert_eq!(r.path, "library/redis");
        assert_eq!(r.tag.as_deref(), Some("7"));
    }

    #[test]
    fn test_parse_explicit_docker_hub_single_name() {
        let r = ImageReference::parse("docker.io/nginx:1.25").unwrap();
        assert_eq!(r.path, "library/nginx");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("127.0.0.1:31999/stefanprodan/podinfo:6.4.0").unwrap();
        assert_eq!(r.host, "127.0.0.1:31999");
        assert_eq!(r.path, "stefanprodan/podinfo");
        assert_eq!(r.tag, Some("6.4.0".to_string()));
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = ImageReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.host, "localhost");
        assert_eq!(r.path, "myimage");
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app@{}", DIGEST)).unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some(DIGEST));
        assert_eq!(r.tag_or_digest, format!("@{}", DIGEST));
    }

    #[test]
    fn test_parse_tag_and_digest_prefers_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app:v1@{}", DIGEST)).unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.tag_or_digest, format!("@{}", DIGEST));
        assert_eq!(r.full_reference(), format!("ghcr.io/org/app:v1@{}", DIGEST));
    }

    #[test]
    fn test_parse_errors() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("nginx@invaliddigest").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
    }

    #[test]
    fn test_display_and_from_str() {
        let r: ImageReference = "nginx:1.25".parse().unwrap();
        assert_eq!(format!("{}", r), "docker.io/library/nginx:1.25");
    }

    #[test]
    fn test_with_host_reparses() {
        let r = ImageReference::parse("ghcr.io/org/sub/app:v1").unwrap();
        let moved = r.with_host("mirror.local:5000").unwrap();
        assert_eq!(moved.host, "mirror.local:5000");
        assert_eq!(moved.path, "org/sub/app");
        assert_eq!(moved.reference, "mirror.local:5000/org/sub/app:v1");
    }

    #[test]
    fn test_transform_host_without_checksum() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        let moved = r.transform_host_without_checksum("127.0.0.1:31999").unwrap();
        assert_eq!(moved.reference, "127.0.0.1:31999/library/nginx:1.25");
    }

    #[test]
    fn test_transform_host_with_checksum() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        let moved = r.transform_host("127.0.0.1:31999").unwrap();
        let checksum = name_checksum("docker.io/library/nginx");
        assert_eq!(
            moved.reference,
            format!("127.0.0.1:31999/library/nginx-{}:1.25", checksum)
        );
        assert_eq!(moved.tag.as_deref(), Some("1.25"));
    }

    #[test]
    fn test_transform_host_checksum_distinguishes_sources() {
        let a = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        let b = ImageReference::parse("quay.io/org/app:v1").unwrap();
        assert_ne!(
            a.transform_host("registry.local").unwrap().path,
            b.transform_host("registry.local").unwrap().path
        );
    }

    #[test]
    fn test_transform_host_digest_has_no_checksum() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app@{}", DIGEST)).unwrap();
        let moved = r.transform_host("registry.local").unwrap();
        assert_eq!(moved.reference, format!("registry.local/org/app@{}", DIGEST));
    }

    #[test]
    fn test_transform_host_same_target_unchanged() {
        let r = ImageReference::parse("registry.local/org/app:v1").unwrap();
        assert_eq!(r.transform_host("registry.local").unwrap(), r);
    }

    #[test]
    fn test_name_checksum_is_crc32_ieee() {
        // Check value of the IEEE polynomial
        assert_eq!(name_checksum("123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_host_less() {
        let r = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        assert_eq!(r.host_less(), "org/app:v1");
    }
}
