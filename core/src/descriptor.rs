//! OCI content descriptor model.
//!
//! Immutable value types shared by every component: descriptors, image
//! manifests, and image indexes. Two descriptors with equal digests are
//! assumed to describe byte-identical content.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SkiffError};

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_TAR_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Media type for non-image files packaged alongside images.
pub const SKIFF_LAYER_MEDIA_TYPE: &str = "application/vnd.skiff.layer.v1.blob";

pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";
pub const ANNOTATION_BASE_IMAGE_NAME: &str = "org.opencontainers.image.base.name";
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Declared size of content whose length cannot be known in advance.
pub const UNKNOWN_SIZE: i64 = -1;

/// Whether a media type names an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == OCI_INDEX_MEDIA_TYPE || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
}

/// Compute the `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Split a digest into `(algorithm, hex)`, validating its shape.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
        SkiffError::OciImageError(format!(
            "Invalid digest '{}': expected algorithm:hex",
            digest
        ))
    })?;
    if algorithm.is_empty()
        || encoded.is_empty()
        || !encoded.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(SkiffError::OciImageError(format!(
            "Invalid digest '{}': expected algorithm:hex",
            digest
        )));
    }
    Ok((algorithm, encoded))
}

/// Hex portion of a digest (`sha256:abc` → `abc`).
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// Algorithm portion of a digest, `sha256` when absent.
pub fn digest_algorithm(digest: &str) -> &str {
    digest.split_once(':').map(|(algo, _)| algo).unwrap_or("sha256")
}

/// An OCI content pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            annotations: BTreeMap::new(),
            platform: None,
        }
    }

    /// Describe an in-memory blob.
    pub fn from_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, sha256_digest(data), data.len() as i64)
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// The `org.opencontainers.image.title` annotation, if any.
    pub fn title(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_TITLE).map(String::as_str)
    }

    pub fn hex(&self) -> &str {
        digest_hex(&self.digest)
    }

    /// Declared size, or `None` when it is unknown.
    pub fn known_size(&self) -> Option<u64> {
        u64::try_from(self.size).ok()
    }
}

/// Target platform of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// An OCI image manifest (or Docker v2 schema 2 manifest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            SkiffError::OciImageError(format!("Failed to parse image manifest: {}", e))
        })
    }

    /// Map of title annotation → layer descriptor.
    pub fn title_index(&self) -> BTreeMap<&str, &Descriptor> {
        self.layers
            .iter()
            .filter_map(|layer| layer.title().map(|title| (title, layer)))
            .collect()
    }

    /// Find the layer carrying the given title annotation.
    pub fn locate(&self, title: &str) -> Option<&Descriptor> {
        self.layers.iter().find(|layer| layer.title() == Some(title))
    }

    /// Sum of declared layer sizes (unknown sizes count as zero).
    pub fn layers_size(&self) -> u64 {
        self.layers.iter().filter_map(Descriptor::known_size).sum()
    }
}

/// An OCI image index (or Docker manifest list).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    pub fn new() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_INDEX_MEDIA_TYPE.to_string()),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SkiffError::OciImageError(format!("Failed to parse image index: {}", e)))
    }

    /// Pick the first entry matching `os` and any of `architectures`.
    pub fn select_platform(&self, os: &str, architectures: &[String]) -> Option<&Descriptor> {
        architectures.iter().find_map(|arch| {
            self.manifests.iter().find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .is_some_and(|p| p.os == os && &p.architecture == arch)
            })
        })
    }
}

/// Map the host CPU architecture onto OCI platform naming.
pub fn host_architecture() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
    .to_string()
}
