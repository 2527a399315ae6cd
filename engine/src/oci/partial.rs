//! Partial pulls of packaged files.
//!
//! Non-image files ride in a package manifest as layers named by their
//! title annotation. A partial pull fetches only the requested titles plus
//! the metadata files every consumer needs.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use skiff_core::descriptor::{Descriptor, Manifest, SKIFF_LAYER_MEDIA_TYPE};
use skiff_core::error::{Result, SkiffError};
use tokio::io::AsyncWriteExt;

use super::reference::ImageReference;
use super::remote::Remote;

/// Package manifest file name.
pub const PACKAGE_YAML: &str = "skiff.yaml";
/// Package checksum file name.
pub const CHECKSUMS_TXT: &str = "checksums.txt";
/// Package signature file name.
pub const PACKAGE_YAML_SIGNATURE: &str = "skiff.yaml.sig";

/// Titles fetched by every partial pull when present.
pub const ALWAYS_PULL: [&str; 3] = [PACKAGE_YAML, CHECKSUMS_TXT, PACKAGE_YAML_SIGNATURE];

/// Successor filter keeping requested titles plus [`ALWAYS_PULL`].
#[derive(Debug, Clone)]
pub struct PartialPull {
    allowed: BTreeSet<String>,
}

impl PartialPull {
    pub fn new<I, S>(requested: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allowed: BTreeSet<String> = requested.into_iter().map(Into::into).collect();
        allowed.extend(ALWAYS_PULL.iter().map(|p| p.to_string()));
        Self { allowed }
    }

    /// Whether a descriptor survives the filter.
    pub fn includes(&self, descriptor: &Descriptor) -> bool {
        descriptor
            .title()
            .is_some_and(|title| self.allowed.contains(title))
    }

    /// Prune a node's successors to the allowed titles.
    pub fn filter_successors(&self, nodes: &[Descriptor]) -> Vec<Descriptor> {
        nodes
            .iter()
            .filter(|node| self.includes(node))
            .cloned()
            .collect()
    }
}

/// Descriptors for `paths`, failing on the first path the manifest lacks.
pub fn layers_from_paths(manifest: &Manifest, paths: &[String]) -> Result<Vec<Descriptor>> {
    paths
        .iter()
        .map(|path| {
            manifest.locate(path).cloned().ok_or_else(|| SkiffError::NotFound {
                reference: path.clone(),
                message: "path does not exist in this package".to_string(),
            })
        })
        .collect()
}

/// Outcome of [`pull_paths`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialPullReport {
    /// Titles written under the destination directory
    pub paths: Vec<String>,
    /// Declared bytes of the pulled layers plus the manifest config
    pub estimated_bytes: u64,
}

/// Fetch the requested titles (plus [`ALWAYS_PULL`]) from a package
/// manifest into `dest/<title>`. Titles missing from the manifest are
/// skipped.
pub async fn pull_paths(
    remote: &dyn Remote,
    reference: &ImageReference,
    dest: &Path,
    paths: &[String],
) -> Result<PartialPullReport> {
    let root = remote.resolve(reference).await?;
    let manifest = remote.fetch_image_manifest(reference, &root).await?;

    let filter = PartialPull::new(paths.iter().cloned());
    let layers = filter.filter_successors(&manifest.layers);
    let estimated_bytes = layers
        .iter()
        .filter_map(Descriptor::known_size)
        .sum::<u64>()
        + manifest.config.known_size().unwrap_or(0);

    tracing::info!(
        reference = %reference,
        layers = layers.len(),
        estimated_bytes,
        "Pulling package paths"
    );

    let mut pulled = Vec::with_capacity(layers.len());
    for layer in &layers {
        if let Some(title) = layer.title() {
            write_layer_file(remote, reference, layer, &safe_join(dest, title)?).await?;
            pulled.push(title.to_string());
        }
    }

    Ok(PartialPullReport {
        paths: pulled,
        estimated_bytes,
    })
}

/// Fetch a single file layer into `dest/<title>`.
pub async fn pull_layer(
    remote: &dyn Remote,
    reference: &ImageReference,
    descriptor: &Descriptor,
    dest: &Path,
) -> Result<PathBuf> {
    if descriptor.media_type != SKIFF_LAYER_MEDIA_TYPE {
        return Err(SkiffError::OciImageError(format!(
            "Invalid media type for file layer: {}",
            descriptor.media_type
        )));
    }
    let title = descriptor.title().ok_or_else(|| {
        SkiffError::OciImageError(format!("Layer {} has no title", descriptor.digest))
    })?;
    let target = safe_join(dest, title)?;
    write_layer_file(remote, reference, descriptor, &target).await?;
    Ok(target)
}

async fn write_layer_file(
    remote: &dyn Remote,
    reference: &ImageReference,
    descriptor: &Descriptor,
    target: &Path,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(target).await?;
    let written = remote.fetch_blob(reference, descriptor, &mut file).await?;
    file.flush().await?;

    if let Some(expected) = descriptor.known_size() {
        if written != expected {
            let _ = tokio::fs::remove_file(target).await;
            return Err(SkiffError::Integrity {
                digest: descriptor.digest.clone(),
                expected: descriptor.size,
                actual: written,
            });
        }
    }
    Ok(())
}

/// Join a title under `dest`, refusing escapes from it.
fn safe_join(dest: &Path, title: &str) -> Result<PathBuf> {
    let relative = Path::new(title);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || title.is_empty() {
        return Err(SkiffError::OciImageError(format!(
            "Refusing layer title outside destination: {}",
            title
        )));
    }
    Ok(dest.join(relative))
}
