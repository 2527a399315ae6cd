//! Seed image staging.
//!
//! Copies the images the seed registry must serve out of a package layout
//! into a layout of their own. The injector serves that layout on loopback,
//! so images are recorded by their host-less name.

use std::collections::BTreeMap;
use std::path::Path;

use skiff_core::descriptor::{is_index_media_type, Descriptor, ANNOTATION_BASE_IMAGE_NAME};
use skiff_core::error::{Result, SkiffError};

use crate::oci::{ImageReference, OciLayout};
use crate::transfer::CancelToken;

/// Stage `seed_refs` from `package` into a new layout at `seed_dir`.
///
/// Returns the parsed seed references in input order.
pub async fn load_seed_images(
    package: &OciLayout,
    seed_refs: &[String],
    seed_dir: &Path,
    cancel: &CancelToken,
) -> Result<Vec<ImageReference>> {
    let seed = OciLayout::open(seed_dir)?;
    let mut references = BTreeMap::new();
    let mut seeds = Vec::with_capacity(seed_refs.len());

    for requested in seed_refs {
        let reference = ImageReference::parse(requested)?;
        let root = package
            .resolve_reference(requested)
            .await?
            .ok_or_else(|| SkiffError::NotFound {
                reference: requested.clone(),
                message: format!("seed image not present in {}", package.root().display()),
            })?;
        if is_index_media_type(&root.media_type) {
            return Err(SkiffError::OciImageError(format!(
                "Seed image {} must resolve to a single-platform manifest",
                requested
            )));
        }

        let manifest = package.read_manifest(&root).await?;
        for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            copy_blob(package, &seed, blob, cancel).await?;
        }
        copy_blob(package, &seed, &root, cancel).await?;

        let mut entry = root.clone();
        entry.annotations.remove(ANNOTATION_BASE_IMAGE_NAME);
        seed.add_manifest(entry).await?;

        tracing::debug!(
            image = %requested,
            name = %reference.host_less(),
            layers = manifest.layers.len(),
            "Staged seed image"
        );
        references.insert(reference.host_less(), root.digest.clone());
        seeds.push(reference);
    }

    seed.annotate_references(&references).await?;
    tracing::info!(images = seeds.len(), dir = %seed_dir.display(), "Seed images staged");
    Ok(seeds)
}

async fn copy_blob(
    from: &OciLayout,
    to: &OciLayout,
    descriptor: &Descriptor,
    cancel: &CancelToken,
) -> Result<()> {
    if to.has_blob(descriptor).await? {
        return Ok(());
    }
    let file = from.open_blob(&descriptor.digest).await?;
    to.write_blob(descriptor, file, cancel).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{MemoryRegistry, Remote};
    use crate::transfer::pull::fetch_into_layout;
    use skiff_core::descriptor::Manifest;
    use tempfile::TempDir;

    async fn stage(layout: &OciLayout, name: &str, layers: &[&[u8]]) -> Descriptor {
        let registry = MemoryRegistry::new();
        let reference = ImageReference::parse(name).unwrap();
        let root = registry.seed_image(&reference, b"{}", layers).unwrap();
        let raw = registry.fetch_manifest(&reference, &root).await.unwrap();
        let manifest = Manifest::from_slice(&raw).unwrap();
        for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            fetch_into_layout(layout, &registry, &reference, blob, &CancelToken::never())
                .await
                .unwrap();
        }
        layout.write_blob_bytes(&root, &raw).await.unwrap();
        layout.add_manifest(root.clone()).await.unwrap();
        let mut refs = BTreeMap::new();
        refs.insert(name.to_string(), root.digest.clone());
        layout.annotate_references(&refs).await.unwrap();
        root
    }

    #[tokio::test]
    async fn test_load_seed_images_by_host_less_name() {
        let dir = TempDir::new().unwrap();
        let package = OciLayout::open(dir.path().join("package")).unwrap();
        let root = stage(&package, "docker.io/library/registry:2.8", &[b"registry".as_slice()]).await;
        stage(&package, "ghcr.io/org/app:v1", &[b"app".as_slice()]).await;

        let seeds = load_seed_images(
            &package,
            &["docker.io/library/registry:2.8".to_string()],
            &dir.path().join("seed"),
            &CancelToken::never(),
        )
        .await
        .unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].host_less(), "library/registry:2.8");

        let seed = OciLayout::open(dir.path().join("seed")).unwrap();
        let entry = seed.resolve_reference("library/registry:2.8").await.unwrap().unwrap();
        assert_eq!(entry.digest, root.digest);
        let manifest = seed.read_manifest(&entry).await.unwrap();
        assert!(seed.has_blob(&manifest.layers[0]).await.unwrap());
        // Only the seed image's config, layer and manifest
        assert_eq!(seed.list_blobs().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_seed_image() {
        let dir = TempDir::new().unwrap();
        let package = OciLayout::open(dir.path().join("package")).unwrap();
        let result = load_seed_images(
            &package,
            &["docker.io/library/registry:2.8".to_string()],
            &dir.path().join("seed"),
            &CancelToken::never(),
        )
        .await;
        assert!(matches!(result, Err(SkiffError::NotFound { .. })));
    }
}
