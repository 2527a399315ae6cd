//! End-to-end pull and push scenarios against in-memory registries.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{cached_puller, fast_transfer_config, puller, reference, snapshot};
use skiff_core::config::RegistryInfo;
use skiff_core::descriptor::{
    Descriptor, Manifest, ANNOTATION_TITLE, OCI_CONFIG_MEDIA_TYPE, OCI_LAYER_GZIP_MEDIA_TYPE,
    OCI_MANIFEST_MEDIA_TYPE, SKIFF_LAYER_MEDIA_TYPE,
};
use skiff_core::error::SkiffError;
use skiff_core::progress::{MemoryProgress, NoopProgress};
use skiff_engine::cluster::DirectTunnel;
use skiff_engine::oci::partial::pull_paths;
use skiff_engine::oci::{MemoryRegistry, OciLayout, Remote};
use skiff_engine::{CancelToken, ImagePusher};
use tempfile::TempDir;

const BASE: &[u8] = b"shared base layer";

fn two_images_sharing_a_base() -> Arc<MemoryRegistry> {
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .seed_image(
            &reference("registry.local/team/api:v1"),
            br#"{"app":"api"}"#,
            &[BASE, b"api top layer".as_slice()],
        )
        .unwrap();
    registry
        .seed_image(
            &reference("registry.local/team/web:v1"),
            br#"{"app":"web"}"#,
            &[BASE, b"web top layer".as_slice()],
        )
        .unwrap();
    registry
}

fn images() -> Vec<String> {
    vec![
        "registry.local/team/api:v1".to_string(),
        "registry.local/team/web:v1".to_string(),
    ]
}

#[tokio::test]
async fn test_shared_base_layer_is_stored_once() {
    let dir = TempDir::new().unwrap();
    let registry = two_images_sharing_a_base();

    let report = puller(dir.path(), registry.clone())
        .pull_all(&images(), NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(report.unique_layers, 3);
    assert_eq!(report.layers_written, 3);
    // Three layers plus one config per image, each fetched exactly once
    assert_eq!(registry.blob_fetches(), 5);

    let layout = OciLayout::open(dir.path()).unwrap();
    let mut layer_digests = BTreeSet::new();
    for image in &report.images {
        let entry = layout.resolve_reference(&image.name).await.unwrap().unwrap();
        let manifest = layout.read_manifest(&entry).await.unwrap();
        for layer in &manifest.layers {
            assert!(layout.has_blob(layer).await.unwrap());
            layer_digests.insert(layer.digest.clone());
        }
    }
    assert_eq!(layer_digests.len(), 3);
    // Layers, two configs and two manifests
    assert_eq!(layout.list_blobs().await.unwrap().len(), 7);
}

#[tokio::test]
async fn test_layer_cache_serves_pull_into_new_output() {
    let cache = TempDir::new().unwrap();
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let registry = two_images_sharing_a_base();

    cached_puller(first.path(), cache.path(), registry.clone())
        .pull_all(&images(), NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();
    let fetches = registry.blob_fetches();
    assert_eq!(fetches, 5);

    let report = cached_puller(second.path(), cache.path(), registry.clone())
        .pull_all(&images(), NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(registry.blob_fetches(), fetches);
    assert_eq!(report.layers_written, 3);

    let layout = OciLayout::open(second.path()).unwrap();
    for image in &report.images {
        let entry = layout.resolve_reference(&image.name).await.unwrap().unwrap();
        let manifest = layout.read_manifest(&entry).await.unwrap();
        assert!(layout.has_blob(&manifest.config).await.unwrap());
        for layer in &manifest.layers {
            assert!(layout.has_blob(layer).await.unwrap());
        }
    }
}

#[tokio::test]
async fn test_corrupt_cache_entry_is_refetched() {
    let cache = TempDir::new().unwrap();
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let registry = two_images_sharing_a_base();

    cached_puller(first.path(), cache.path(), registry.clone())
        .pull_all(&images(), NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();
    let cache_layout = OciLayout::open(cache.path()).unwrap();
    let base = Descriptor::from_bytes(OCI_LAYER_GZIP_MEDIA_TYPE, BASE);
    // Same size, wrong content: only digest verification catches it
    std::fs::write(cache_layout.blob_path(&base.digest).unwrap(), vec![b'x'; BASE.len()]).unwrap();
    let fetches = registry.blob_fetches();

    cached_puller(second.path(), cache.path(), registry.clone())
        .pull_all(&images(), NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(registry.blob_fetches(), fetches + 1);
    let layout = OciLayout::open(second.path()).unwrap();
    assert_eq!(layout.read_blob(&base.digest).await.unwrap(), BASE);
}

#[tokio::test]
async fn test_second_pull_leaves_layout_byte_identical() {
    let dir = TempDir::new().unwrap();
    let registry = two_images_sharing_a_base();

    puller(dir.path(), registry.clone())
        .pull_all(&images(), NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();
    let first = snapshot(dir.path());

    let report = puller(dir.path(), registry)
        .pull_all(&images(), NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(report.layers_written, 0);
    assert_eq!(report.layers_skipped, 3);
    assert_eq!(snapshot(dir.path()), first);
}

#[tokio::test]
async fn test_index_order_follows_request_order() {
    let dir = TempDir::new().unwrap();
    let registry = two_images_sharing_a_base();
    let mut requested = images();
    requested.reverse();

    let report = puller(dir.path(), registry)
        .pull_all(&requested, NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();

    let layout = OciLayout::open(dir.path()).unwrap();
    let index = layout.read_index().await.unwrap();
    let digests: Vec<_> = index.manifests.iter().map(|m| m.digest.clone()).collect();
    let expected: Vec<_> = report.images.iter().map(|i| i.digest.clone()).collect();
    assert_eq!(digests, expected);
    assert_eq!(report.images[0].name, "registry.local/team/web:v1");
}

#[tokio::test]
async fn test_interrupted_write_never_reaches_final_path() {
    let dir = TempDir::new().unwrap();
    let registry = two_images_sharing_a_base();
    let base = Descriptor::from_bytes(OCI_LAYER_GZIP_MEDIA_TYPE, BASE);

    // Leftover from a crashed writer
    let stale = dir
        .path()
        .join("blobs/sha256")
        .join(format!(".{}.crashed.tmp", base.hex()));
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, &BASE[..4]).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&stale)
        .unwrap()
        .set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(2 * 3600))
        .unwrap();

    // The registry keeps serving a truncated base layer
    registry.truncate_blob(&base.digest, 6);
    let progress = MemoryProgress::new();
    let result = puller(dir.path(), registry.clone())
        .pull_all(&images(), progress.clone(), &CancelToken::never())
        .await;

    assert!(matches!(result, Err(SkiffError::Integrity { .. })));
    assert!(!stale.exists());
    let layout = OciLayout::open(dir.path()).unwrap();
    assert!(!layout.has_blob(&base).await.unwrap());
    assert!(!layout.blob_path(&base.digest).unwrap().exists());
    assert!(progress
        .warnings()
        .iter()
        .any(|w| w.contains("try clearing the image cache")));

    // Once the registry recovers, the same layout completes
    registry.clear_truncation(&base.digest);
    puller(dir.path(), registry)
        .pull_all(&images(), NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(
        std::fs::metadata(layout.blob_path(&base.digest).unwrap()).unwrap().len(),
        BASE.len() as u64
    );
}

#[tokio::test]
async fn test_pushing_same_image_twice_stores_blobs_once() {
    let dir = TempDir::new().unwrap();
    let source = two_images_sharing_a_base();
    puller(dir.path(), source)
        .pull_all(&images()[..1], NoopProgress::handle(), &CancelToken::never())
        .await
        .unwrap();
    let layout = OciLayout::open(dir.path()).unwrap();

    let target = Arc::new(MemoryRegistry::new());
    let pusher = ImagePusher::new(
        target.clone(),
        RegistryInfo {
            no_checksum: true,
            ..Default::default()
        },
        &fast_transfer_config(),
    );
    let tunnel = DirectTunnel::new("127.0.0.1:31999");

    let first = pusher
        .push_all(&layout, &images()[..1], &tunnel, NoopProgress::handle())
        .await
        .unwrap();
    let second = pusher
        .push_all(&layout, &images()[..1], &tunnel, NoopProgress::handle())
        .await
        .unwrap();

    assert_eq!(first.images[0].digest, second.images[0].digest);
    // Config plus two layers, uploaded by the first push only
    assert_eq!(target.blob_count(), 3);
    assert_eq!(target.blob_uploads(), 3);
    assert_eq!(target.manifest_uploads(), 2);
}

#[tokio::test]
async fn test_partial_pull_fetches_requested_and_well_known_paths() {
    let registry = MemoryRegistry::new();
    let package = reference("registry.local/packages/demo:1.0.0");

    let mut layers = Vec::new();
    for (title, body) in [
        ("skiff.yaml", b"kind: SkiffPackageConfig".as_slice()),
        ("checksums.txt", b"abc  images/index.json".as_slice()),
        ("components/app/values.yaml", b"replicas: 2".as_slice()),
        ("components/db/values.yaml", b"storage: 10Gi".as_slice()),
        ("images/index.json", b"{}".as_slice()),
    ] {
        let desc = registry
            .push_blob(&package, body, SKIFF_LAYER_MEDIA_TYPE)
            .await
            .unwrap()
            .with_annotation(ANNOTATION_TITLE, title);
        layers.push(desc);
    }
    let config = registry
        .push_blob(&package, b"{}", OCI_CONFIG_MEDIA_TYPE)
        .await
        .unwrap();
    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
        config,
        layers,
        annotations: Default::default(),
    };
    registry
        .push_manifest(
            &package,
            &serde_json::to_vec(&manifest).unwrap(),
            OCI_MANIFEST_MEDIA_TYPE,
        )
        .await
        .unwrap();

    let dest = TempDir::new().unwrap();
    let report = pull_paths(
        &registry,
        &package,
        dest.path(),
        &["components/app/values.yaml".to_string()],
    )
    .await
    .unwrap();

    let pulled: BTreeSet<_> = report.paths.iter().map(String::as_str).collect();
    assert_eq!(
        pulled,
        BTreeSet::from(["checksums.txt", "components/app/values.yaml", "skiff.yaml"])
    );
    assert_eq!(
        std::fs::read(dest.path().join("components/app/values.yaml")).unwrap(),
        b"replicas: 2"
    );
    assert!(!dest.path().join("components/db/values.yaml").exists());
    assert!(!dest.path().join("images/index.json").exists());
}
